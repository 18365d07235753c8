use core::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use pin_project_lite::pin_project;
use tokio::time::{sleep_until, Instant, Sleep};

pub(crate) trait Timeout: Sized {
    fn timeout(self, timer: Pin<&mut Sleep>) -> TimeoutFuture<'_, Self> {
        TimeoutFuture { fut: self, timer }
    }
}

impl<F: Future> Timeout for F {}

pin_project! {
    pub(crate) struct TimeoutFuture<'a, F> {
        #[pin]
        fut: F,
        timer: Pin<&'a mut Sleep>
    }
}

impl<F> Future for TimeoutFuture<'_, F>
where
    F: Future,
{
    type Output = Result<F::Output, ()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        match this.fut.poll(cx) {
            Poll::Ready(res) => Poll::Ready(Ok(res)),
            Poll::Pending => this.timer.as_mut().poll(cx).map(|_| Err(())),
        }
    }
}

/// one timer per call, threaded through the acquire/dial/handshake/request
/// phases. the deadline is absolute so later phases see only the remaining
/// budget.
pub(crate) enum Timer {
    At(Pin<Box<Sleep>>),
    Unbounded,
}

impl Timer {
    pub(crate) fn deadline(at: Instant) -> Self {
        Self::At(Box::pin(sleep_until(at)))
    }

    pub(crate) const fn unbounded() -> Self {
        Self::Unbounded
    }

    pub(crate) fn is_bounded(&self) -> bool {
        matches!(self, Self::At(_))
    }

    /// run `fut` to completion or until the deadline, whichever is first.
    pub(crate) async fn bound<F: Future>(&mut self, fut: F) -> Result<F::Output, ()> {
        match self {
            Self::Unbounded => Ok(fut.await),
            Self::At(sleep) => fut.timeout(sleep.as_mut()).await,
        }
    }
}
