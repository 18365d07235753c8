//! a pooled and pipelined http/1.1 client core
//!
//! # Quick Start
//! ```no_run
//! use fleethttp::{error::Error, Client};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     // build client with default settings.
//!     let client = Client::new();
//!     // send get request and wait for the full response.
//!     let res = client.get("http://example.com/").await?;
//!     // response body is fully buffered.
//!     Ok(println!("{}", String::from_utf8_lossy(res.body())))
//! }
//! ```
//!
//! # Layers
//! - [HostClient]: per origin connection pool with idempotence aware retry
//!   and deadline enforcement across every phase of a call.
//! - [Client]: routes requests to host clients by scheme and authority,
//!   creating and garbage collecting them on demand, with tls handshaking
//!   when the scheme requires it.
//! - [PipelineClient]: per origin http/1.1 pipelining over a fixed set of
//!   long lived connections, trading strict request/response turn taking for
//!   round trip amortization.

#![forbid(unsafe_code)]

mod builder;
mod client;
mod connect;
mod connection;
mod host;
mod pipeline;
mod pool;
mod proto;
mod timeout;
mod tls;

pub mod error;

pub use self::builder::ClientBuilder;
pub use self::client::Client;
pub use self::connect::Dial;
pub use self::connection::{ConnStream, Io};
pub use self::host::{HostClient, HostClientBuilder};
pub use self::pipeline::{PipelineClient, PipelineClientBuilder};
pub use self::tls::{Connector, TlsConnect};

pub use self::error::Error;

/// request type accepted by every client: [http::Request] with a fully
/// buffered body.
pub type Request = http::Request<bytes::Bytes>;

/// response type returned by every client: [http::Response] with a fully
/// buffered body. errors never surface partial responses.
pub type Response = http::Response<bytes::Bytes>;

// re-export http crate.
pub use http;

// re-export bytes crate.
pub use bytes;
