use core::cmp;

use bytes::{Buf, BytesMut};

use crate::error::ParseError;

/// Decoder for the response body framings a client can receive.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TransferCoding {
    /// `content-length` framed body with the remaining byte count.
    Length(u64),
    /// `transfer-encoding: chunked` framed body.
    Chunked(ChunkedState, u64),
    /// body runs until the peer closes the connection.
    Eof,
    /// no body at all (HEAD, 1xx, 204, 304).
    PlainEof,
}

impl TransferCoding {
    pub(crate) const fn eof() -> Self {
        Self::PlainEof
    }

    pub(crate) const fn length(len: u64) -> Self {
        Self::Length(len)
    }

    pub(crate) const fn chunked() -> Self {
        Self::Chunked(ChunkedState::Size, 0)
    }

    /// a close delimited body forces the connection shut after this response.
    pub(crate) fn is_close_delimited(&self) -> bool {
        matches!(self, Self::Eof)
    }

    /// feed buffered bytes through the decoder, appending decoded body bytes
    /// to `dst`. returns true when the body is complete, false when more input
    /// is needed.
    pub(crate) fn decode(&mut self, src: &mut BytesMut, dst: &mut BytesMut) -> Result<bool, ParseError> {
        match self {
            Self::PlainEof => Ok(true),
            Self::Length(rem) => {
                if *rem == 0 {
                    return Ok(true);
                }
                if src.is_empty() {
                    return Ok(false);
                }
                let n = cmp::min(*rem, src.len() as u64) as usize;
                dst.extend_from_slice(&src[..n]);
                src.advance(n);
                *rem -= n as u64;
                Ok(*rem == 0)
            }
            Self::Eof => {
                if !src.is_empty() {
                    dst.extend_from_slice(src);
                    src.clear();
                }
                // completion is the peer closing. caller observes the eof.
                Ok(false)
            }
            Self::Chunked(state, rem) => decode_chunked(state, rem, src, dst),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum ChunkedState {
    Size,
    SizeLws,
    Extension,
    SizeLf,
    Body,
    BodyCr,
    BodyLf,
    Trailer,
    TrailerLf,
    EndCr,
    EndLf,
    End,
}

fn decode_chunked(
    state: &mut ChunkedState,
    rem: &mut u64,
    src: &mut BytesMut,
    dst: &mut BytesMut,
) -> Result<bool, ParseError> {
    use ChunkedState::*;

    loop {
        if *state == End {
            return Ok(true);
        }

        if *state == Body {
            if *rem > 0 {
                if src.is_empty() {
                    return Ok(false);
                }
                let n = cmp::min(*rem, src.len() as u64) as usize;
                dst.extend_from_slice(&src[..n]);
                src.advance(n);
                *rem -= n as u64;
                if *rem > 0 {
                    // src drained mid chunk.
                    return Ok(false);
                }
            }
            *state = BodyCr;
            continue;
        }

        let Some(&b) = src.first() else {
            return Ok(false);
        };
        src.advance(1);

        *state = match *state {
            Size => match b {
                b'0'..=b'9' => {
                    push_hex(rem, b - b'0')?;
                    Size
                }
                b'a'..=b'f' => {
                    push_hex(rem, b + 10 - b'a')?;
                    Size
                }
                b'A'..=b'F' => {
                    push_hex(rem, b + 10 - b'A')?;
                    Size
                }
                b'\t' | b' ' => SizeLws,
                b';' => Extension,
                b'\r' => SizeLf,
                _ => return Err(ParseError::ChunkSize),
            },
            SizeLws => match b {
                b'\t' | b' ' => SizeLws,
                b';' => Extension,
                b'\r' => SizeLf,
                _ => return Err(ParseError::ChunkSize),
            },
            Extension => match b {
                b'\r' => SizeLf,
                // strictly speaking a bare LF terminates nothing valid here.
                b'\n' => return Err(ParseError::ChunkSize),
                _ => Extension,
            },
            SizeLf => match b {
                b'\n' if *rem == 0 => EndCr,
                b'\n' => Body,
                _ => return Err(ParseError::ChunkSize),
            },
            BodyCr => match b {
                b'\r' => BodyLf,
                _ => return Err(ParseError::ChunkSize),
            },
            BodyLf => match b {
                b'\n' => Size,
                _ => return Err(ParseError::ChunkSize),
            },
            Trailer => match b {
                b'\r' => TrailerLf,
                _ => Trailer,
            },
            TrailerLf => match b {
                b'\n' => EndCr,
                _ => return Err(ParseError::ChunkSize),
            },
            EndCr => match b {
                b'\r' => EndLf,
                _ => Trailer,
            },
            EndLf => match b {
                b'\n' => End,
                _ => return Err(ParseError::ChunkSize),
            },
            Body | End => unreachable!("handled above"),
        };
    }
}

fn push_hex(rem: &mut u64, digit: u8) -> Result<(), ParseError> {
    *rem = rem
        .checked_mul(16)
        .and_then(|v| v.checked_add(u64::from(digit)))
        .ok_or(ParseError::ChunkSize)?;
    Ok(())
}
