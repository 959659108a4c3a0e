//! Wire protocol between the coordinator and each peer listener
//!
//! One TCP connection per peer carries back-to-back JSON objects with no
//! framing between them: a request, then exactly one response, repeated.
//! The request kind travels as a plain string so a listener can answer an
//! unrecognized kind with an ERROR response instead of dropping the
//! connection.

use std::io;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::topology::TopologyUpdate;

// ----------------------------------------------------------------------------
// Messages
// ----------------------------------------------------------------------------

pub const REQUEST_START: &str = "START";
pub const REQUEST_SHUTDOWN: &str = "SHUTDOWN";
pub const REQUEST_TOPOLOGY_UPDATE: &str = "TOPOLOGY_UPDATE";

/// A command from the coordinator to a peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlRequest {
    /// Request kind; one of the `REQUEST_*` constants for well-known kinds.
    #[serde(rename = "type")]
    pub kind: String,

    /// Request-specific payload: the absolute start time in epoch
    /// milliseconds for START, a [`TopologyUpdate`] for TOPOLOGY_UPDATE,
    /// absent for SHUTDOWN.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl ControlRequest {
    pub fn start(start_time_ms: u64) -> Self {
        ControlRequest {
            kind: REQUEST_START.to_owned(),
            payload: Some(serde_json::Value::from(start_time_ms)),
        }
    }

    pub fn shutdown() -> Self {
        ControlRequest {
            kind: REQUEST_SHUTDOWN.to_owned(),
            payload: None,
        }
    }

    pub fn topology_update(update: &TopologyUpdate) -> serde_json::Result<Self> {
        Ok(ControlRequest {
            kind: REQUEST_TOPOLOGY_UPDATE.to_owned(),
            payload: Some(serde_json::to_value(update)?),
        })
    }
}

/// Status of a [`ControlResponse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseStatus {
    Ok,
    Error,
}

/// The single reply a peer sends for every request it reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlResponse {
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ControlResponse {
    pub fn ok() -> Self {
        ControlResponse {
            status: ResponseStatus::Ok,
            message: None,
        }
    }

    pub fn ok_with_message(message: impl Into<String>) -> Self {
        ControlResponse {
            status: ResponseStatus::Ok,
            message: Some(message.into()),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ControlResponse {
            status: ResponseStatus::Error,
            message: Some(message.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok
    }
}

// ----------------------------------------------------------------------------
// Streaming codec
// ----------------------------------------------------------------------------

/// Duplex codec for unframed, concatenated JSON values over a byte stream.
///
/// Values are written with no delimiter; the reader parses incrementally out
/// of a growing buffer, so `{"a":1}{"b":2}` arriving in one segment or byte
/// by byte both decode correctly.
pub struct JsonStream<S> {
    stream: S,
    buf: Vec<u8>,
}

impl<S> JsonStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        JsonStream {
            stream,
            buf: Vec::new(),
        }
    }

    /// Serialize one value and flush it to the stream.
    pub async fn send<T: Serialize>(&mut self, value: &T) -> io::Result<()> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.stream.write_all(&bytes).await?;
        self.stream.flush().await
    }

    /// Read the next JSON value from the stream.
    ///
    /// Returns `Ok(None)` on a clean end of stream (the peer closed the
    /// connection between values); an EOF in the middle of a value is an
    /// error.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> io::Result<Option<T>> {
        loop {
            if let Some((value, consumed)) = self.try_parse()? {
                self.buf.drain(..consumed);
                return Ok(Some(value));
            }

            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                if self.buf.iter().all(u8::is_ascii_whitespace) {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed in the middle of a JSON value",
                ));
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Attempt to decode one complete value from the front of the buffer.
    fn try_parse<T: DeserializeOwned>(&self) -> io::Result<Option<(T, usize)>> {
        let mut values = serde_json::Deserializer::from_slice(&self.buf).into_iter::<T>();
        match values.next() {
            Some(Ok(value)) => {
                let consumed = values.byte_offset();
                Ok(Some((value, consumed)))
            }
            // incomplete value, need more bytes
            Some(Err(e)) if e.is_eof() => Ok(None),
            Some(Err(e)) => Err(io::Error::new(io::ErrorKind::InvalidData, e)),
            // buffer holds only whitespace
            None => Ok(None),
        }
    }
}
