use std::time::Duration;

use thiserror::Error;

use crate::codec::{Address, CodecError, Quantity};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Connection refused/reset or other transport failure; retried on the
    /// next poll cycle, never fatal to the hub.
    #[error("transport: {0}")]
    Transport(#[from] tokio_modbus::Error),

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The server answered with a Modbus exception.
    #[error("modbus exception: {0}")]
    Exception(tokio_modbus::Exception),

    /// Response length does not cover the requested register span.
    #[error("expected {expected} registers in response, got {actual}")]
    UnexpectedLength { expected: Quantity, actual: usize },

    #[error("no device registered for unit {0}")]
    UnknownDevice(u8),

    #[error("registers {addr}+{count} exceed the store bounds")]
    OutOfRange { addr: Address, count: Quantity },

    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Write value outside the field's absolute bounds even after clamping.
    #[error("value {value} outside bounds {min}..={max}")]
    Validation { value: f32, min: f32, max: f32 },

    #[error("configuration: {0}")]
    Config(String),
}

impl Error {
    /// Transport-class errors invalidate the connection and trigger a
    /// reconnect on the next cycle; everything else leaves it open.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::Io(_) | Error::Timeout(_)
        )
    }
}
