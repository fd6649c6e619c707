use crate::net::connection::ConnectionState;
use crate::net::support::{ErrorType, NetworkError};
use rmpv::Value;
use std::time::Duration;
use thiserror::Error;

/// Numeric codes carried in RPC error envelopes and surfaced by the public
/// error type.
pub mod code {
    /// Unexpected handler failure.
    pub const HANDLER_ERROR: i64 = 1001;
    /// Request payload is not the expected shape.
    pub const VALIDATION_PAYLOAD: i64 = 2000;
    /// Params field is not a map.
    pub const VALIDATION_PARAMS: i64 = 2001;
    /// Message payload failed shape validation.
    pub const VALIDATION_MESSAGE: i64 = 2002;
    /// Authentication rejected by the server.
    pub const AUTH_FAILED: i64 = 3001;
    /// No RPC method registered under the requested name.
    pub const METHOD_NOT_FOUND: i64 = 4000;
    /// Params did not match the registered schema.
    pub const INVALID_PARAMS: i64 = 4001;
    /// Operation attempted outside an active connection, or the connection
    /// died with calls in flight.
    pub const NOT_CONNECTED: i64 = 5000;
    /// RPC call deadline expired.
    pub const RPC_TIMEOUT: i64 = 5001;
    /// Reserved for future flow-control rejections.
    pub const RATE_LIMITED: i64 = 6000;
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The peer violated the wire protocol; fatal to the connection.
    #[error("protocol violation: {0:?}")]
    Protocol(ErrorType),

    /// The underlying byte stream failed; fatal to the connection.
    #[error("transport failure: {0:?}")]
    Transport(ErrorType),

    /// The password handshake was rejected or timed out.
    #[error("authentication rejected: {reason}")]
    Authentication { reason: String, retry_allowed: bool },

    /// A transition outside the legal table was requested. Programmer error;
    /// state is left untouched.
    #[error("illegal connection state transition {from:?} -> {to:?}")]
    State {
        from: ConnectionState,
        to: ConnectionState,
    },

    /// Send or call attempted before the connection reached ACTIVE, or after
    /// it left.
    #[error("connection is not active")]
    NotConnected,

    /// The RPC call deadline expired with no response.
    #[error("rpc call timed out after {0:?}")]
    RpcTimeout(Duration),

    /// The connection died while the operation was pending.
    #[error("connection lost")]
    ConnectionLost,

    /// The remote side answered with an error envelope.
    #[error("remote fault {code}: {message}")]
    Remote {
        code: i64,
        message: String,
        details: Option<Value>,
    },

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Numeric code for errors that map onto the envelope taxonomy.
    pub fn code(&self) -> Option<i64> {
        match self {
            Error::Authentication { .. } => Some(code::AUTH_FAILED),
            Error::NotConnected => Some(code::NOT_CONNECTED),
            Error::ConnectionLost => Some(code::NOT_CONNECTED),
            Error::RpcTimeout(_) => Some(code::RPC_TIMEOUT),
            Error::Remote { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<NetworkError> for Error {
    fn from(err: NetworkError) -> Self {
        match err {
            // Wait never escapes the driver; treat a leak as an I/O stall.
            NetworkError::Wait => Error::Transport(ErrorType::Io(std::io::ErrorKind::WouldBlock)),
            NetworkError::Fatal(kind) => match kind {
                ErrorType::ClosedByPeer | ErrorType::Timeout | ErrorType::AddrParse | ErrorType::Io(_) => {
                    Error::Transport(kind)
                }
                kind => Error::Protocol(kind),
            },
        }
    }
}

/// Failure returned by a message or RPC handler. Converted into an RPC_ERROR
/// envelope; never propagates into the receive pipeline.
#[derive(Debug, Clone)]
pub struct HandlerFault {
    pub code: i64,
    pub message: String,
    pub details: Option<Value>,
}

impl HandlerFault {
    pub fn new<S: Into<String>>(message: S) -> HandlerFault {
        HandlerFault {
            code: code::HANDLER_ERROR,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_code<S: Into<String>>(code: i64, message: S) -> HandlerFault {
        HandlerFault {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details<S: Into<String>>(code: i64, message: S, details: Value) -> HandlerFault {
        HandlerFault {
            code,
            message: message.into(),
            details: Some(details),
        }
    }
}

impl From<String> for HandlerFault {
    fn from(message: String) -> Self {
        HandlerFault::new(message)
    }
}

impl From<&str> for HandlerFault {
    fn from(message: &str) -> Self {
        HandlerFault::new(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_error_classification() {
        let err: Error = NetworkError::Fatal(ErrorType::BadMagic).into();
        match err {
            Error::Protocol(ErrorType::BadMagic) => (),
            err => panic!("Unexpected mapping {:?}", err),
        }

        let err: Error = NetworkError::Fatal(ErrorType::ClosedByPeer).into();
        match err {
            Error::Transport(ErrorType::ClosedByPeer) => (),
            err => panic!("Unexpected mapping {:?}", err),
        }
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            Error::Authentication {
                reason: "bad password".into(),
                retry_allowed: false
            }
            .code(),
            Some(code::AUTH_FAILED)
        );
        assert_eq!(Error::NotConnected.code(), Some(code::NOT_CONNECTED));
        assert_eq!(
            Error::RpcTimeout(Duration::from_secs(30)).code(),
            Some(code::RPC_TIMEOUT)
        );
        assert_eq!(Error::ConnectionLost.code(), Some(code::NOT_CONNECTED));
        assert_eq!(Error::Protocol(ErrorType::BadMagic).code(), None);
    }

    #[test]
    fn test_handler_fault_conversions() {
        let fault: HandlerFault = "boom".into();
        assert_eq!(fault.code, code::HANDLER_ERROR);
        assert_eq!(fault.message, "boom");

        let fault = HandlerFault::with_code(code::INVALID_PARAMS, "bad args");
        assert_eq!(fault.code, code::INVALID_PARAMS);
    }
}
