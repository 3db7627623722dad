//! Error type shared by the parser, the storage engines and Raft.

use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// Errors are serializable so they can be returned to clients through Raft.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// The operation was aborted and must be retried, e.g. a Raft leader change.
    #[error("operation aborted")]
    Abort,

    #[error("internal error: {0}")]
    Internal(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("read-only transaction")]
    ReadOnly,

    /// Invalid user input, e.g. conflicting column constraints.
    #[error("invalid value: {0}")]
    Value(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(err: std::num::ParseIntError) -> Self {
        Error::Parse(err.to_string())
    }
}

impl From<std::num::ParseFloatError> for Error {
    fn from(err: std::num::ParseFloatError) -> Self {
        Error::Parse(err.to_string())
    }
}

impl From<std::array::TryFromSliceError> for Error {
    fn from(err: std::array::TryFromSliceError) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(err: std::string::FromUtf8Error) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

impl serde::ser::Error for Error {
    fn custom<T: Display>(msg: T) -> Self {
        Error::Internal(msg.to_string())
    }
}

impl serde::de::Error for Error {
    fn custom<T: Display>(msg: T) -> Self {
        Error::Internal(msg.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_converts_to_message() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert_eq!(err, Error::Io("gone".to_string()));
    }

    #[test]
    fn parse_int_error_is_parse() {
        let err: Error = "x1".parse::<i64>().unwrap_err().into();
        assert!(matches!(err, Error::Parse(_)));
    }

    #[test]
    fn errors_roundtrip_through_json() {
        let err = Error::Value("bad".to_string());
        let json = serde_json::to_string(&err).unwrap();
        assert_eq!(serde_json::from_str::<Error>(&json).unwrap(), err);
    }
}
