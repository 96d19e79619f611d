use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// CinderDB errors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// The map has been closed; no further operations are accepted.
    Closed,
    /// On-disk data violated the node or metadata format. The bytes at the
    /// offending offset cannot be trusted and the operation is aborted.
    Corrupt(String),
    /// An IO error from the file, mapping, or flush path.
    IO(String),
    /// Invalid user input, such as an empty key or reversed range bounds.
    InvalidInput(String),
    /// An offset fell outside the mapped region.
    OutOfRange(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Closed => write!(f, "map is closed"),
            Error::Corrupt(msg) => write!(f, "corrupt data: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::OutOfRange(msg) => write!(f, "offset out of range: {msg}"),
        }
    }
}

/// Constructs an Error::Corrupt for the given format string.
#[macro_export]
macro_rules! errcorrupt {
    ($($args:tt)*) => { $crate::error::Error::Corrupt(format!($($args)*)).into() };
}

/// Constructs an Error::InvalidInput for the given format string.
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { $crate::error::Error::InvalidInput(format!($($args)*)).into() };
}

/// Constructs an Error::OutOfRange for the given format string.
#[macro_export]
macro_rules! errrange {
    ($($args:tt)*) => { $crate::error::Error::OutOfRange(format!($($args)*)).into() };
}

/// A CinderDB Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::IO(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(
            Error::Corrupt("bad bitmap".to_string()).to_string(),
            "corrupt data: bad bitmap"
        );
        assert_eq!(Error::Closed.to_string(), "map is closed");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::IO(_)));
    }

    #[test]
    fn test_macros_produce_results() {
        let corrupt: Result<()> = errcorrupt!("node at {} too short", 42);
        assert_eq!(
            corrupt,
            Err(Error::Corrupt("node at 42 too short".to_string()))
        );

        let input: Result<()> = errinput!("empty key");
        assert_eq!(input, Err(Error::InvalidInput("empty key".to_string())));
    }
}
