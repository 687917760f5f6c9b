/// A replikv result.
pub type Result<T> = std::result::Result<T, Error>;

/// A replikv error.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// Invalid data, typically a malformed wire message or journal line.
    InvalidData(String),
    /// Invalid user input, e.g. bad command-line arguments.
    InvalidInput(String),
    /// An input/output error.
    IO(String),
    /// An internal error, e.g. a disconnected channel. These are not expected
    /// during normal operation.
    Internal(String),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::InvalidData(s)
            | Error::InvalidInput(s)
            | Error::IO(s)
            | Error::Internal(s) => write!(f, "{s}"),
        }
    }
}

/// Constructs an Error::InvalidData and returns it as an Err.
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => {
        Err($crate::error::Error::InvalidData(format!($($args)*)))
    };
}

/// Constructs an Error::InvalidInput and returns it as an Err.
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => {
        Err($crate::error::Error::InvalidInput(format!($($args)*)))
    };
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<hex::FromHexError> for Error {
    fn from(err: hex::FromHexError) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl From<log::ParseLevelError> for Error {
    fn from(err: log::ParseLevelError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<log::SetLoggerError> for Error {
    fn from(err: log::SetLoggerError) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<rustyline::error::ReadlineError> for Error {
    fn from(err: rustyline::error::ReadlineError) -> Self {
        Error::IO(err.to_string())
    }
}

impl<T> From<crossbeam::channel::SendError<T>> for Error {
    fn from(err: crossbeam::channel::SendError<T>) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<crossbeam::channel::RecvError> for Error {
    fn from(err: crossbeam::channel::RecvError) -> Self {
        Error::Internal(err.to_string())
    }
}
