use std::fmt::Display;

/// EmberDB errors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// The collection's data file does not exist.
    DoesNotExist,
    /// The in-memory state of the collection is inconsistent. The collection
    /// must be closed and reopened, which replays the write-ahead log.
    Internal,
    /// An IO error.
    Io(String),
    /// Invalid on-disk data: a garbled log tail, a bad sentinel, or an
    /// unreadable side-car file.
    Corrupt(String),
    /// Invalid user input, typically an oversized key or value.
    InvalidInput(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::DoesNotExist => write!(f, "collection does not exist"),
            Error::Internal => write!(f, "internal state is inconsistent, reopen the collection"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
            Error::Corrupt(msg) => write!(f, "corrupt data: {msg}"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
        }
    }
}

/// An EmberDB Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Io(err.to_string())
    }
}
