//! Error types for the looper scheduler.

use std::thread::ThreadId;

use thiserror::Error;

/// Result type alias using our error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the looper scheduler.
#[derive(Error, Debug)]
pub enum Error {
    /// The main dispatcher backs every test; it can never be quit.
    #[error("Main thread not allowed to quit")]
    MainThreadQuit,

    /// An operation reserved for the main thread was called elsewhere.
    #[error("Wrong thread: expected {expected:?}, called from {actual:?}")]
    WrongThread { expected: ThreadId, actual: ThreadId },

    /// A post was made with a negative delay while the reject policy is active.
    #[error("Negative delay: {delay_ms}ms")]
    NegativeDelay { delay_ms: i64 },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] Box<std::io::Error>),

    /// JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] Box<serde_json::Error>),
}

impl Error {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a wrong-thread error for the calling thread.
    pub fn wrong_thread(expected: ThreadId) -> Self {
        Self::WrongThread {
            expected,
            actual: std::thread::current().id(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Box::new(value))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(Box::new(value))
    }
}
