//! Error type for the sendmail transport.

use std::io;

use thiserror::Error;

/// Everything that can go wrong while submitting a message.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The configured command carries neither `-bs` nor `-t`.
    #[error("Unsupported sendmail command flags [{command}]. Must be one of \"-bs\" or \"-t\" but can include additional flags.")]
    UnsupportedCommand { command: String },

    #[error("Cannot send message without a sender address")]
    NoReversePath,

    /// The reverse-path can't be passed safely to the MTA.
    #[error("Reverse-path '{0}' contains characters that can't be passed to sendmail")]
    InvalidReversePath(String),

    #[error("Process stream has not been initialized")]
    NotInitialized,

    #[error("Sendmail process closed its output unexpectedly")]
    ConnectionClosed,

    #[error("Timed out after {seconds} seconds waiting on the sendmail process")]
    Timeout { seconds: u64 },

    #[error("Expected response code {expected:?} but got code {code}, with message \"{message}\"")]
    UnexpectedResponse {
        expected: Vec<u16>,
        code: u16,
        message: String,
    },

    #[error("Malformed response line from sendmail: {0:?}")]
    MalformedResponse(String),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("I/O error: {0}")]
    Io(#[source] io::Error),
}

impl From<io::Error> for TransportError {
    /// A timeout raised inside an `io::Write` impl travels as an `io::Error`;
    /// it comes back out as `Timeout` rather than a generic I/O error.
    fn from(e: io::Error) -> Self {
        let timed_out = match e.get_ref().and_then(|inner| inner.downcast_ref::<TransportError>()) {
            Some(TransportError::Timeout { seconds }) => Some(*seconds),
            _ => None,
        };
        match timed_out {
            Some(seconds) => TransportError::Timeout { seconds },
            None => TransportError::Io(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
