use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the codec, the correlators and the dispatch layer.
#[derive(Debug, Error)]
pub enum Error {
    /// Transport failure, or malformed bencode (`ErrorKind::InvalidData`).
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// A value could not be converted to or from the requested type.
    #[error(transparent)]
    Bencode(#[from] serde_bencode::Error),

    #[error("{0}")]
    Message(String),

    /// The request carried no `p` field.
    #[error("request body missing params")]
    MissingParams,

    /// The response carried no `r` field but the caller asked for a value.
    #[error("response body missing result")]
    MissingResult,

    /// A response was written for a sequence number with no pending request.
    #[error("invalid sequence number in response: {0}")]
    UnknownSequence(u64),

    /// The remote side reported an error for this call.
    #[error("{0}")]
    Remote(String),

    #[error("method already registered: {0}")]
    DuplicateMethod(String),

    /// The connection is gone, or a previous read left the codec mid-message.
    #[error("connection is shut down")]
    Shutdown,
}

impl Error {
    /// True when the peer went away rather than sending garbage.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
            ),
            Error::Shutdown => true,
            _ => false,
        }
    }
}

#[test]
fn disconnect_kinds() {
    let eof = Error::from(io::Error::from(io::ErrorKind::UnexpectedEof));
    assert!(eof.is_disconnect());
    let garbage = Error::from(io::Error::from(io::ErrorKind::InvalidData));
    assert!(!garbage.is_disconnect());
    assert!(!Error::MissingParams.is_disconnect());
}
