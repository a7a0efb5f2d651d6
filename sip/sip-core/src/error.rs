use sip_types::header::HeaderError;
use std::io;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("transport is not connected")]
    NotConnected,
    #[error(transparent)]
    Header(#[from] HeaderError),
    #[error("request timed out")]
    RequestTimedOut,
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),
}

impl Error {
    /// Errors caused by the transport collaborator rather than the peer
    pub fn is_transport_failure(&self) -> bool {
        matches!(self, Error::Io(_) | Error::NotConnected)
    }
}
