use crate::cause::Cause;
use crate::media::MediaError;
use sip_types::header::HeaderError;
use sip_types::parse::ParseError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] sip_core::Error),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("invalid target {0:?}")]
    InvalidTarget(String),
    #[error("{operation} is not possible in state {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },
    #[error("failed: {0}")]
    Failed(Cause),
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error("another offer/answer negotiation is in progress")]
    NegotiationInProgress,
    #[error("invalid options: {0}")]
    InvalidOptions(&'static str),
}

impl From<HeaderError> for Error {
    fn from(e: HeaderError) -> Self {
        Error::Core(sip_core::Error::Header(e))
    }
}

impl Error {
    /// The cause reported in events when this error ends an operation
    pub fn cause(&self) -> Cause {
        match self {
            Error::Core(e) if e.is_transport_failure() => Cause::ConnectionError,
            Error::Core(sip_core::Error::RequestTimedOut) => Cause::RequestTimeout,
            Error::Core(_) => Cause::DialogError,
            Error::Parse(_) | Error::InvalidTarget(_) => Cause::InvalidTarget,
            Error::Failed(cause) => cause.clone(),
            Error::Media(MediaError::UserDenied) => Cause::UserDeniedMediaAccess,
            Error::Media(MediaError::BadDescription(_)) => Cause::BadMediaDescription,
            Error::Media(_) => Cause::InternalError,
            Error::InvalidState { .. } | Error::NegotiationInProgress | Error::InvalidOptions(_) => {
                Cause::InternalError
            }
        }
    }
}
