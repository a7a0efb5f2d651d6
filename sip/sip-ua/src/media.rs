//! Media handler capability
//!
//! Sessions never touch media themselves. Offers and answers are produced and consumed by
//! a [`MediaHandler`], one per session, created by the [`MediaHandlerFactory`] the user
//! agent was configured with.

use crate::emitter::Emitter;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;

#[derive(Debug, Clone, thiserror::Error)]
pub enum MediaError {
    #[error("user denied media access")]
    UserDenied,
    #[error("bad media description: {0}")]
    BadDescription(String),
    #[error("operation not supported by the media handler")]
    Unsupported,
    #[error("{0}")]
    Other(String),
}

/// Modifies the description a handler produces
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Modifiers {
    /// Produce a description putting the peer on hold
    pub hold: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

/// Media stream owned by a handler, identified by the handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaStream {
    pub id: String,
    pub audio: bool,
    pub video: bool,
}

/// Where a handler should render local and remote media
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RenderHint {
    pub local: Option<String>,
    pub remote: Option<String>,
}

/// Which kinds of media to (un)mute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MuteOptions {
    pub audio: bool,
    pub video: bool,
}

impl Default for MuteOptions {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpWrapper {
    pub kind: SdpKind,
    pub sdp: Bytes,
}

/// Events emitted by handler implementations
#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    UserMediaRequest(MediaConstraints),
    AddStream(MediaStream),
    UserMedia(MediaStream),
    UserMediaFailed(String),
    IceCandidate(String),
    IceGathering,
    IceGatheringComplete,
    IceConnection,
    IceConnectionChecking,
    IceConnectionConnected,
    IceConnectionCompleted,
    IceConnectionFailed,
    IceConnectionDisconnected,
    IceConnectionClosed,
    DataChannel(String),
    GetDescription(SdpWrapper),
    SetDescription(SdpWrapper),
}

/// Media negotiation of a single session
#[async_trait::async_trait]
pub trait MediaHandler: Send + Sync + 'static {
    /// Create a local description
    ///
    /// This is an offer, unless a remote offer was applied with
    /// [`set_description`](MediaHandler::set_description) before, then it is the answer.
    async fn get_description(&self, modifiers: Modifiers) -> Result<Bytes, MediaError>;

    /// Apply a remote offer or answer
    async fn set_description(&self, sdp: Bytes) -> Result<(), MediaError>;

    fn get_local_streams(&self) -> Vec<MediaStream>;

    fn get_remote_streams(&self) -> Vec<MediaStream>;

    fn render(&self, hint: &RenderHint);

    fn mute(&self, options: MuteOptions);

    fn unmute(&self, options: MuteOptions);

    /// Send an out-of-band DTMF tone through the media path
    async fn send_dtmf(&self, tone: char, duration: Duration) -> Result<(), MediaError> {
        let _ = (tone, duration);
        Err(MediaError::Unsupported)
    }

    /// Release all media resources, the handler is not used afterwards
    fn close(&self);
}

#[derive(Debug, Default, Clone)]
pub struct MediaHandlerOptions {
    pub stun_servers: Vec<String>,
    pub turn_servers: Vec<String>,
    pub ice_checking_timeout: Duration,

    /// Emitter exposed as the session's media events
    pub events: Emitter<MediaEvent>,
}

pub trait MediaHandlerFactory: Send + Sync + 'static {
    fn create(&self, options: &MediaHandlerOptions) -> Arc<dyn MediaHandler>;
}

impl<F> MediaHandlerFactory for F
where
    F: Fn(&MediaHandlerOptions) -> Arc<dyn MediaHandler> + Send + Sync + 'static,
{
    fn create(&self, options: &MediaHandlerOptions) -> Arc<dyn MediaHandler> {
        self(options)
    }
}

/// Serializes offer/answer exchanges of a session
#[derive(Debug, Clone, Default)]
pub(crate) struct Negotiator {
    lock: Arc<tokio::sync::Mutex<()>>,
}

/// Held while a negotiation runs
pub(crate) type Negotiation = OwnedMutexGuard<()>;

impl Negotiator {
    pub(crate) fn begin(&self) -> Result<Negotiation, crate::Error> {
        self.lock
            .clone()
            .try_lock_owned()
            .map_err(|_| crate::Error::NegotiationInProgress)
    }

    pub(crate) fn in_progress(&self) -> bool {
        self.lock.try_lock().is_err()
    }
}

/// Handler offering a fixed description and storing what the peer sent.
///
/// Used for signaling-only user agents that have no media of their own.
#[derive(Debug)]
pub struct StaticMedia {
    sdp: Bytes,
    hold_sdp: Bytes,
    events: Emitter<MediaEvent>,
    state: Mutex<StaticState>,
}

#[derive(Debug, Default)]
struct StaticState {
    remote: Option<Bytes>,
    muted: bool,
    closed: bool,
    dtmf: Vec<char>,
}

impl StaticMedia {
    pub fn new(sdp: impl Into<Bytes>, events: Emitter<MediaEvent>) -> Self {
        let sdp = sdp.into();
        let hold_sdp = hold_description(&sdp);

        Self {
            sdp,
            hold_sdp,
            events,
            state: Mutex::default(),
        }
    }

    /// Factory creating a [`StaticMedia`] per session, all offering `sdp`
    pub fn factory(sdp: &'static str) -> Arc<dyn MediaHandlerFactory> {
        Arc::new(move |options: &MediaHandlerOptions| -> Arc<dyn MediaHandler> {
            Arc::new(StaticMedia::new(sdp, options.events.clone()))
        })
    }

    /// The last description applied with `set_description`
    pub fn remote_description(&self) -> Option<Bytes> {
        self.state.lock().remote.clone()
    }

    pub fn is_muted(&self) -> bool {
        self.state.lock().muted
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Tones sent with `send_dtmf`
    pub fn sent_dtmf(&self) -> Vec<char> {
        self.state.lock().dtmf.clone()
    }
}

fn hold_description(sdp: &Bytes) -> Bytes {
    let Ok(sdp) = std::str::from_utf8(sdp) else {
        return sdp.clone();
    };

    let mut out = String::with_capacity(sdp.len() + 16);
    let mut has_direction = false;

    for line in sdp.split_inclusive('\n') {
        let trimmed = line.trim_end();

        if matches!(trimmed, "a=sendrecv" | "a=recvonly" | "a=sendonly" | "a=inactive") {
            has_direction = true;
            out.push_str("a=sendonly\r\n");
        } else {
            out.push_str(line);
        }
    }

    if !has_direction {
        if !out.ends_with('\n') && !out.is_empty() {
            out.push_str("\r\n");
        }
        out.push_str("a=sendonly\r\n");
    }

    out.into()
}

/// Is `sdp` putting its receiver on hold (no media sent towards it)
pub fn is_hold_description(sdp: &[u8]) -> bool {
    let Ok(sdp) = std::str::from_utf8(sdp) else {
        return false;
    };

    sdp.lines()
        .any(|line| matches!(line.trim_end(), "a=sendonly" | "a=inactive"))
}

#[async_trait::async_trait]
impl MediaHandler for StaticMedia {
    async fn get_description(&self, modifiers: Modifiers) -> Result<Bytes, MediaError> {
        let sdp = if modifiers.hold {
            self.hold_sdp.clone()
        } else {
            self.sdp.clone()
        };

        let kind = if self.state.lock().remote.is_some() {
            SdpKind::Answer
        } else {
            SdpKind::Offer
        };

        self.events.emit(MediaEvent::GetDescription(SdpWrapper {
            kind,
            sdp: sdp.clone(),
        }));

        Ok(sdp)
    }

    async fn set_description(&self, sdp: Bytes) -> Result<(), MediaError> {
        if !sdp.starts_with(b"v=") {
            return Err(MediaError::BadDescription(
                "description must start with a version line".into(),
            ));
        }

        self.state.lock().remote = Some(sdp.clone());

        self.events.emit(MediaEvent::SetDescription(SdpWrapper {
            kind: SdpKind::Answer,
            sdp,
        }));

        Ok(())
    }

    fn get_local_streams(&self) -> Vec<MediaStream> {
        vec![MediaStream {
            id: "local".into(),
            audio: true,
            video: false,
        }]
    }

    fn get_remote_streams(&self) -> Vec<MediaStream> {
        if self.state.lock().remote.is_some() {
            vec![MediaStream {
                id: "remote".into(),
                audio: true,
                video: false,
            }]
        } else {
            vec![]
        }
    }

    fn render(&self, _hint: &RenderHint) {}

    fn mute(&self, _options: MuteOptions) {
        self.state.lock().muted = true;
    }

    fn unmute(&self, _options: MuteOptions) {
        self.state.lock().muted = false;
    }

    async fn send_dtmf(&self, tone: char, _duration: Duration) -> Result<(), MediaError> {
        self.state.lock().dtmf.push(tone);
        Ok(())
    }

    fn close(&self) {
        self.state.lock().closed = true;
    }
}
