//! INVITE sessions (calls)
//!
//! Every [`Session`] is driven by a task owning its dialog and transactions. The [`Session`]
//! handle sends commands to that task and the task reports back through [`SessionEvent`]s,
//! so all state transitions of a session happen one at a time.

use crate::cause::Cause;
use crate::emitter::Emitter;
use crate::media::{
    MediaEvent, MediaHandler, MediaHandlerOptions, MediaStream, MuteOptions, Negotiator,
    RenderHint,
};
use crate::profile::{DtmfType, Profile, Support};
use crate::util::extend_headers;
use crate::{Error, Result};
use bytesstr::BytesStr;
use parking_lot::Mutex;
use sip_core::Endpoint;
use sip_types::uri::{NameAddr, SipUri};
use sip_types::header::typed::FromTo;
use sip_types::{Code, CodeKind, Method, Name};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, oneshot, watch};

mod confirmed;
mod dtmf;
mod incoming;
mod layer;
mod outgoing;
mod usage;

pub use dtmf::DtmfOptions;
pub use layer::InviteLayer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Null,
    /// INVITE sent, no provisional response with a description received
    Inviting,
    /// INVITE received, not answered yet
    Invited,
    /// Provisional response with a description received
    EarlyMedia,
    /// 2XX sent, waiting for the ACK
    WaitingForAck,
    Confirmed,
    Terminated,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Null => "Null",
            SessionState::Inviting => "Inviting",
            SessionState::Invited => "Invited",
            SessionState::EarlyMedia => "EarlyMedia",
            SessionState::WaitingForAck => "WaitingForAck",
            SessionState::Confirmed => "Confirmed",
            SessionState::Terminated => "Terminated",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The action [`Session::terminate`] takes in a state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TearDown {
    /// Nothing was sent yet
    MarkTerminated,
    Cancel,
    /// Reject the INVITE, 480 unless another code is given
    Reject,
    /// Send BYE once the ACK arrived or the wait for it timed out
    ByeAfterAck,
    Bye,
    Nothing,
}

pub(crate) const fn tear_down(state: SessionState) -> TearDown {
    match state {
        SessionState::Null => TearDown::MarkTerminated,
        SessionState::Inviting => TearDown::Cancel,
        SessionState::EarlyMedia => TearDown::Cancel,
        SessionState::Invited => TearDown::Reject,
        SessionState::WaitingForAck => TearDown::ByeAfterAck,
        SessionState::Confirmed => TearDown::Bye,
        SessionState::Terminated => TearDown::Nothing,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// Who caused an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Originator {
    Local,
    Remote,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Progress {
        originator: Originator,
        code: Code,
        reason: Option<BytesStr>,
    },
    Accepted {
        originator: Originator,
        code: Code,
    },
    /// Final failure response to the INVITE
    Rejected {
        originator: Originator,
        code: Code,
        cause: Cause,
    },
    /// Session ended before it was accepted
    Failed {
        originator: Originator,
        code: Option<Code>,
        cause: Cause,
    },
    /// Always the last event of a session
    Terminated {
        originator: Originator,
        cause: Cause,
    },
    /// Canceling the INVITE was requested
    Cancel,
    Bye {
        originator: Originator,
    },
    Dtmf {
        originator: Originator,
        tone: char,
        duration: Duration,
    },
    Muted(MuteOptions),
    Unmuted(MuteOptions),
    /// Peer asks to call `target` (REFER), see [`Session::follow_refer`]
    Refer {
        target: NameAddr,
    },
    /// An INVITE with a Replaces header took over this session, it is ended right after
    Replaced {
        session: Session,
    },
    Hold {
        originator: Originator,
    },
    Unhold {
        originator: Originator,
    },
}

#[derive(Debug, Default, Clone)]
pub struct InviteOptions {
    /// Additional `Name: value` header lines for the INVITE
    pub extra_headers: Vec<String>,

    /// Send the INVITE without an offer. The peer offers in its 2XX response and the local
    /// answer is carried by the ACK.
    pub without_sdp: bool,

    /// Hide the local identity (RFC 3323). The From header becomes anonymous and the real
    /// identity is only passed to the proxy in P-Preferred-Identity.
    pub anonymous: bool,

    /// Use of reliable provisional responses for this INVITE, defaults to the profile's
    pub rel100: Option<Support>,

    /// Listeners registered here see every event of the session
    pub events: Emitter<SessionEvent>,
    pub media_events: Emitter<MediaEvent>,
}

#[derive(Debug, Default, Clone)]
pub struct ProgressOptions {
    /// Provisional response code, 180 if not set
    pub code: Option<Code>,
    pub reason: Option<BytesStr>,
    pub extra_headers: Vec<String>,

    /// Send the response reliably (RFC 3262) if the peer supports it. Always the case when
    /// the peer requires it or reliable responses are required by the profile.
    pub rel100: bool,
}

#[derive(Debug, Default, Clone)]
pub struct TerminateOptions {
    /// Response code for rejecting an incoming INVITE
    pub code: Option<Code>,
    pub reason: Option<BytesStr>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HoldState {
    pub local: bool,
    pub remote: bool,
}

type Reply<T> = oneshot::Sender<Result<T>>;

pub(crate) enum Command {
    Accept {
        extra_headers: Vec<String>,
        reply: Reply<()>,
    },
    Progress {
        code: Code,
        reason: Option<BytesStr>,
        extra_headers: Vec<String>,
        rel100: bool,
        reply: Reply<()>,
    },
    Reject {
        code: Code,
        reason: Option<BytesStr>,
        reply: Reply<()>,
    },
    Terminate {
        options: TerminateOptions,
        reply: Reply<()>,
    },
    Cancel {
        reply: Reply<()>,
    },
    Bye {
        reply: Reply<()>,
    },
    Hold {
        hold: bool,
        reply: Reply<bool>,
    },
    Dtmf {
        tones: Vec<char>,
        options: DtmfOptions,
        reply: Reply<()>,
    },
    Refer {
        target: SipUri,
        reply: Reply<Code>,
    },
    FollowRefer {
        options: InviteOptions,
        reply: Reply<Session>,
    },
}

impl Command {
    fn operation(&self) -> &'static str {
        match self {
            Command::Accept { .. } => "accept",
            Command::Progress { .. } => "progress",
            Command::Reject { .. } => "reject",
            Command::Terminate { .. } => "terminate",
            Command::Cancel { .. } => "cancel",
            Command::Bye { .. } => "bye",
            Command::Hold { hold: true, .. } => "hold",
            Command::Hold { hold: false, .. } => "unhold",
            Command::Dtmf { .. } => "send_dtmf",
            Command::Refer { .. } => "refer",
            Command::FollowRefer { .. } => "follow_refer",
        }
    }

    /// Answer the command with [`Error::InvalidState`]
    pub(crate) fn reject_in(self, state: SessionState) {
        let operation = self.operation();
        let error = Error::InvalidState {
            operation,
            state: state.as_str(),
        };

        log::debug!("{operation} is not possible in state {state}");

        match self {
            Command::Accept { reply, .. }
            | Command::Progress { reply, .. }
            | Command::Reject { reply, .. }
            | Command::Terminate { reply, .. }
            | Command::Cancel { reply }
            | Command::Bye { reply }
            | Command::Dtmf { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            Command::Hold { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            Command::Refer { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            Command::FollowRefer { reply, .. } => {
                let _ = reply.send(Err(error));
            }
        }
    }
}

#[derive(Debug)]
struct Info {
    start_time: Option<SystemTime>,
    end_time: Option<SystemTime>,
    hold: HoldState,
    muted: MuteOptions,
}

pub(crate) struct Shared {
    id: String,
    direction: Direction,
    local_identity: NameAddr,
    remote_identity: NameAddr,

    state: watch::Sender<SessionState>,
    info: Mutex<Info>,

    events: Emitter<SessionEvent>,
    media_events: Emitter<MediaEvent>,
    pub(crate) media: Arc<dyn MediaHandler>,
    pub(crate) negotiator: Negotiator,
    dtmf_type: DtmfType,

    commands: mpsc::UnboundedSender<Command>,
}

/// Handle to an INVITE session, cheap to clone
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for Session {}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.shared.id)
            .field("direction", &self.shared.direction)
            .field("state", &self.state())
            .finish()
    }
}

pub(crate) struct SessionParts {
    pub(crate) id: String,
    pub(crate) direction: Direction,
    pub(crate) state: SessionState,
    pub(crate) local_identity: NameAddr,
    pub(crate) remote_identity: NameAddr,
    pub(crate) events: Emitter<SessionEvent>,
    pub(crate) media_events: Emitter<MediaEvent>,
}

impl Session {
    pub(crate) fn create(
        endpoint: Endpoint,
        profile: Profile,
        parts: SessionParts,
    ) -> (Session, Actor) {
        let media_options = MediaHandlerOptions {
            events: parts.media_events.clone(),
            ..profile.media_options.clone()
        };

        let media = profile.media.create(&media_options);
        let (commands_tx, commands) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            id: parts.id,
            direction: parts.direction,
            local_identity: parts.local_identity,
            remote_identity: parts.remote_identity,
            state: watch::Sender::new(parts.state),
            info: Mutex::new(Info {
                start_time: None,
                end_time: None,
                hold: HoldState::default(),
                muted: MuteOptions {
                    audio: false,
                    video: false,
                },
            }),
            events: parts.events,
            media_events: parts.media_events,
            media,
            negotiator: Negotiator::default(),
            dtmf_type: profile.dtmf_type,
            commands: commands_tx,
        });

        let actor = Actor {
            shared: shared.clone(),
            endpoint,
            profile,
            commands,
        };

        (Session { shared }, actor)
    }

    /// Start an outgoing session to `target`.
    ///
    /// The INVITE is sent once the media handler produced an offer.
    pub fn invite(
        endpoint: Endpoint,
        profile: Profile,
        target: SipUri,
        options: InviteOptions,
    ) -> Result<Session> {
        let mut request = profile.create_request(Method::INVITE, target);

        let local_identity = if options.anonymous {
            let anonymous = NameAddr::new(
                Some("Anonymous"),
                "sip:anonymous@anonymous.invalid".parse::<SipUri>()?,
            );

            request
                .headers
                .edit(Name::FROM, |from: &mut FromTo| from.addr = anonymous.clone())?;
            request.headers.insert(
                Name::P_PREFERRED_IDENTITY,
                format!("<{}>", profile.identity.uri),
            );
            request.headers.insert(Name::PRIVACY, "id");

            anonymous
        } else {
            profile.identity.clone()
        };

        extend_headers(&mut request.headers, &options.extra_headers)?;

        let id = outgoing::session_id(&request)?;

        let flags = outgoing::InviteFlags {
            without_sdp: options.without_sdp,
            rel100: options.rel100.unwrap_or(profile.rel100),
        };

        let parts = SessionParts {
            id,
            direction: Direction::Outgoing,
            state: SessionState::Null,
            local_identity,
            remote_identity: NameAddr::uri(request.line.uri.clone()),
            events: options.events,
            media_events: options.media_events,
        };

        let (session, actor) = Session::create(endpoint, profile, parts);

        tokio::spawn(outgoing::run(actor, request, flags));

        Ok(session)
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn direction(&self) -> Direction {
        self.shared.direction
    }

    pub fn method(&self) -> Method {
        Method::INVITE
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    pub fn is_in_progress(&self) -> bool {
        matches!(
            self.state(),
            SessionState::Null
                | SessionState::Inviting
                | SessionState::Invited
                | SessionState::EarlyMedia
        )
    }

    pub fn is_established(&self) -> bool {
        matches!(
            self.state(),
            SessionState::WaitingForAck | SessionState::Confirmed
        )
    }

    pub fn is_ended(&self) -> bool {
        self.state() == SessionState::Terminated
    }

    /// Wait until the session is terminated
    pub async fn terminated(&self) {
        let mut state = self.shared.state.subscribe();
        let _ = state.wait_for(|state| *state == SessionState::Terminated).await;
    }

    pub fn events(&self) -> &Emitter<SessionEvent> {
        &self.shared.events
    }

    pub fn media_events(&self) -> &Emitter<MediaEvent> {
        &self.shared.media_events
    }

    pub fn media(&self) -> &Arc<dyn MediaHandler> {
        &self.shared.media
    }

    pub fn local_identity(&self) -> &NameAddr {
        &self.shared.local_identity
    }

    pub fn remote_identity(&self) -> &NameAddr {
        &self.shared.remote_identity
    }

    /// When the session was accepted
    pub fn start_time(&self) -> Option<SystemTime> {
        self.shared.info.lock().start_time
    }

    pub fn end_time(&self) -> Option<SystemTime> {
        self.shared.info.lock().end_time
    }

    pub fn get_local_streams(&self) -> Vec<MediaStream> {
        self.shared.media.get_local_streams()
    }

    pub fn get_remote_streams(&self) -> Vec<MediaStream> {
        self.shared.media.get_remote_streams()
    }

    pub fn render(&self, hint: &RenderHint) {
        self.shared.media.render(hint)
    }

    async fn command<T>(
        &self,
        operation: &'static str,
        command: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T> {
        let terminated = || Error::InvalidState {
            operation,
            state: SessionState::Terminated.as_str(),
        };

        let (tx, rx) = oneshot::channel();

        if self.shared.commands.send(command(tx)).is_err() {
            return Err(terminated());
        }

        rx.await.unwrap_or_else(|_| Err(terminated()))
    }

    /// Answer an incoming session
    pub async fn accept(&self, extra_headers: Vec<String>) -> Result<()> {
        self.command("accept", |reply| Command::Accept {
            extra_headers,
            reply,
        })
        .await
    }

    /// Send a provisional response (default 180) to an incoming session.
    ///
    /// A reliable response must be acknowledged (PRACK) before the next reliable one can be
    /// sent, accepting the session waits for that acknowledgement.
    pub async fn progress(&self, options: ProgressOptions) -> Result<()> {
        let code = options.code.unwrap_or(Code::RINGING);

        if code.kind() != CodeKind::Provisional || code == Code::TRYING {
            return Err(Error::InvalidOptions("progress code must be within 101 and 199"));
        }

        self.command("progress", |reply| Command::Progress {
            code,
            reason: options.reason,
            extra_headers: options.extra_headers,
            rel100: options.rel100,
            reply,
        })
        .await
    }

    /// Reject an incoming session (default 480)
    pub async fn reject(&self, code: Option<Code>, reason: Option<BytesStr>) -> Result<()> {
        let code = code.unwrap_or(Code::TEMPORARILY_UNAVAILABLE);

        if !(300..=699).contains(&code.into_u16()) {
            return Err(Error::InvalidOptions("reject code must be within 300 and 699"));
        }

        self.command("reject", |reply| Command::Reject {
            code,
            reason,
            reply,
        })
        .await
    }

    /// Respond to an incoming session, dispatched by the class of `code`
    pub async fn reply(&self, code: Code, reason: Option<BytesStr>) -> Result<()> {
        match code.kind() {
            CodeKind::Provisional => {
                self.progress(ProgressOptions {
                    code: Some(code),
                    reason,
                    ..ProgressOptions::default()
                })
                .await
            }
            CodeKind::Success => self.accept(vec![]).await,
            _ => self.reject(Some(code), reason).await,
        }
    }

    /// End the session in whatever way its state requires, does nothing once terminated
    pub async fn terminate(&self, options: TerminateOptions) -> Result<()> {
        if tear_down(self.state()) == TearDown::Nothing {
            return Ok(());
        }

        match self
            .command("terminate", |reply| Command::Terminate { options, reply })
            .await
        {
            Err(Error::InvalidState {
                state: "Terminated",
                ..
            }) => Ok(()),
            result => result,
        }
    }

    /// Cancel an outgoing session that has not been answered yet
    pub async fn cancel(&self) -> Result<()> {
        if self.shared.direction == Direction::Incoming {
            return Err(Error::InvalidState {
                operation: "cancel",
                state: self.state().as_str(),
            });
        }

        self.command("cancel", |reply| Command::Cancel { reply }).await
    }

    /// End a confirmed session
    pub async fn bye(&self) -> Result<()> {
        self.command("bye", |reply| Command::Bye { reply }).await
    }

    /// Put the peer on hold, returns false if already on hold
    pub async fn hold(&self) -> Result<bool> {
        self.command("hold", |reply| Command::Hold { hold: true, reply })
            .await
    }

    /// Take the peer off hold, returns false if not on hold
    pub async fn unhold(&self) -> Result<bool> {
        self.command("unhold", |reply| Command::Hold { hold: false, reply })
            .await
    }

    pub fn is_on_hold(&self) -> HoldState {
        self.shared.info.lock().hold
    }

    /// Queue DTMF `tones` (`0-9`, `A-D`, `*`, `#`, `,` for a pause)
    pub async fn send_dtmf(&self, tones: &str, options: DtmfOptions) -> Result<()> {
        let tones = dtmf::parse_tones(tones)?;
        let options = options.normalized();

        self.command("send_dtmf", |reply| Command::Dtmf {
            tones,
            options,
            reply,
        })
        .await
    }

    /// Ask the peer to call `target`, returns the final response code
    pub async fn refer(&self, target: SipUri) -> Result<Code> {
        self.command("refer", |reply| Command::Refer { target, reply })
            .await
    }

    /// Call the target of the last REFER received in this session and end this session.
    ///
    /// Replaces and Referred-By of the REFER are carried over into the new INVITE.
    pub async fn follow_refer(&self, options: InviteOptions) -> Result<Session> {
        self.command("follow_refer", |reply| Command::FollowRefer { options, reply })
            .await
    }

    /// Report that `session` took over this session and end it
    pub(crate) fn replaced_by(&self, session: Session) {
        log::debug!("session {} replaced by {}", self.shared.id, session.id());

        self.shared.events.emit(SessionEvent::Replaced { session });

        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.terminate(TerminateOptions::default()).await {
                log::warn!("failed to end replaced session, {e}");
            }
        });
    }

    pub fn mute(&self, options: MuteOptions) {
        let changed = {
            let mut info = self.shared.info.lock();
            let muted = &mut info.muted;

            let changed = (options.audio && !muted.audio) || (options.video && !muted.video);

            muted.audio |= options.audio;
            muted.video |= options.video;

            changed
        };

        if changed {
            self.shared.media.mute(options);
            self.shared.events.emit(SessionEvent::Muted(options));
        }
    }

    pub fn unmute(&self, options: MuteOptions) {
        let changed = {
            let mut info = self.shared.info.lock();
            let muted = &mut info.muted;

            let changed = (options.audio && muted.audio) || (options.video && muted.video);

            muted.audio &= !options.audio;
            muted.video &= !options.video;

            changed
        };

        if changed {
            self.shared.media.unmute(options);
            self.shared.events.emit(SessionEvent::Unmuted(options));
        }
    }

    /// Which kinds of media are muted
    pub fn is_muted(&self) -> MuteOptions {
        self.shared.info.lock().muted
    }
}

/// Task side of a session
pub(crate) struct Actor {
    pub(crate) shared: Arc<Shared>,
    pub(crate) endpoint: Endpoint,
    pub(crate) profile: Profile,
    pub(crate) commands: mpsc::UnboundedReceiver<Command>,
}

impl Actor {
    pub(crate) fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        let previous = self.shared.state.send_replace(state);

        if previous != state {
            log::debug!("session {} {previous} -> {state}", self.shared.id);
        }
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        self.shared.events.emit(event);
    }

    pub(crate) fn set_started(&self) {
        self.shared.info.lock().start_time = Some(SystemTime::now());
    }

    pub(crate) fn set_hold(&self, update: impl FnOnce(&mut HoldState)) -> HoldState {
        let mut info = self.shared.info.lock();
        update(&mut info.hold);
        info.hold
    }

    /// Emit `Failed` followed by `Terminated`
    pub(crate) fn fail(&self, originator: Originator, code: Option<Code>, cause: Cause) {
        if self.state() == SessionState::Terminated {
            return;
        }

        log::debug!("session {} failed, {cause}", self.shared.id);

        self.emit(SessionEvent::Failed {
            originator,
            code,
            cause: cause.clone(),
        });
        self.finish(originator, cause);
    }

    /// Move to `Terminated` and release the media, emits `Terminated` exactly once
    pub(crate) fn finish(&self, originator: Originator, cause: Cause) {
        if self.state() == SessionState::Terminated {
            return;
        }

        self.shared.info.lock().end_time = Some(SystemTime::now());
        self.shared.media.close();
        self.set_state(SessionState::Terminated);

        log::debug!("session {} terminated, {cause}", self.shared.id);

        self.emit(SessionEvent::Terminated { originator, cause });
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn every_state_has_one_tear_down_action() {
        let table = [
            (SessionState::Null, TearDown::MarkTerminated),
            (SessionState::Inviting, TearDown::Cancel),
            (SessionState::Invited, TearDown::Reject),
            (SessionState::EarlyMedia, TearDown::Cancel),
            (SessionState::WaitingForAck, TearDown::ByeAfterAck),
            (SessionState::Confirmed, TearDown::Bye),
            (SessionState::Terminated, TearDown::Nothing),
        ];

        for (state, action) in table {
            assert_eq!(tear_down(state), action, "{state}");
        }
    }
}
