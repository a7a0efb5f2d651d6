//! Event subscriptions (RFC 6665), subscriber side
//!
//! A [`Subscription`] sends the SUBSCRIBE, receives the NOTIFY requests of its dialog and
//! refreshes itself before it expires. NOTIFY requests overtaking the response to the initial
//! SUBSCRIBE are routed by the [`SubscriptionLayer`], which must be added to the endpoint after
//! the [`DialogLayer`](crate::dialog::DialogLayer).

use crate::cause::{Cause, sip_error_cause};
use crate::dialog::{Dialog, Usage, UsageGuard, register_usage};
use crate::emitter::Emitter;
use crate::profile::{Authenticator, Profile};
use crate::util::{extend_headers, refresh_delay, respond};
use crate::{Error, Result};
use bytes::Bytes;
use bytesstr::BytesStr;
use parking_lot::Mutex;
use sip_core::transaction::TsxResponse;
use sip_core::{Endpoint, EndpointBuilder, IncomingRequest, Layer, MayTake, Request};
use sip_types::header::typed::{
    CSeq, CallID, ContentType, Event, EventReason, Expires, FromTo, SubState, SubscriptionState,
};
use sip_types::uri::SipUri;
use sip_types::{Code, CodeKind, Method, Name};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, sleep_until};

/// Number of failure codes remembered per subscription
const ERROR_HISTORY: usize = 16;

/// Responses to a refresh that end the subscription instead of letting it run into its expiry
const FATAL_CODES: [u16; 13] = [
    404, 405, 410, 416, 480, 481, 482, 483, 484, 485, 489, 501, 604,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    /// Waiting for the notifier to activate the subscription
    Pending,
    Active,
    Terminated,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Pending => "Pending",
            SubscriptionStatus::Active => "Active",
            SubscriptionStatus::Terminated => "Terminated",
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Content of a NOTIFY request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub state: SubscriptionState,
    pub content_type: Option<ContentType>,
    pub body: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionEvent {
    /// The initial SUBSCRIBE was answered with a 2XX response
    Accepted { code: Code },
    Notify(Notification),
    Failed { code: Option<Code>, cause: Cause },
    /// Last event of every subscription.
    ///
    /// `cause` is `None` after [`Subscription::unsubscribe`] or a terminating NOTIFY without
    /// a known reason.
    Terminated { cause: Option<Cause> },
}

#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// Requested lifetime, sent in the Expires header of every SUBSCRIBE
    pub expires: Duration,
    /// Additional `Name: value` header lines, sent with every SUBSCRIBE
    pub extra_headers: Vec<String>,
    pub events: Emitter<SubscriptionEvent>,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            expires: Duration::from_secs(3600),
            extra_headers: vec![],
            events: Emitter::new(),
        }
    }
}

enum Command {
    Refresh { reply: oneshot::Sender<Result<()>> },
    Unsubscribe { reply: oneshot::Sender<()> },
}

struct Shared {
    id: String,
    event: Event,
    target: SipUri,
    state: watch::Sender<SubscriptionStatus>,
    error_codes: Mutex<VecDeque<Code>>,
    events: Emitter<SubscriptionEvent>,
    commands: mpsc::UnboundedSender<Command>,
}

/// Handle to a subscription, clones refer to the same subscription
#[derive(Clone)]
pub struct Subscription {
    shared: Arc<Shared>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.shared.id)
            .field("event", &self.shared.event.package)
            .field("state", &self.state())
            .finish()
    }
}

impl Subscription {
    /// Subscribe to `event` at `target`, the SUBSCRIBE is sent in the background.
    ///
    /// # Panics
    /// Panics if the endpoint has no [`SubscriptionLayer`]
    pub fn subscribe(
        endpoint: Endpoint,
        profile: Profile,
        target: SipUri,
        event: Event,
        options: SubscribeOptions,
    ) -> Result<Self> {
        let expires = u32::try_from(options.expires.as_secs()).unwrap_or(u32::MAX);

        let mut request = profile.create_request(Method::SUBSCRIBE, target.clone());
        request.headers.insert_named(&event);
        request.headers.insert_named(&Expires(expires));
        extend_headers(&mut request.headers, &options.extra_headers)?;

        let call_id: CallID = request.headers.get_named()?;
        let from: FromTo = request.headers.get(Name::FROM)?;
        let Some(local_tag) = from.tag else {
            return Err(Error::InvalidOptions("SUBSCRIBE without From tag"));
        };

        let (notify_sender, notifies) = mpsc::unbounded_channel();
        let (commands_tx, commands) = mpsc::unbounded_channel();

        let early = EarlyGuard::register(
            endpoint.clone(),
            EarlyKey {
                call_id: call_id.0.clone(),
                local_tag: local_tag.clone(),
            },
            notify_sender.clone(),
        );

        let shared = Arc::new(Shared {
            id: format!("{}{}", call_id.0, local_tag),
            event,
            target,
            state: watch::Sender::new(SubscriptionStatus::Pending),
            error_codes: Mutex::new(VecDeque::with_capacity(ERROR_HISTORY)),
            events: options.events,
            commands: commands_tx,
        });

        let mut authenticator = profile.authenticator();
        authenticator.authorize(&mut request);

        let in_flight = InFlight {
            purpose: Purpose::Initial,
            sent: Box::pin(send(endpoint.clone(), request.clone(), authenticator)),
        };

        log::debug!(
            "subscribing to {} at {}",
            shared.event.package,
            shared.target
        );

        let actor = Actor {
            shared: shared.clone(),
            endpoint,
            profile,
            expires,
            extra_headers: options.extra_headers,
            request,
            authenticator: None,
            dialog: None,
            usage: None,
            early: Some(early),
            notify_sender,
            notifies,
            commands,
            in_flight: Some(in_flight),
            timers: Deadlines::default(),
            notified: false,
            unsubscribed: false,
        };

        tokio::spawn(actor.run());

        Ok(Self { shared })
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn event(&self) -> &Event {
        &self.shared.event
    }

    pub fn target(&self) -> &SipUri {
        &self.shared.target
    }

    pub fn state(&self) -> SubscriptionStatus {
        *self.shared.state.borrow()
    }

    pub fn events(&self) -> &Emitter<SubscriptionEvent> {
        &self.shared.events
    }

    /// Failure codes received for this subscription, oldest first
    pub fn error_codes(&self) -> Vec<Code> {
        self.shared.error_codes.lock().iter().copied().collect()
    }

    /// Send a refreshing SUBSCRIBE now instead of waiting for the refresh timer
    pub async fn refresh(&self) -> Result<()> {
        let (reply, response) = oneshot::channel();

        if self.shared.commands.send(Command::Refresh { reply }).is_err() {
            return Err(terminated("refresh"));
        }

        response.await.unwrap_or_else(|_| Err(terminated("refresh")))
    }

    /// End the subscription. Safe to call in any state, the subscription is terminated afterwards.
    pub async fn unsubscribe(&self) {
        let (reply, response) = oneshot::channel();

        if self.shared.commands.send(Command::Unsubscribe { reply }).is_ok() {
            let _ = response.await;
        }
    }

    /// Wait until the subscription is terminated
    pub async fn terminated(&self) {
        let mut state = self.shared.state.subscribe();

        let _ = state
            .wait_for(|state| *state == SubscriptionStatus::Terminated)
            .await;
    }
}

fn terminated(operation: &'static str) -> Error {
    Error::InvalidState {
        operation,
        state: SubscriptionStatus::Terminated.as_str(),
    }
}

fn record_error_code(history: &mut VecDeque<Code>, code: Code) {
    if history.len() == ERROR_HISTORY {
        history.pop_front();
    }

    history.push_back(code);
}

fn reason_cause(reason: &EventReason) -> Option<Cause> {
    match reason {
        EventReason::Rejected => Some(Cause::Rejected),
        EventReason::Timeout => Some(Cause::Expires),
        EventReason::NoResource => Some(Cause::NotFound),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EarlyKey {
    call_id: BytesStr,
    local_tag: BytesStr,
}

/// Routes NOTIFY requests which arrive before the dialog of their subscription exists
#[derive(Default)]
pub struct SubscriptionLayer {
    early: Mutex<HashMap<EarlyKey, mpsc::UnboundedSender<IncomingRequest>>>,
}

#[async_trait::async_trait]
impl Layer for SubscriptionLayer {
    fn name(&self) -> &'static str {
        "subscription"
    }

    fn init(&mut self, endpoint: &mut EndpointBuilder) {
        endpoint.add_allow(Method::NOTIFY);
    }

    async fn receive(&self, _: &Endpoint, mut request: MayTake<'_, IncomingRequest>) {
        if request.line.method != Method::NOTIFY {
            return;
        }

        let Some(local_tag) = &request.base_headers.to.tag else {
            return;
        };

        let key = EarlyKey {
            call_id: request.base_headers.call_id.0.clone(),
            local_tag: local_tag.clone(),
        };

        let early = self.early.lock();

        let Some(sender) = early.get(&key) else {
            return;
        };

        log::debug!("NOTIFY arrived before the response to its SUBSCRIBE");

        if let Some(notify) = request.inner().take()
            && let Err(mpsc::error::SendError(notify)) = sender.send(notify)
        {
            *request.inner() = Some(notify);
        }
    }
}

/// Keeps the subscription known to the [`SubscriptionLayer`] until its dialog exists
struct EarlyGuard {
    endpoint: Endpoint,
    key: EarlyKey,
}

impl EarlyGuard {
    fn register(
        endpoint: Endpoint,
        key: EarlyKey,
        sender: mpsc::UnboundedSender<IncomingRequest>,
    ) -> Self {
        endpoint
            .layer::<SubscriptionLayer>()
            .early
            .lock()
            .insert(key.clone(), sender);

        Self { endpoint, key }
    }
}

impl Drop for EarlyGuard {
    fn drop(&mut self) {
        self.endpoint
            .layer::<SubscriptionLayer>()
            .early
            .lock()
            .remove(&self.key);
    }
}

struct SubscriptionUsage {
    notifies: mpsc::UnboundedSender<IncomingRequest>,
}

#[async_trait::async_trait]
impl Usage for SubscriptionUsage {
    fn name(&self) -> &'static str {
        "subscription"
    }

    async fn receive(&self, _: &Endpoint, mut request: MayTake<'_, IncomingRequest>) {
        if request.line.method != Method::NOTIFY {
            return;
        }

        if let Some(notify) = request.inner().take()
            && let Err(mpsc::error::SendError(notify)) = self.notifies.send(notify)
        {
            *request.inner() = Some(notify);
        }
    }
}

/// A SUBSCRIBE that was sent, including its retries after authentication challenges
struct Sent {
    result: Result<TsxResponse>,
    /// The request as it was sent last
    request: Request,
    authenticator: Authenticator,
}

async fn send(endpoint: Endpoint, mut request: Request, mut authenticator: Authenticator) -> Sent {
    let result = loop {
        let mut transaction = match endpoint.send_request(request.clone()).await {
            Ok(transaction) => transaction,
            Err(e) => break Err(e.into()),
        };

        match transaction.receive_final().await {
            Ok(response) => {
                if authenticator.handle_response(transaction.request(), &response, &mut request) {
                    continue;
                }

                break Ok(response);
            }
            Err(e) => break Err(e.into()),
        }
    };

    Sent {
        result,
        request,
        authenticator,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Purpose {
    Initial,
    Refresh,
    Unsubscribe,
}

struct InFlight {
    purpose: Purpose,
    sent: Pin<Box<dyn Future<Output = Sent> + Send>>,
}

async fn wait_sent(in_flight: &mut Option<InFlight>) -> (Purpose, Sent) {
    match in_flight {
        Some(in_flight) => (in_flight.purpose, (&mut in_flight.sent).await),
        None => std::future::pending().await,
    }
}

async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[derive(Default)]
struct Deadlines {
    refresh: Option<Instant>,
    expiry: Option<Instant>,
    /// Waiting for the first NOTIFY after the 2XX response (RFC 6665 Timer N)
    first_notify: Option<Instant>,
    /// Unsubscribed, waiting for the final NOTIFY
    linger: Option<Instant>,
}

enum Flow {
    Continue,
    Ended,
}

struct Actor {
    shared: Arc<Shared>,
    endpoint: Endpoint,
    profile: Profile,

    /// Requested lifetime in seconds
    expires: u32,
    extra_headers: Vec<String>,

    /// Initial SUBSCRIBE, creates the dialog
    request: Request,
    authenticator: Option<Authenticator>,

    dialog: Option<Dialog>,
    usage: Option<UsageGuard>,
    early: Option<EarlyGuard>,

    notify_sender: mpsc::UnboundedSender<IncomingRequest>,
    notifies: mpsc::UnboundedReceiver<IncomingRequest>,
    commands: mpsc::UnboundedReceiver<Command>,

    in_flight: Option<InFlight>,
    timers: Deadlines,
    notified: bool,
    unsubscribed: bool,
}

impl Actor {
    async fn run(mut self) {
        loop {
            let flow = tokio::select! {
                (purpose, sent) = wait_sent(&mut self.in_flight) => {
                    self.in_flight = None;
                    self.on_sent(purpose, sent)
                }
                Some(notify) = self.notifies.recv() => self.on_notify(notify).await,
                Some(command) = self.commands.recv() => self.on_command(command),
                _ = sleep_opt(self.timers.refresh), if self.in_flight.is_none() => {
                    self.timers.refresh = None;
                    self.send_in_dialog(Purpose::Refresh, self.expires);
                    Flow::Continue
                }
                _ = sleep_opt(self.timers.expiry) => {
                    log::debug!("subscription {} expired", self.shared.id);
                    self.finish(Some(Cause::Expires));
                    Flow::Ended
                }
                _ = sleep_opt(self.timers.first_notify) => {
                    log::warn!("no NOTIFY received for subscription {}", self.shared.id);
                    self.fail(None, Cause::RequestTimeout);
                    Flow::Ended
                }
                _ = sleep_opt(self.timers.linger) => Flow::Ended,
            };

            if let Flow::Ended = flow {
                break;
            }
        }

        // the usage must be gone before the dialog is
        self.usage = None;
    }

    fn set_state(&self, new: SubscriptionStatus) {
        self.shared.state.send_if_modified(|state| {
            if *state == new {
                return false;
            }

            log::debug!("subscription {}: {state} -> {new}", self.shared.id);
            *state = new;
            true
        });
    }

    fn emit(&self, event: SubscriptionEvent) {
        self.shared.events.emit(event);
    }

    fn fail(&self, code: Option<Code>, cause: Cause) {
        log::error!("subscription {} failed, {cause}", self.shared.id);

        self.emit(SubscriptionEvent::Failed {
            code,
            cause: cause.clone(),
        });
        self.finish(Some(cause));
    }

    /// Enter the terminated state, at most once
    fn finish(&self, cause: Option<Cause>) {
        if *self.shared.state.borrow() == SubscriptionStatus::Terminated {
            return;
        }

        self.set_state(SubscriptionStatus::Terminated);
        self.emit(SubscriptionEvent::Terminated { cause });
    }

    fn record_error_code(&self, code: Code) {
        record_error_code(&mut self.shared.error_codes.lock(), code);
    }

    fn attach_dialog(&mut self, dialog: Dialog) {
        self.usage = register_usage(
            self.endpoint.clone(),
            dialog.key().clone(),
            SubscriptionUsage {
                notifies: self.notify_sender.clone(),
            },
        );

        self.dialog = Some(dialog);
        self.early = None;
    }

    /// Lifetime granted by the notifier
    fn granted(&self, response: &TsxResponse) -> u32 {
        response
            .headers
            .get_named::<Expires>()
            .map(|expires| expires.0)
            .unwrap_or(self.expires)
    }

    fn schedule(&mut self, granted: u32) {
        let now = Instant::now();
        let expires = Duration::from_secs(granted.into());

        self.timers.expiry = Some(now + expires);
        self.timers.refresh =
            (granted > 0).then(|| now + refresh_delay(expires, self.profile.refresh_margin));
    }

    /// A NOTIFY announced an expiry earlier than the one known
    fn limit_expiry(&mut self, expires: Option<u32>) {
        let Some(secs) = expires else {
            return;
        };

        let now = Instant::now();
        let expires = Duration::from_secs(secs.into());

        if self
            .timers
            .expiry
            .is_none_or(|current| now + expires < current)
        {
            self.timers.expiry = Some(now + expires);
            self.timers.refresh =
                (secs > 0).then(|| now + refresh_delay(expires, self.profile.refresh_margin));
        }
    }

    fn send_in_dialog(&mut self, purpose: Purpose, expires: u32) {
        let Some(dialog) = &mut self.dialog else {
            return;
        };

        let mut request = dialog.create_request(Method::SUBSCRIBE);
        request.headers.insert_named(&self.shared.event);
        request.headers.insert_named(&Expires(expires));

        if let Err(e) = extend_headers(&mut request.headers, &self.extra_headers) {
            log::warn!("failed to add extra headers to SUBSCRIBE, {e}");
        }

        let mut authenticator = self
            .authenticator
            .take()
            .unwrap_or_else(|| self.profile.authenticator());
        authenticator.authorize(&mut request);

        self.in_flight = Some(InFlight {
            purpose,
            sent: Box::pin(send(self.endpoint.clone(), request, authenticator)),
        });
    }

    fn send_unsubscribe(&mut self) {
        log::debug!("unsubscribing {}", self.shared.id);

        self.send_in_dialog(Purpose::Unsubscribe, 0);
        self.timers.linger = Some(Instant::now() + self.endpoint.timers().transaction_timeout());
    }

    fn on_sent(&mut self, purpose: Purpose, sent: Sent) -> Flow {
        let Sent {
            result,
            request,
            authenticator,
        } = sent;

        self.authenticator = Some(authenticator);

        // retries after authentication challenges used up CSeq numbers
        if let Some(dialog) = &mut self.dialog
            && let Ok(cseq) = request.headers.get_named::<CSeq>()
        {
            dialog.local_cseq = dialog.local_cseq.max(cseq.cseq);
        }

        if purpose == Purpose::Initial {
            self.request = request;
        }

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                return match purpose {
                    Purpose::Refresh => {
                        log::warn!("refreshing subscription {} failed, {e}", self.shared.id);
                        Flow::Continue
                    }
                    Purpose::Initial if !self.unsubscribed => {
                        self.fail(None, e.cause());
                        Flow::Ended
                    }
                    _ => Flow::Ended,
                };
            }
        };

        let code = response.line.code;

        if code.kind() != CodeKind::Success {
            self.record_error_code(code);

            let cause = sip_error_cause(code, response.line.reason.as_ref());

            return match purpose {
                Purpose::Refresh if !FATAL_CODES.contains(&code.into_u16()) => {
                    log::warn!(
                        "refresh of subscription {} rejected with {code}, keeping it until it expires",
                        self.shared.id
                    );
                    Flow::Continue
                }
                Purpose::Initial | Purpose::Refresh if !self.unsubscribed => {
                    self.fail(Some(code), cause);
                    Flow::Ended
                }
                _ => Flow::Ended,
            };
        }

        match purpose {
            Purpose::Initial => self.accepted(&response),
            Purpose::Refresh => {
                let granted = self.granted(&response);
                self.schedule(granted);
                Flow::Continue
            }
            // the final NOTIFY is still awaited
            Purpose::Unsubscribe => Flow::Continue,
        }
    }

    fn accepted(&mut self, response: &TsxResponse) -> Flow {
        if !self.unsubscribed {
            self.emit(SubscriptionEvent::Accepted {
                code: response.line.code,
            });
        }

        if self.dialog.is_none() {
            let dialog = Dialog::new_client(
                self.endpoint.clone(),
                &self.request,
                response,
                self.profile.contact.clone(),
            );

            match dialog {
                Ok(dialog) => self.attach_dialog(dialog),
                Err(e) => {
                    log::warn!("cannot create dialog from response to SUBSCRIBE, {e}");

                    if !self.unsubscribed {
                        self.fail(None, Cause::DialogError);
                    }

                    return Flow::Ended;
                }
            }
        }

        if self.unsubscribed {
            self.send_unsubscribe();
            return Flow::Continue;
        }

        let granted = self.granted(response);
        self.schedule(granted);

        if !self.notified {
            self.timers.first_notify =
                Some(Instant::now() + self.endpoint.timers().transaction_timeout());
        }

        Flow::Continue
    }

    async fn on_notify(&mut self, notify: IncomingRequest) -> Flow {
        let endpoint = self.endpoint.clone();

        let matches_event = notify
            .headers
            .get_named::<Event>()
            .is_ok_and(|event| event.matches(&self.shared.event));

        if !matches_event {
            log::debug!("NOTIFY for another event package");

            if let Err(e) = respond(&endpoint, notify, Code::BAD_EVENT).await {
                log::warn!("failed to respond to NOTIFY, {e}");
            }

            return Flow::Continue;
        }

        let state = match notify.headers.try_get_named::<SubscriptionState>() {
            Some(Ok(state)) => Some(state),
            None if self.profile.allow_legacy_notifications => {
                Some(SubscriptionState::new(SubState::Active))
            }
            None => None,
            Some(Err(e)) => {
                log::debug!("NOTIFY with invalid Subscription-State, {e}");
                None
            }
        };

        let Some(state) = state else {
            if let Err(e) = respond(&endpoint, notify, Code::BAD_REQUEST).await {
                log::warn!("failed to respond to NOTIFY, {e}");
            }

            return Flow::Continue;
        };

        if self.dialog.is_none() {
            let dialog = Dialog::new_from_peer_request(
                endpoint.clone(),
                &self.request,
                &notify,
                self.profile.contact.clone(),
            );

            match dialog {
                Ok(dialog) => self.attach_dialog(dialog),
                Err(e) => {
                    log::warn!("cannot create dialog from NOTIFY, {e}");

                    if let Err(e) = respond(&endpoint, notify, Code::BAD_REQUEST).await {
                        log::warn!("failed to respond to NOTIFY, {e}");
                    }

                    return Flow::Continue;
                }
            }
        }

        let notification = Notification {
            state,
            content_type: notify
                .headers
                .try_get_named::<ContentType>()
                .and_then(|content_type| content_type.ok()),
            body: notify.body.clone(),
        };

        if let Err(e) = respond(&endpoint, notify, Code::OK).await {
            log::warn!("failed to respond to NOTIFY, {e}");
        }

        self.notified = true;
        self.timers.first_notify = None;

        let terminating = notification.state.state == SubState::Terminated;

        if self.unsubscribed {
            return if terminating {
                Flow::Ended
            } else {
                Flow::Continue
            };
        }

        let expires = notification.state.expires;
        let reason = notification.state.reason.clone();
        let status = match &notification.state.state {
            SubState::Pending => SubscriptionStatus::Pending,
            SubState::Terminated => SubscriptionStatus::Terminated,
            SubState::Active | SubState::Other(_) => SubscriptionStatus::Active,
        };

        self.emit(SubscriptionEvent::Notify(notification));

        if terminating {
            self.finish(reason.as_ref().and_then(reason_cause));
            return Flow::Ended;
        }

        self.set_state(status);
        self.limit_expiry(expires);

        Flow::Continue
    }

    fn on_command(&mut self, command: Command) -> Flow {
        match command {
            Command::Refresh { reply } => {
                let result = if self.unsubscribed {
                    Err(terminated("refresh"))
                } else if self.dialog.is_none() {
                    Err(Error::InvalidState {
                        operation: "refresh",
                        state: SubscriptionStatus::Pending.as_str(),
                    })
                } else {
                    if self.in_flight.is_none() {
                        self.timers.refresh = None;
                        self.send_in_dialog(Purpose::Refresh, self.expires);
                    }

                    Ok(())
                };

                let _ = reply.send(result);

                Flow::Continue
            }
            Command::Unsubscribe { reply } => {
                let flow = self.unsubscribe();
                let _ = reply.send(());
                flow
            }
        }
    }

    fn unsubscribe(&mut self) -> Flow {
        if self.unsubscribed {
            return Flow::Continue;
        }

        self.unsubscribed = true;
        self.finish(None);
        self.timers = Deadlines::default();

        let initial_in_flight = self
            .in_flight
            .as_ref()
            .is_some_and(|in_flight| in_flight.purpose == Purpose::Initial);

        // the dialog needed to unsubscribe is created by the response to the initial SUBSCRIBE
        if initial_in_flight && self.dialog.is_none() {
            return Flow::Continue;
        }

        self.in_flight = None;

        if self.dialog.is_none() {
            return Flow::Ended;
        }

        self.send_unsubscribe();

        Flow::Continue
    }
}
