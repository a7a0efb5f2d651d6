use crate::config::Config;
use crate::connection::{ConnectionTask, Schedule};
use crate::layer::UaLayer;
use crate::logging::Logger;
use crate::media::CleanImageattr;
use crate::{Error, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use rand::distr::Alphanumeric;
use rand::{Rng, rng};
use sip_core::Endpoint;
use sip_core::transport::Connector;
use sip_types::header::typed::{Contact, ContentType, Event};
use sip_types::uri::{NameAddr, SipUri};
use sip_types::{Code, Method};
use sip_ua::dialog::DialogLayer;
use sip_ua::media::{MediaHandlerFactory, MediaHandlerOptions};
use sip_ua::{
    Cause, ClientContext, Emitter, InviteLayer, InviteOptions, Profile, RegistrationEvent,
    Registrator, RequestOptions, Session, SessionEvent, SubscribeOptions, Subscription,
    SubscriptionEvent, SubscriptionLayer, SubscriptionStatus, TerminateOptions,
};
use slotmap::SlotMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

slotmap::new_key_type! {
    struct SessionKey;
    struct SubscriptionKey;
}

/// Events of a [`UserAgent`]
#[derive(Debug, Clone)]
pub enum UaEvent {
    /// The transport connected, `attempts` connection attempts were made
    Connected { attempts: u32 },
    Disconnected,
    Registered { expires: Duration },
    Unregistered {
        code: Option<Code>,
        cause: Option<Cause>,
    },
    RegistrationFailed {
        code: Option<Code>,
        cause: Cause,
    },
    /// A new incoming session
    Invite(Session),
    /// An out-of-dialog MESSAGE, already answered with 200
    Message(IncomingMessage),
}

impl From<RegistrationEvent> for UaEvent {
    fn from(event: RegistrationEvent) -> Self {
        match event {
            RegistrationEvent::Registered { expires } => UaEvent::Registered { expires },
            RegistrationEvent::Unregistered { code, cause } => UaEvent::Unregistered { code, cause },
            RegistrationEvent::RegistrationFailed { code, cause } => {
                UaEvent::RegistrationFailed { code, cause }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub from: NameAddr,
    pub to: NameAddr,
    pub content_type: Option<ContentType>,
    pub body: Bytes,
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Inner {
    config: Config,
    endpoint: Endpoint,
    profile: Profile,
    registrator: Registrator,
    connector: Arc<dyn Connector>,
    events: Emitter<UaEvent>,
    logger: Logger,

    register_headers: Arc<Mutex<Vec<String>>>,
    sessions: Arc<Mutex<SlotMap<SessionKey, Session>>>,
    subscriptions: Arc<Mutex<SlotMap<SubscriptionKey, Subscription>>>,

    running: Mutex<Option<Running>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.cancel.cancel();
        }
    }
}

/// A SIP user agent connected through a WebSocket server.
///
/// Clones refer to the same user agent. Must be created inside a tokio runtime.
#[derive(Clone)]
pub struct UserAgent {
    inner: Arc<Inner>,
}

impl fmt::Debug for UserAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserAgent")
            .field("uri", &self.inner.config.uri)
            .field("connected", &self.is_connected())
            .field("registered", &self.is_registered())
            .finish()
    }
}

impl UserAgent {
    /// Validate `config` and create the user agent.
    ///
    /// Connections are created with `connector`, every session gets a media handler from `media`.
    /// With `autostart` set the user agent starts connecting right away.
    pub fn new(
        config: Config,
        connector: Arc<dyn Connector>,
        media: Arc<dyn MediaHandlerFactory>,
    ) -> Result<Self> {
        config.validate()?;

        let logger = Logger::new("sip.ua", &config.log);

        let media: Arc<dyn MediaHandlerFactory> = if config.hack_clean_jitsi_sdp_imageattr {
            Arc::new(CleanImageattr { inner: media })
        } else {
            media
        };

        let mut profile = Profile::new(config.identity()?, contact(&config), media);
        profile.credentials = config.credentials()?;
        profile.rel100 = config.rel100;
        profile.replaces = config.replaces;
        profile.dtmf_type = config.dtmf_type;
        profile.no_answer_timeout = Duration::from_secs(config.no_answer_timeout);
        profile.allow_legacy_notifications = config.allow_legacy_notifications;
        profile.media_options = MediaHandlerOptions {
            stun_servers: config.stun_servers.clone(),
            turn_servers: config.turn_servers.clone(),
            ice_checking_timeout: Duration::from_millis(config.ice_checking_timeout),
            ..MediaHandlerOptions::default()
        };

        let events = Emitter::new();
        let incoming = Emitter::new();

        let mut builder = Endpoint::builder();
        builder
            .set_user_agent(
                config
                    .user_agent_string
                    .clone()
                    .unwrap_or_else(|| format!("sipline/{}", env!("CARGO_PKG_VERSION"))),
            )
            .set_timers(config.timers())
            .set_trace_sip(config.trace_sip);

        builder.add_layer(DialogLayer::default());
        builder.add_layer(InviteLayer::new(profile.clone(), incoming.clone()));
        builder.add_layer(SubscriptionLayer::default());
        builder.add_layer(UaLayer {
            events: events.clone(),
            logger: logger.clone(),
        });

        let endpoint = builder.build();

        let registrator = Registrator::new(
            endpoint.clone(),
            profile.clone(),
            config.registrar()?,
            Duration::from_secs(config.register_expires.into()),
        );

        let forward = events.clone();
        let registration_logger = Logger::new("sip.registrator", &config.log);
        registrator.events().on(move |event: &RegistrationEvent| {
            registration_logger.debug(format_args!("{event:?}"));
            forward.emit(event.clone().into());
        });

        let sessions = Arc::new(Mutex::new(SlotMap::with_key()));

        let forward = events.clone();
        let weak_sessions = Arc::downgrade(&sessions);
        incoming.on(move |session: &Session| {
            track_session(&weak_sessions, session);
            forward.emit(UaEvent::Invite(session.clone()));
        });

        let inner = Arc::new(Inner {
            config,
            endpoint,
            profile,
            registrator,
            connector,
            events,
            logger,
            register_headers: Default::default(),
            sessions,
            subscriptions: Arc::new(Mutex::new(SlotMap::with_key())),
            running: Mutex::new(None),
        });

        let ua = Self { inner };

        if ua.inner.config.autostart {
            ua.start();
        }

        Ok(ua)
    }

    pub fn events(&self) -> &Emitter<UaEvent> {
        &self.inner.events
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    pub fn profile(&self) -> &Profile {
        &self.inner.profile
    }

    pub fn is_connected(&self) -> bool {
        self.inner.endpoint.is_connected()
    }

    pub fn is_registered(&self) -> bool {
        self.inner.registrator.is_registered()
    }

    /// Start connecting, does nothing if already started
    pub fn start(&self) {
        let mut running = self.inner.running.lock();

        if running.is_some() {
            return;
        }

        let config = &self.inner.config;
        let cancel = CancellationToken::new();

        let task = ConnectionTask {
            endpoint: self.inner.endpoint.clone(),
            connector: self.inner.connector.clone(),
            flags: config.interop_flags(),
            schedule: Schedule::from_config(config),
            preloaded_route: config
                .use_preloaded_route
                .then(|| self.inner.profile.preloaded_route.clone()),
            registrator: self.inner.registrator.clone(),
            register: config.register,
            register_headers: self.inner.register_headers.clone(),
            events: self.inner.events.clone(),
            logger: Logger::new("sip.transport", &config.log),
            cancel: cancel.clone(),
        };

        self.inner.logger.info(format_args!("user agent starting"));

        *running = Some(Running {
            cancel,
            task: task.spawn(),
        });
    }

    /// Terminate every session and subscription, remove the binding and close the transport.
    ///
    /// The user agent can be started again afterwards.
    pub async fn stop(&self) {
        let Some(running) = self.inner.running.lock().take() else {
            return;
        };

        self.inner.logger.info(format_args!("user agent stopping"));

        let sessions: Vec<Session> = self.inner.sessions.lock().values().cloned().collect();
        for session in sessions {
            if let Err(e) = session.terminate(TerminateOptions::default()).await {
                self.inner
                    .logger
                    .debug(format_args!("failed to terminate session {}, {e}", session.id()));
            }
        }

        let subscriptions: Vec<Subscription> =
            self.inner.subscriptions.lock().values().cloned().collect();
        for subscription in subscriptions {
            subscription.unsubscribe().await;
        }

        if self.inner.registrator.is_registered() {
            self.inner.registrator.close().await;
        }

        running.cancel.cancel();

        if let Err(e) = running.task.await {
            self.inner
                .logger
                .error(format_args!("connection task failed, {e}"));
        }
    }

    /// Send a REGISTER, `extra_headers` (`Name: value`) are also used for refreshes and
    /// re-registrations after a reconnect
    pub async fn register(&self, extra_headers: Vec<String>) -> Result<Duration> {
        *self.inner.register_headers.lock() = extra_headers.clone();

        Ok(self.inner.registrator.register(&extra_headers).await?)
    }

    /// Remove the own binding, or every binding of the identity with `all`
    pub async fn unregister(&self, all: bool, extra_headers: Vec<String>) -> Result<()> {
        Ok(self.inner.registrator.unregister(all, &extra_headers).await?)
    }

    /// Call `target`, a SIP URI or just a user of the own domain
    pub fn invite(&self, target: &str, options: InviteOptions) -> Result<Session> {
        let target = self.normalize_target(target)?;

        let session = Session::invite(
            self.inner.endpoint.clone(),
            self.inner.profile.clone(),
            target,
            options,
        )?;

        track_session(&Arc::downgrade(&self.inner.sessions), &session);

        Ok(session)
    }

    /// Send a MESSAGE with `body`, `text/plain` unless `options` set a content type
    pub fn message(
        &self,
        target: &str,
        body: impl Into<Bytes>,
        mut options: RequestOptions,
    ) -> Result<ClientContext> {
        options.body = body.into();
        options.content_type.get_or_insert(ContentType::TEXT_PLAIN);

        self.request(Method::MESSAGE, target, options)
    }

    /// Send an out-of-dialog request
    pub fn request(
        &self,
        method: Method,
        target: &str,
        options: RequestOptions,
    ) -> Result<ClientContext> {
        let target = self.normalize_target(target)?;

        Ok(ClientContext::send(
            self.inner.endpoint.clone(),
            &self.inner.profile,
            method,
            target,
            options,
        )?)
    }

    /// Subscribe to `event` at `target`
    pub fn subscribe(
        &self,
        target: &str,
        event: Event,
        options: SubscribeOptions,
    ) -> Result<Subscription> {
        let target = self.normalize_target(target)?;

        let subscription = Subscription::subscribe(
            self.inner.endpoint.clone(),
            self.inner.profile.clone(),
            target,
            event,
            options,
        )?;

        let key = self.inner.subscriptions.lock().insert(subscription.clone());

        let weak = Arc::downgrade(&self.inner.subscriptions);
        subscription
            .events()
            .on(move |event: &SubscriptionEvent| {
                if let SubscriptionEvent::Terminated { .. } = event
                    && let Some(subscriptions) = weak.upgrade()
                {
                    subscriptions.lock().remove(key);
                }
            });

        if subscription.state() == SubscriptionStatus::Terminated {
            self.inner.subscriptions.lock().remove(key);
        }

        Ok(subscription)
    }

    /// Complete `target` to a SIP URI: the scheme is added when missing and a bare user
    /// gets the domain of the own identity
    fn normalize_target(&self, target: &str) -> Result<SipUri> {
        let invalid = || Error::Ua(sip_ua::Error::InvalidTarget(target.to_owned()));

        let target = target.trim();
        if target.is_empty() {
            return Err(invalid());
        }

        let (scheme, rest) = match target.split_once(':') {
            Some((scheme, rest)) if scheme.eq_ignore_ascii_case("sip") => ("sip", rest),
            Some((scheme, rest)) if scheme.eq_ignore_ascii_case("sips") => ("sips", rest),
            _ => ("sip", target),
        };

        let uri = if rest.contains('@') {
            format!("{scheme}:{rest}")
        } else {
            format!("{scheme}:{rest}@{}", self.inner.config.domain()?)
        };

        uri.parse().map_err(|_| invalid())
    }
}

/// Keep `session` in the registry until it terminates
fn track_session(sessions: &Weak<Mutex<SlotMap<SessionKey, Session>>>, session: &Session) {
    let Some(registry) = sessions.upgrade() else {
        return;
    };

    let key = registry.lock().insert(session.clone());

    let sessions = sessions.clone();
    session.events().on(move |event: &SessionEvent| {
        if let SessionEvent::Terminated { .. } = event
            && let Some(sessions) = sessions.upgrade()
        {
            sessions.lock().remove(key);
        }
    });

    // ended before the listener was in place
    if session.is_ended() {
        registry.lock().remove(key);
    }
}

/// Random contact, reachable only through the connection to the WebSocket server
fn contact(config: &Config) -> Contact {
    let mut uri = SipUri::new(sip_types::host::HostPort::host_name(format!(
        "{}.invalid",
        random_string(12)
    )))
    .with_user(random_string(8))
    .with_param("transport", Some("ws"));

    if config.hack_ip_in_contact {
        uri.host_port = sip_types::host::HostPort::new(
            sip_types::host::Host::IP4(std::net::Ipv4Addr::new(
                192,
                0,
                2,
                rng().random_range(1..255),
            )),
            None,
        );
    }

    let mut addr = NameAddr::uri(uri);

    if let Some(instance_id) = &config.instance_id {
        addr.set_param("+sip.instance", Some(format!("\"<urn:uuid:{instance_id}>\"").as_str()));
    }

    Contact::new(addr)
}

fn random_string(len: usize) -> String {
    rng()
        .sample_iter(Alphanumeric)
        .take(len)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}
