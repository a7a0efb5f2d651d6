//! Binding of the user agent's contact to a registrar (RFC 3261 Section 10)

use crate::cause::{Cause, sip_error_cause};
use crate::emitter::Emitter;
use crate::profile::{Authenticator, Profile, bump_cseq};
use crate::util::{extend_headers, random_sequence_number, random_token, refresh_delay};
use crate::{Error, Result};
use parking_lot::Mutex;
use sip_core::transaction::TsxResponse;
use sip_core::{Endpoint, Request};
use sip_types::header::typed::{CSeq, CallID, Contact, Expires, FromTo, MaxForwards, MinExpires};
use sip_types::uri::{NameAddr, SipUri};
use sip_types::{Code, CodeKind, Method, Name};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationEvent {
    Registered {
        /// Lifetime of the binding granted by the registrar
        expires: Duration,
    },
    Unregistered {
        code: Option<Code>,
        /// `None` when the binding was removed on request
        cause: Option<Cause>,
    },
    RegistrationFailed {
        code: Option<Code>,
        cause: Cause,
    },
}

/// Why a REGISTER transaction did not succeed
struct Failure {
    code: Option<Code>,
    cause: Cause,
}

impl From<Error> for Failure {
    fn from(e: Error) -> Self {
        Failure {
            code: None,
            cause: e.cause(),
        }
    }
}

impl From<sip_core::Error> for Failure {
    fn from(e: sip_core::Error) -> Self {
        Error::from(e).into()
    }
}

/// REGISTER request state, one Call-ID for the lifetime of the [`Registrator`]
struct Binding {
    from: FromTo,
    to: FromTo,
    call_id: CallID,
    cseq: u32,

    /// Requested lifetime in seconds, may be raised by a 423 response
    expires: u32,
    extra_headers: Vec<String>,
    authenticator: Authenticator,
}

impl Binding {
    fn create_register(
        &mut self,
        profile: &Profile,
        registrar: &SipUri,
        endpoint: &Endpoint,
        remove: Option<RemoveBinding>,
    ) -> Result<Request> {
        let mut request = Request::new(Method::REGISTER, registrar.clone());

        self.cseq += 1;

        let headers = &mut request.headers;
        headers.insert_type(Name::FROM, &self.from);
        headers.insert_type(Name::TO, &self.to);
        headers.insert_named(&self.call_id);
        headers.insert_named(&CSeq::new(self.cseq, Method::REGISTER));
        headers.insert_named(&MaxForwards(70));

        if let Some(route) = profile.preloaded_route.get() {
            headers.insert_type(Name::ROUTE, &route);
        }

        match remove {
            Some(RemoveBinding::All) => {
                headers.insert(Name::CONTACT, "*");
                headers.insert_named(&Expires(0));
            }
            Some(RemoveBinding::Own) => {
                headers.insert_named(&profile.contact);
                headers.insert_named(&Expires(0));
            }
            None => {
                headers.insert_named(&profile.contact);
                headers.insert_named(&Expires(self.expires));
            }
        }

        headers.insert_named(endpoint.allowed());

        extend_headers(headers, &self.extra_headers)?;

        self.authenticator.authorize(&mut request);

        Ok(request)
    }

    /// Lifetime granted in a 2XX response: our contact's expires param, the Expires header
    /// or the requested lifetime, in that order
    fn granted_expires(&self, own_contact: &Contact, response: &TsxResponse) -> u32 {
        let contacts = response
            .headers
            .try_get_named::<Vec<Contact>>()
            .and_then(|contacts| contacts.ok())
            .unwrap_or_default();

        contacts
            .iter()
            .find(|contact| contact.addr.uri == own_contact.addr.uri)
            .and_then(Contact::expires)
            .or_else(|| {
                response
                    .headers
                    .get_named::<Expires>()
                    .ok()
                    .map(|expires| expires.0)
            })
            .unwrap_or(self.expires)
    }
}

#[derive(Clone, Copy)]
enum RemoveBinding {
    Own,
    All,
}

#[derive(Default)]
struct State {
    registered: bool,
    refresh: Option<CancellationToken>,
    /// Bumped whenever the refresh timer is canceled, a transaction started under an older
    /// generation must not arm a new timer
    generation: u64,
}

struct Inner {
    endpoint: Endpoint,
    profile: Profile,
    registrar: SipUri,

    /// Serializes REGISTER transactions
    binding: tokio::sync::Mutex<Binding>,
    state: Mutex<State>,
    events: Emitter<RegistrationEvent>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(refresh) = self.state.get_mut().refresh.take() {
            refresh.cancel();
        }
    }
}

/// Registration manager, keeps the binding alive until [`Registrator::unregister`] or a failure.
///
/// Failed registrations are never retried automatically, call [`Registrator::register`] again.
#[derive(Clone)]
pub struct Registrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Registrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registrator")
            .field("registrar", &self.inner.registrar)
            .field("registered", &self.is_registered())
            .finish()
    }
}

impl Registrator {
    /// Create a registration manager for `profile`'s identity, requesting bindings of `expires`
    pub fn new(endpoint: Endpoint, profile: Profile, registrar: SipUri, expires: Duration) -> Self {
        let identity = NameAddr::new(
            profile.identity.display_name.clone(),
            profile.identity.uri.clone(),
        );

        let binding = Binding {
            from: FromTo::new(identity.clone(), Some(random_token(10))),
            to: FromTo::new(identity, None),
            call_id: CallID::new(random_token(22)),
            cseq: random_sequence_number() % 10_000,
            expires: expires.as_secs().max(1) as u32,
            extra_headers: vec![],
            authenticator: profile.authenticator(),
        };

        Self {
            inner: Arc::new(Inner {
                endpoint,
                profile,
                registrar,
                binding: tokio::sync::Mutex::new(binding),
                state: Mutex::new(State::default()),
                events: Emitter::new(),
            }),
        }
    }

    pub fn events(&self) -> &Emitter<RegistrationEvent> {
        &self.inner.events
    }

    pub fn registrar(&self) -> &SipUri {
        &self.inner.registrar
    }

    pub fn is_registered(&self) -> bool {
        self.inner.state.lock().registered
    }

    /// Send a REGISTER, `extra_headers` are kept for refreshes.
    ///
    /// Returns the granted lifetime. Events are emitted in either case.
    pub async fn register(&self, extra_headers: &[String]) -> Result<Duration> {
        self.cancel_refresh();

        let mut binding = self.inner.binding.lock().await;
        binding.extra_headers = extra_headers.to_vec();

        let generation = self.inner.state.lock().generation;
        self.register_locked(&mut binding, generation).await
    }

    async fn refresh(&self, token: CancellationToken) {
        let mut binding = self.inner.binding.lock().await;

        // canceled while waiting for another transaction
        if token.is_cancelled() {
            return;
        }

        log::debug!("refreshing registration at {}", self.inner.registrar);

        let generation = self.inner.state.lock().generation;
        let _ = self.register_locked(&mut binding, generation).await;
    }

    async fn register_locked(&self, binding: &mut Binding, generation: u64) -> Result<Duration> {
        match self.transact(binding, None).await {
            Ok(response) => {
                let granted = binding.granted_expires(&self.inner.profile.contact, &response);
                let expires = Duration::from_secs(granted.into());

                log::debug!(
                    "registered at {} for {}s",
                    self.inner.registrar,
                    expires.as_secs()
                );

                self.schedule_refresh(expires, generation);
                self.inner
                    .events
                    .emit(RegistrationEvent::Registered { expires });

                Ok(expires)
            }
            Err(Failure { code, cause }) => {
                log::error!("registration at {} failed, {cause}", self.inner.registrar);

                let was_registered = {
                    let mut state = self.inner.state.lock();
                    if let Some(refresh) = state.refresh.take() {
                        refresh.cancel();
                    }
                    std::mem::replace(&mut state.registered, false)
                };

                self.inner.events.emit(RegistrationEvent::RegistrationFailed {
                    code,
                    cause: cause.clone(),
                });

                if was_registered {
                    self.inner.events.emit(RegistrationEvent::Unregistered {
                        code,
                        cause: Some(cause.clone()),
                    });
                }

                Err(Error::Failed(cause))
            }
        }
    }

    /// Remove the binding, or every binding of the identity when `all` is set.
    ///
    /// Does nothing if not registered, unless `all` is set.
    pub async fn unregister(&self, all: bool, extra_headers: &[String]) -> Result<()> {
        self.cancel_refresh();

        let mut binding = self.inner.binding.lock().await;

        // a refresh holding the lock before may have armed a new timer
        self.cancel_refresh();

        if !all && !self.is_registered() {
            log::debug!("not registered, nothing to unregister");
            return Ok(());
        }

        binding.extra_headers = extra_headers.to_vec();

        let remove = if all {
            RemoveBinding::All
        } else {
            RemoveBinding::Own
        };

        let result = self.transact(&mut binding, Some(remove)).await;

        self.inner.state.lock().registered = false;

        match result {
            Ok(response) => {
                self.inner.events.emit(RegistrationEvent::Unregistered {
                    code: Some(response.line.code),
                    cause: None,
                });

                Ok(())
            }
            Err(Failure { code, cause }) => {
                log::warn!("unregister at {} failed, {cause}", self.inner.registrar);

                self.inner.events.emit(RegistrationEvent::Unregistered {
                    code,
                    cause: Some(cause.clone()),
                });

                Err(Error::Failed(cause))
            }
        }
    }

    /// The connection was lost, the binding is considered gone.
    ///
    /// Returns if a binding existed.
    pub fn transport_closed(&self) -> bool {
        self.cancel_refresh();

        let was_registered = std::mem::replace(&mut self.inner.state.lock().registered, false);

        if was_registered {
            self.inner.events.emit(RegistrationEvent::Unregistered {
                code: None,
                cause: Some(Cause::ConnectionError),
            });
        }

        was_registered
    }

    /// Stop refreshing and remove the binding if one exists
    pub async fn close(&self) {
        if let Err(e) = self.unregister(false, &[]).await {
            log::debug!("failed to remove binding while closing, {e}");
        }
    }

    fn cancel_refresh(&self) {
        let mut state = self.inner.state.lock();
        state.generation += 1;

        if let Some(refresh) = state.refresh.take() {
            refresh.cancel();
        }
    }

    fn schedule_refresh(&self, expires: Duration, generation: u64) {
        let token = CancellationToken::new();
        let delay = refresh_delay(expires, self.inner.profile.refresh_margin);

        {
            let mut state = self.inner.state.lock();
            state.registered = true;

            if state.generation != generation {
                log::debug!("refresh canceled while the REGISTER was pending");
                return;
            }

            if let Some(previous) = state.refresh.replace(token.clone()) {
                previous.cancel();
            }
        }

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            if let Some(inner) = weak.upgrade() {
                Registrator { inner }.refresh(token).await;
            }
        });
    }

    /// Send a REGISTER, retrying after authentication challenges and `423 Interval Too Brief`
    async fn transact(
        &self,
        binding: &mut Binding,
        remove: Option<RemoveBinding>,
    ) -> Result<TsxResponse, Failure> {
        let endpoint = &self.inner.endpoint;

        let mut request =
            binding.create_register(&self.inner.profile, &self.inner.registrar, endpoint, remove)?;
        let mut raised_expires = false;

        loop {
            let mut tsx = endpoint.send_request(request.clone()).await?;
            let response = tsx.receive_final().await?;
            let code = response.line.code;

            if code.kind() == CodeKind::Success {
                return Ok(response);
            }

            if binding
                .authenticator
                .handle_response(tsx.request(), &response, &mut request)
            {
                binding.cseq += 1;
                continue;
            }

            if code == Code::INTERVAL_TOO_BRIEF && remove.is_none() && !raised_expires {
                if let Ok(MinExpires(min)) = response.headers.get_named::<MinExpires>() {
                    log::debug!("registrar requires an expiry of at least {min}s");

                    raised_expires = true;
                    binding.expires = min;
                    binding.cseq += 1;

                    request.headers.insert_named(&Expires(min));
                    bump_cseq(&mut request);
                    binding.authenticator.authorize(&mut request);
                    continue;
                }
            }

            return Err(Failure {
                code: Some(code),
                cause: sip_error_cause(code, response.line.reason.as_ref()),
            });
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::media::StaticMedia;
    use crate::test_util::{MessageExt, Peer, SDP, connected_endpoint};
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    fn registrator(endpoint: Endpoint) -> Registrator {
        let profile = Profile::new(
            "\"Alice\" <sip:alice@example.com>".parse().unwrap(),
            Contact::new(NameAddr::uri(
                "sip:alice@sipline.invalid;transport=ws".parse().unwrap(),
            )),
            StaticMedia::factory(SDP),
        );

        Registrator::new(
            endpoint,
            profile,
            "sip:example.com".parse().unwrap(),
            Duration::from_secs(600),
        )
    }

    async fn expect_register(peer: &mut Peer) -> sip_core::transport::ParsedMessage {
        let request = peer.receive().await;
        assert_eq!(request.method(), Some(Method::REGISTER));
        request
    }

    fn drain(events: &mut mpsc::UnboundedReceiver<RegistrationEvent>) -> Vec<RegistrationEvent> {
        let mut drained = vec![];
        while let Ok(event) = events.try_recv() {
            drained.push(event);
        }
        drained
    }

    #[tokio::test(start_paused = true)]
    async fn register_and_refresh_before_expiry() {
        let (endpoint, mut peer) = connected_endpoint(|_| {}).await;
        let registrator = registrator(endpoint);
        let mut events = registrator.events().subscribe();

        let register = {
            let registrator = registrator.clone();
            tokio::spawn(async move { registrator.register(&["X-Test: yes".into()]).await })
        };

        let request = expect_register(&mut peer).await;
        assert_eq!(request.header("Expires").as_deref(), Some("600"));
        assert_eq!(request.header("X-Test").as_deref(), Some("yes"));
        assert_eq!(request.line.to_string(), "REGISTER sip:example.com SIP/2.0");
        let call_id = request.header("Call-ID");

        peer.send(
            peer.response_to(&request, 200, Some("reg"))
                .header("Contact", "<sip:alice@sipline.invalid;transport=ws>;expires=60")
                .build(),
        );

        assert_eq!(
            register.await.unwrap().unwrap(),
            Duration::from_secs(60)
        );
        assert!(registrator.is_registered());
        assert_eq!(
            drain(&mut events),
            vec![RegistrationEvent::Registered {
                expires: Duration::from_secs(60)
            }]
        );

        let registered_at = Instant::now();
        let refresh = expect_register(&mut peer).await;
        assert_eq!(registered_at.elapsed(), Duration::from_secs(57));
        assert_eq!(refresh.header("Call-ID"), call_id);
        assert_eq!(refresh.header("X-Test").as_deref(), Some("yes"));

        peer.respond(&refresh, 200, Some("reg"));
        assert!(matches!(
            events.recv().await.unwrap(),
            RegistrationEvent::Registered { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn failure_does_not_schedule_refresh() {
        let (endpoint, mut peer) = connected_endpoint(|_| {}).await;
        let registrator = registrator(endpoint);
        let mut events = registrator.events().subscribe();

        let register = {
            let registrator = registrator.clone();
            tokio::spawn(async move { registrator.register(&[]).await })
        };

        let request = expect_register(&mut peer).await;
        peer.respond(&request, 403, None);

        let error = register.await.unwrap().unwrap_err();
        assert_eq!(error.cause(), Cause::Rejected);
        assert!(!registrator.is_registered());
        assert_eq!(
            drain(&mut events),
            vec![RegistrationEvent::RegistrationFailed {
                code: Some(Code::FORBIDDEN),
                cause: Cause::Rejected
            }]
        );

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert!(peer.nothing_sent());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_refresh_unregisters() {
        let (endpoint, mut peer) = connected_endpoint(|_| {}).await;
        let registrator = registrator(endpoint);
        let mut events = registrator.events().subscribe();

        let register = {
            let registrator = registrator.clone();
            tokio::spawn(async move { registrator.register(&[]).await })
        };

        let request = expect_register(&mut peer).await;
        peer.respond(&request, 200, Some("reg"));
        register.await.unwrap().unwrap();

        let refresh = expect_register(&mut peer).await;
        peer.respond(&refresh, 503, Some("reg"));

        let _registered = events.recv().await.unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            RegistrationEvent::RegistrationFailed {
                code: Some(Code::from(503)),
                cause: Cause::SipFailureCode {
                    code: Code::from(503),
                    reason: Some("Service Unavailable".into())
                }
            }
        );
        assert!(matches!(
            events.recv().await.unwrap(),
            RegistrationEvent::Unregistered {
                code: Some(_),
                cause: Some(_)
            }
        ));
        assert!(!registrator.is_registered());
    }

    #[tokio::test(start_paused = true)]
    async fn interval_too_brief_retries_with_min_expires() {
        let (endpoint, mut peer) = connected_endpoint(|_| {}).await;
        let registrator = registrator(endpoint);

        let register = {
            let registrator = registrator.clone();
            tokio::spawn(async move { registrator.register(&[]).await })
        };

        let request = expect_register(&mut peer).await;
        peer.send(
            peer.response_to(&request, 423, Some("reg"))
                .header("Min-Expires", "1800")
                .build(),
        );

        let retry = expect_register(&mut peer).await;
        assert_eq!(retry.header("Expires").as_deref(), Some("1800"));
        assert_ne!(retry.header("CSeq"), request.header("CSeq"));

        peer.respond(&retry, 200, Some("reg"));

        assert_eq!(
            register.await.unwrap().unwrap(),
            Duration::from_secs(1800)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unregister_all_uses_wildcard() {
        let (endpoint, mut peer) = connected_endpoint(|_| {}).await;
        let registrator = registrator(endpoint);
        let mut events = registrator.events().subscribe();

        let unregister = {
            let registrator = registrator.clone();
            tokio::spawn(async move { registrator.unregister(true, &[]).await })
        };

        let request = expect_register(&mut peer).await;
        assert_eq!(request.header("Contact").as_deref(), Some("*"));
        assert_eq!(request.header("Expires").as_deref(), Some("0"));

        peer.respond(&request, 200, Some("reg"));
        unregister.await.unwrap().unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            RegistrationEvent::Unregistered {
                code: Some(Code::OK),
                cause: None
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unregister_without_binding_sends_nothing() {
        let (endpoint, mut peer) = connected_endpoint(|_| {}).await;
        let registrator = registrator(endpoint);

        registrator.unregister(false, &[]).await.unwrap();

        tokio::task::yield_now().await;
        assert!(peer.nothing_sent());
    }

    #[tokio::test(start_paused = true)]
    async fn unregister_cancels_refresh() {
        let (endpoint, mut peer) = connected_endpoint(|_| {}).await;
        let registrator = registrator(endpoint);

        let register = {
            let registrator = registrator.clone();
            tokio::spawn(async move { registrator.register(&[]).await })
        };

        let request = expect_register(&mut peer).await;
        peer.respond(&request, 200, Some("reg"));
        register.await.unwrap().unwrap();

        let unregister = {
            let registrator = registrator.clone();
            tokio::spawn(async move { registrator.unregister(false, &[]).await })
        };

        let request = expect_register(&mut peer).await;
        assert_eq!(
            request.header("Contact").as_deref(),
            Some("<sip:alice@sipline.invalid;transport=ws>")
        );
        assert_eq!(request.header("Expires").as_deref(), Some("0"));
        peer.respond(&request, 200, Some("reg"));
        unregister.await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert!(peer.nothing_sent());
    }

    #[tokio::test(start_paused = true)]
    async fn unregister_during_pending_refresh_stops_refreshing() {
        let (endpoint, mut peer) = connected_endpoint(|_| {}).await;
        let registrator = registrator(endpoint);

        let register = {
            let registrator = registrator.clone();
            tokio::spawn(async move { registrator.register(&[]).await })
        };

        let request = expect_register(&mut peer).await;
        peer.send(
            peer.response_to(&request, 200, Some("reg"))
                .header("Expires", "60")
                .build(),
        );
        register.await.unwrap().unwrap();

        let refresh = expect_register(&mut peer).await;
        assert_ne!(refresh.header("Expires").as_deref(), Some("0"));

        let unregister = {
            let registrator = registrator.clone();
            tokio::spawn(async move { registrator.unregister(false, &[]).await })
        };
        tokio::task::yield_now().await;

        peer.send(
            peer.response_to(&refresh, 200, Some("reg"))
                .header("Expires", "60")
                .build(),
        );

        let request = expect_register(&mut peer).await;
        assert_eq!(request.header("Expires").as_deref(), Some("0"));
        peer.respond(&request, 200, Some("reg"));
        unregister.await.unwrap().unwrap();

        assert!(!registrator.is_registered());

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert!(peer.nothing_sent());
    }
}
