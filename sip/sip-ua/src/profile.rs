use crate::media::{MediaHandlerFactory, MediaHandlerOptions};
use crate::util::{random_sequence_number, random_token};
use sip_auth::{
    ClientAuthenticator, DigestAuthenticator, DigestCredentials, DigestUser, RequestParts,
    ResponseParts,
};
use parking_lot::Mutex;
use sip_core::Request;
use sip_core::transaction::TsxResponse;
use sip_core::transport::OutgoingRequest;
use sip_types::header::typed::{CSeq, CallID, Contact, FromTo, MaxForwards, Routing};
use sip_types::uri::{NameAddr, SipUri};
use sip_types::{Code, Method, Name};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Use of an optional SIP extension, e.g. reliable provisional responses (RFC 3262)
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize), serde(rename_all = "lowercase"))]
pub enum Support {
    #[default]
    None,
    Supported,
    Required,
}

/// How DTMF tones are sent
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize), serde(rename_all = "lowercase"))]
pub enum DtmfType {
    /// SIP INFO requests with `application/dtmf-relay` bodies
    #[default]
    Info,
    /// Through the media handler (RFC 2833 events)
    Rtp,
}

/// Route to the currently connected edge proxy, replaced whenever the transport changes
#[derive(Debug, Default, Clone)]
pub struct PreloadedRoute(Arc<Mutex<Option<Routing>>>);

impl PreloadedRoute {
    pub fn set(&self, route: Option<Routing>) {
        *self.0.lock() = route;
    }

    pub fn get(&self) -> Option<Routing> {
        self.0.lock().clone()
    }
}

/// Identity and behavior shared by every registration, session and subscription of a user agent
#[derive(Clone)]
pub struct Profile {
    /// Local identity, used in From headers
    pub identity: NameAddr,
    pub contact: Contact,
    pub credentials: Option<DigestUser>,

    /// Route put into every out-of-dialog request, shared between clones of the profile
    pub preloaded_route: PreloadedRoute,

    pub rel100: Support,
    /// Accept INVITEs replacing an established session (RFC 3891)
    pub replaces: Support,
    pub dtmf_type: DtmfType,

    /// Incoming INVITEs not answered within this duration are rejected with 480
    pub no_answer_timeout: Duration,

    /// Registrations and subscriptions are refreshed this long before they expire
    pub refresh_margin: Duration,

    /// Accept NOTIFY requests without a Subscription-State header
    pub allow_legacy_notifications: bool,

    pub media: Arc<dyn MediaHandlerFactory>,

    /// Passed to the media factory, `events` is replaced per session
    pub media_options: MediaHandlerOptions,
}

impl fmt::Debug for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Profile")
            .field("identity", &self.identity)
            .field("contact", &self.contact)
            .field("rel100", &self.rel100)
            .field("replaces", &self.replaces)
            .field("dtmf_type", &self.dtmf_type)
            .finish_non_exhaustive()
    }
}

impl Profile {
    pub fn new(identity: NameAddr, contact: Contact, media: Arc<dyn MediaHandlerFactory>) -> Self {
        Self {
            identity,
            contact,
            credentials: None,
            preloaded_route: PreloadedRoute::default(),
            rel100: Support::None,
            replaces: Support::None,
            dtmf_type: DtmfType::Info,
            no_answer_timeout: Duration::from_secs(60),
            refresh_margin: Duration::from_secs(3),
            allow_legacy_notifications: false,
            media,
            media_options: MediaHandlerOptions::default(),
        }
    }

    /// Create an out-of-dialog request with a fresh Call-ID and From tag
    pub fn create_request(&self, method: Method, target: SipUri) -> Request {
        let mut request = Request::new(method.clone(), target.clone());

        let headers = &mut request.headers;

        headers.insert_type(
            Name::FROM,
            &FromTo::new(self.identity.clone(), Some(random_token(10))),
        );
        headers.insert_type(Name::TO, &FromTo::new(NameAddr::uri(target), None));
        headers.insert_named(&CallID::new(random_token(22)));
        headers.insert_named(&CSeq::new(random_sequence_number() % 10_000 + 1, method.clone()));
        headers.insert_named(&MaxForwards(70));

        if let Some(route) = self.preloaded_route.get() {
            headers.insert_type(Name::ROUTE, &route);
        }

        if matches!(method, Method::INVITE | Method::SUBSCRIBE | Method::REFER) {
            headers.insert_named(&self.contact);
        }

        request
    }

    pub(crate) fn authenticator(&self) -> Authenticator {
        let mut credentials = DigestCredentials::new();

        if let Some(user) = &self.credentials {
            credentials.set_default(user.clone());
        }

        Authenticator {
            digest: DigestAuthenticator::new(credentials),
            enabled: self.credentials.is_some(),
        }
    }
}

/// Digest authentication state of one request flow (e.g. a REGISTER or INVITE with its retries)
pub(crate) struct Authenticator {
    digest: DigestAuthenticator,
    enabled: bool,
}

impl Authenticator {
    /// Add credentials for every challenge seen so far
    pub(crate) fn authorize(&mut self, request: &mut Request) {
        request.headers.remove(&Name::AUTHORIZATION);
        request.headers.remove(&Name::PROXY_AUTHORIZATION);

        self.digest
            .authorize_request(&request.line, &mut request.headers);
    }

    /// Returns true if `request` should be sent again after `response` rejected it.
    ///
    /// The CSeq of `request` is incremented in that case.
    pub(crate) fn handle_response(
        &mut self,
        sent: &OutgoingRequest,
        response: &TsxResponse,
        request: &mut Request,
    ) -> bool {
        if !matches!(
            response.line.code,
            Code::UNAUTHORIZED | Code::PROXY_AUTHENTICATION_REQUIRED
        ) || !self.enabled
        {
            return false;
        }

        let result = self.digest.handle_rejection(
            RequestParts {
                line: &sent.msg.line,
                headers: &sent.msg.headers,
                body: &sent.msg.body,
            },
            ResponseParts {
                line: &response.line,
                headers: &response.headers,
                body: &response.body,
            },
        );

        if let Err(e) = result {
            log::warn!("authentication of {} failed, {e}", sent.msg.line.method);
            return false;
        }

        bump_cseq(request);
        self.authorize(request);

        true
    }
}

pub(crate) fn bump_cseq(request: &mut Request) {
    if let Err(e) = request.headers.edit_named(|cseq: &mut CSeq| cseq.cseq += 1) {
        log::warn!("request without valid CSeq, {e}");
    }
}
