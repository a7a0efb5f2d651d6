use crate::transaction::{ClientInvTsx, ClientTsx, ServerInvTsx, ServerTsx, Timers, TsxKey};
use crate::transaction::{Transactions, TsxMessage};
use crate::transport::{
    OutgoingParts, OutgoingRequest, OutgoingResponse, ReceivedMessage, TpHandle, parse_message,
};
use crate::{BaseHeaders, Error, IncomingRequest, Layer, MayTake, Request, Response, Result};
use bytes::{Bytes, BytesMut};
use bytesstr::BytesStr;
use parking_lot::Mutex;
use sip_types::header::typed::{Allow, Supported, Via};
use sip_types::msg::{MessageLine, StatusLine};
use sip_types::print::BytesPrint;
use sip_types::uri::params::Param;
use sip_types::{Code, Headers, Method, Name};
use std::any::type_name;
use std::fmt;
use std::fmt::Write;
use std::mem::take;
use std::sync::Arc;
use tracing::Instrument;

/// The endpoint is the centerpiece of the sip stack. It contains all information about the
/// application and a stack of layered modules which build the logic of SIP applications and
/// its extensions.
///
/// It being a wrapper of a `Arc<Inner>` makes it cheap to clone and store where needed,
/// but the endpoint may never contain itself to avoid cyclic references.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<Inner>,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("inner_refcount", &Arc::strong_count(&self.inner))
            .finish_non_exhaustive()
    }
}

struct Inner {
    // capabilities
    allow: Vec<Allow>,
    supported: Vec<Supported>,
    user_agent: Option<BytesStr>,

    timers: Timers,

    /// Log complete messages on debug instead of trace level
    trace_sip: bool,

    /// The one connection to the server, replaced on reconnect
    transport: Mutex<Option<TpHandle>>,
    transactions: Transactions,

    layer: Box<[Box<dyn Layer>]>,
}

impl Endpoint {
    /// Construct a new [`EndpointBuilder`]
    pub fn builder() -> EndpointBuilder {
        EndpointBuilder::new()
    }

    /// Replace the current transport, `None` when the connection is lost
    pub fn set_transport(&self, transport: Option<TpHandle>) {
        *self.inner.transport.lock() = transport;
    }

    /// The transport all messages are currently sent with
    pub fn transport(&self) -> Result<TpHandle> {
        self.inner
            .transport
            .lock()
            .clone()
            .ok_or(Error::NotConnected)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.transport.lock().is_some()
    }

    /// Sends an INVITE request and return a [`ClientInvTsx`] which MUST be used to drive the transaction
    pub async fn send_invite(&self, request: Request) -> Result<ClientInvTsx> {
        ClientInvTsx::send(self.clone(), request).await
    }

    /// Sends a request and return a [`ClientTsx`] which MUST be used to drive the transaction
    pub async fn send_request(&self, request: Request) -> Result<ClientTsx> {
        let key = TsxKey::client(&request.line.method);

        ClientTsx::send(self.clone(), request, key).await
    }

    /// Send a CANCEL created by [`ClientInvTsx::create_cancel`].
    ///
    /// The CANCEL shares the branch of the INVITE transaction identified by `invite_key`.
    pub async fn send_cancel(&self, request: Request, invite_key: &TsxKey) -> Result<ClientTsx> {
        assert_eq!(request.line.method, Method::CANCEL);

        let key = invite_key.with_method(&Method::CANCEL);

        ClientTsx::send(self.clone(), request, key).await
    }

    /// Create a [`ServerTsx`] from an [`IncomingRequest`]. The returned transaction
    /// can be used to form and send responses to the request.
    pub fn create_server_tsx(&self, request: &mut IncomingRequest) -> ServerTsx {
        ServerTsx::new(request)
    }

    /// Create a [`ServerInvTsx`] from an INVITE [`IncomingRequest`]. The returned transaction
    /// can be used to form and send responses to the request.
    pub fn create_server_inv_tsx(&self, request: &mut IncomingRequest) -> ServerInvTsx {
        ServerInvTsx::new(request)
    }

    /// Returns all ALLOW headers this endpoint supports
    pub fn allowed(&self) -> &Vec<Allow> {
        &self.inner.allow
    }

    /// Returns all SUPPORTED headers this endpoint supports
    pub fn supported(&self) -> &Vec<Supported> {
        &self.inner.supported
    }

    pub fn timers(&self) -> Timers {
        self.inner.timers
    }

    /// Create a VIA header with the given transport and transaction key
    pub fn create_via(&self, transport: &TpHandle, tsx_key: &TsxKey) -> Via {
        let mut via = Via::new(transport.name(), transport.sent_by(), tsx_key.branch().clone());
        via.params.push(Param::name("rport"));
        via
    }

    /// Takes a request and converts it into an [`OutgoingRequest`] bound to the current transport
    pub fn create_outgoing(&self, mut request: Request) -> Result<OutgoingRequest> {
        let transport = self.transport()?;

        if let Some(user_agent) = &self.inner.user_agent
            && !request.headers.contains(&Name::USER_AGENT)
        {
            request
                .headers
                .insert(Name::USER_AGENT, user_agent.clone());
        }

        Ok(OutgoingRequest {
            msg: request,
            parts: OutgoingParts {
                transport,
                buffer: Default::default(),
            },
        })
    }

    /// Print the request to its buffer (if needed) and send it via the transport
    pub async fn send_outgoing_request(&self, message: &mut OutgoingRequest) -> Result<()> {
        if message.parts.buffer.is_empty() {
            message.parts.buffer = print_message(
                &message.msg.line,
                &mut message.msg.headers,
                &message.msg.body,
            )?;
        }

        self.log_outgoing("request", &message.parts);

        message
            .parts
            .transport
            .send(&message.parts.buffer)
            .await
            .map_err(Error::Io)
    }

    /// Print the response to its buffer (if needed) and send it via the transport
    pub async fn send_outgoing_response(&self, message: &mut OutgoingResponse) -> Result<()> {
        if message.parts.buffer.is_empty() {
            message.parts.buffer = print_message(
                &message.msg.line,
                &mut message.msg.headers,
                &message.msg.body,
            )?;
        }

        self.log_outgoing("response", &message.parts);

        message
            .parts
            .transport
            .send(&message.parts.buffer)
            .await
            .map_err(Error::Io)
    }

    fn log_outgoing(&self, kind: &str, parts: &OutgoingParts) {
        if self.inner.trace_sip {
            log::debug!(
                "Sending {kind} via {}\n{:?}",
                parts.transport,
                BytesPrint(&parts.buffer)
            );
        } else {
            log::trace!(
                "Sending {kind} via {}\n{:?}",
                parts.transport,
                BytesPrint(&parts.buffer)
            );
        }
    }

    /// Create a response to an incoming request with a given status code and optional reason
    pub fn create_response(
        &self,
        request: &IncomingRequest,
        code: Code,
        reason: Option<BytesStr>,
    ) -> OutgoingResponse {
        assert_ne!(request.line.method, Method::ACK);

        let mut headers = Headers::with_capacity(6);

        headers.insert_named(&request.base_headers.via);
        headers.insert_type(Name::FROM, &request.base_headers.from);
        headers.insert_type(Name::TO, &request.base_headers.to);
        headers.insert_named(&request.base_headers.call_id);
        headers.insert_named(&request.base_headers.cseq);

        if let Some(user_agent) = &self.inner.user_agent {
            headers.insert(Name::USER_AGENT, user_agent.clone());
        }

        let mut line = StatusLine::new(code);
        if reason.is_some() {
            line.reason = reason;
        }

        OutgoingResponse {
            msg: Response {
                line,
                headers,
                body: Bytes::new(),
            },
            parts: OutgoingParts {
                transport: request.tp_info.transport.clone(),
                buffer: Default::default(),
            },
        }
    }

    /// Pass a raw message received from `transport` to the endpoint for further processing
    ///
    /// Spawns a task internally which will let every registered layer have a look at the message
    /// and let it decide if it is going to handle it.
    pub fn receive(&self, transport: TpHandle, buffer: Bytes) {
        let message = match parse_message(buffer) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("Dropping unparsable message received via {transport}, {e}");
                return;
            }
        };

        tokio::spawn(
            self.clone()
                .do_receive(ReceivedMessage::new(transport, message)),
        );
    }

    #[tracing::instrument(level = "debug", skip(self, message), fields(%message))]
    async fn do_receive(self, mut message: ReceivedMessage) {
        if self.inner.trace_sip {
            log::debug!(
                "Received message via {}\n{:?}",
                message.tp_info.transport,
                BytesPrint(&message.tp_info.buffer)
            );
        } else {
            log::trace!(
                "Received message via {}\n{:?}",
                message.tp_info.transport,
                BytesPrint(&message.tp_info.buffer)
            );
        }

        let mut base_headers = match BaseHeaders::extract_from(&message.headers) {
            Ok(base_headers) => base_headers,
            Err(e) => {
                log::warn!("Failed to get base headers for incoming message, {e}");
                return;
            }
        };

        let tsx_key = match TsxKey::from_message_parts(&message.line, &base_headers) {
            Ok(tsx_key) => tsx_key,
            Err(e) => {
                log::warn!("Failed to get tsx key for incoming message, {e}");
                return;
            }
        };

        let tsx_message = TsxMessage {
            tp_info: message.tp_info,
            line: message.line,
            base_headers,
            headers: message.headers,
            body: message.body,
        };

        // Try to find a transaction that might be able to handle the message
        let tsx = match self.transactions().deliver(&self, &tsx_key, tsx_message) {
            Ok(()) => {
                log::debug!("delegated message to transaction {tsx_key}");
                return;
            }
            Err((rejected, tsx)) => {
                base_headers = rejected.base_headers;
                message = ReceivedMessage {
                    tp_info: rejected.tp_info,
                    line: rejected.line,
                    headers: rejected.headers,
                    body: rejected.body,
                };

                tsx
            }
        };

        // No transaction found - handle it as a new incoming request

        let MessageLine::Request(line) = message.line else {
            log::debug!("dropping orphaned response {}", message.line);
            return;
        };

        let incoming = IncomingRequest {
            tp_info: message.tp_info,
            tsx_key,
            tsx,
            line,
            base_headers,
            headers: message.headers,
            body: message.body,
        };

        let mut request = Some(incoming);

        for layer in self.inner.layer.iter() {
            let span = tracing::info_span!("receive", layer = %layer.name());

            layer
                .receive(&self, MayTake::new(&mut request))
                .instrument(span)
                .await;

            if request.is_none() {
                return;
            }
        }

        let Some(request) = request else {
            return;
        };

        log::debug!("No layer handled the request {}", request.line);

        if let Err(e) = self.handle_unwanted_request(request).await {
            log::warn!("Failed to respond to unhandled incoming request, {e}");
        }
    }

    async fn handle_unwanted_request(&self, mut request: IncomingRequest) -> Result<()> {
        if request.line.method == Method::ACK {
            // Cannot respond to unhandled ACK requests
            return Ok(());
        }

        // in-dialog requests for unknown dialogs
        let response = if request.base_headers.to.tag.is_some() {
            self.create_response(&request, Code::CALL_OR_TRANSACTION_DOES_NOT_EXIST, None)
        } else {
            let mut response = self.create_response(&request, Code::METHOD_NOT_ALLOWED, None);
            response.msg.headers.insert_named(self.allowed());
            response
        };

        if request.line.method == Method::INVITE {
            let tsx = self.create_server_inv_tsx(&mut request);

            tsx.respond_failure(response).await
        } else {
            let tsx = self.create_server_tsx(&mut request);

            tsx.respond(response).await
        }
    }

    pub(crate) fn transactions(&self) -> &Transactions {
        &self.inner.transactions
    }

    /// Access a layer inside the endpoint
    ///
    /// # Panics
    /// Panics if the layer does not exist in the endpoint
    pub fn layer<L: Layer>(&self) -> &L {
        match self.inner.layer.iter().find_map(|l| l.downcast_ref()) {
            Some(layer) => layer,
            None => panic!("endpoint is missing layer {}", type_name::<L>()),
        }
    }
}

fn print_message(
    line: &dyn fmt::Display,
    headers: &mut Headers,
    body: &Bytes,
) -> Result<Bytes> {
    let mut buffer = BytesMut::new();

    headers.remove(&Name::CONTENT_LENGTH);
    headers.insert(Name::CONTENT_LENGTH, body.len().to_string());

    write!(buffer, "{line}\r\n{headers}\r\n")
        .map_err(|_| Error::ProtocolViolation("failed to print message"))?;

    buffer.extend_from_slice(body);

    Ok(buffer.freeze())
}

/// Builder instance for [`Endpoint`]
pub struct EndpointBuilder {
    // capabilities
    allow: Vec<Allow>,
    supported: Vec<Supported>,
    user_agent: Option<BytesStr>,

    timers: Timers,
    trace_sip: bool,

    layer: Vec<Box<dyn Layer>>,
}

impl Default for EndpointBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointBuilder {
    pub fn new() -> Self {
        Self {
            allow: vec![],
            supported: vec![],
            user_agent: None,
            timers: Timers::default(),
            trace_sip: false,
            layer: Default::default(),
        }
    }

    /// Add an ALLOW header to the endpoints capabilities
    pub fn add_allow(&mut self, allowed: Method) {
        if !self.allow.iter().any(|Allow(m)| *m == allowed) {
            self.allow.push(Allow(allowed))
        }
    }

    /// Add an SUPPORTED header to the endpoints capabilities
    pub fn add_supported<S>(&mut self, supported: S)
    where
        S: Into<BytesStr>,
    {
        let supported = supported.into();

        if !self.supported.iter().any(|Supported(s)| *s == supported) {
            self.supported.push(Supported(supported))
        }
    }

    /// Set the User-Agent header value put into every outgoing message
    pub fn set_user_agent<S>(&mut self, user_agent: S) -> &mut Self
    where
        S: Into<BytesStr>,
    {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn set_timers(&mut self, timers: Timers) -> &mut Self {
        self.timers = timers;
        self
    }

    /// Log complete sent and received messages on debug level
    pub fn set_trace_sip(&mut self, trace_sip: bool) -> &mut Self {
        self.trace_sip = trace_sip;
        self
    }

    /// Add a implementation of [`Layer`] to the endpoint.
    ///
    /// Note that the insertion order is relevant in how the SIP Stack may react to requests,
    /// as its the same order in that modules are called on incoming requests.
    ///
    /// Layers can be access layer using [`Endpoint::layer`]
    pub fn add_layer<L>(&mut self, layer: L)
    where
        L: Layer,
    {
        self.layer.push(Box::new(layer));
    }

    /// Complete building the endpoint
    pub fn build(&mut self) -> Endpoint {
        let mut layer = take(&mut self.layer).into_boxed_slice();
        for layer in layer.iter_mut() {
            layer.init(self);
        }

        let inner = Inner {
            allow: take(&mut self.allow),
            supported: take(&mut self.supported),
            user_agent: self.user_agent.take(),
            timers: self.timers,
            trace_sip: self.trace_sip,
            transport: Mutex::new(None),
            transactions: Default::default(),
            layer,
        };

        Endpoint {
            inner: Arc::new(inner),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::transport::{ParsedMessage, Transport};
    use crate::transaction::TsxState;
    use sip_types::header::typed::{CSeq, CallID, FromTo};
    use sip_types::host::HostPort;
    use sip_types::uri::{NameAddr, SipUri};
    use std::io;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    #[derive(Debug)]
    struct TestTransport {
        reliable: bool,
        sent: mpsc::UnboundedSender<Bytes>,
    }

    impl fmt::Display for TestTransport {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("test")
        }
    }

    #[async_trait::async_trait]
    impl Transport for TestTransport {
        fn name(&self) -> &'static str {
            if self.reliable { "TCP" } else { "UDP" }
        }

        fn secure(&self) -> bool {
            false
        }

        fn reliable(&self) -> bool {
            self.reliable
        }

        fn sent_by(&self) -> HostPort {
            HostPort::host_name("client.invalid")
        }

        async fn send(&self, message: &[u8]) -> io::Result<()> {
            let _ = self.sent.send(Bytes::copy_from_slice(message));
            Ok(())
        }
    }

    struct Peer {
        transport: TpHandle,
        sent: mpsc::UnboundedReceiver<Bytes>,
    }

    impl Peer {
        async fn receive(&mut self) -> ParsedMessage {
            parse_message(self.sent.recv().await.unwrap()).unwrap()
        }

        fn pending(&mut self) -> usize {
            let mut n = 0;
            while self.sent.try_recv().is_ok() {
                n += 1;
            }
            n
        }
    }

    fn endpoint(reliable: bool, builder: impl FnOnce(&mut EndpointBuilder)) -> (Endpoint, Peer) {
        let mut b = Endpoint::builder();
        b.add_allow(Method::INVITE);
        b.add_allow(Method::MESSAGE);
        b.set_user_agent("sipline-test");
        builder(&mut b);

        let endpoint = b.build();

        let (sent_tx, sent) = mpsc::unbounded_channel();
        let transport = TpHandle::new(TestTransport {
            reliable,
            sent: sent_tx,
        });

        endpoint.set_transport(Some(transport.clone()));

        (endpoint, Peer { transport, sent })
    }

    fn request(method: Method) -> Request {
        let uri: SipUri = "sip:bob@example.com".parse().unwrap();

        let mut request = Request::new(method.clone(), uri.clone());
        request.headers.insert_type(
            Name::FROM,
            &FromTo::new(
                NameAddr::uri("sip:alice@example.com".parse().unwrap()),
                Some("a1".into()),
            ),
        );
        request
            .headers
            .insert_type(Name::TO, &FromTo::new(NameAddr::uri(uri), None));
        request.headers.insert_named(&CallID::new("call-1"));
        request.headers.insert_named(&CSeq::new(1, method));
        request
    }

    fn response_to(request: &ParsedMessage, code: u16, to_tag: Option<&str>) -> Bytes {
        let mut headers = Headers::new();

        for name in [Name::VIA, Name::FROM, Name::TO, Name::CALL_ID, Name::CSEQ] {
            request.headers.clone_into(&mut headers, name).unwrap();
        }

        if let Some(tag) = to_tag {
            headers
                .edit(Name::TO, |to: &mut FromTo| to.tag = Some(tag.into()))
                .unwrap();
        }

        Bytes::from(format!(
            "{}\r\n{headers}\r\n",
            StatusLine::new(Code::from(code))
        ))
    }

    fn incoming(method: Method, to_tag: Option<&str>) -> Bytes {
        let mut headers = Headers::new();
        headers.insert(Name::VIA, "SIP/2.0/TCP server.invalid;branch=z9hG4bKremote1");
        headers.insert(Name::FROM, "<sip:bob@example.com>;tag=b1");
        match to_tag {
            Some(tag) => headers.insert(Name::TO, format!("<sip:alice@example.com>;tag={tag}")),
            None => headers.insert(Name::TO, "<sip:alice@example.com>"),
        }
        headers.insert(Name::CALL_ID, "remote-call");
        headers.insert(Name::CSEQ, format!("1 {method}"));

        Bytes::from(format!("{method} sip:alice@client.invalid SIP/2.0\r\n{headers}\r\n"))
    }

    fn code_of(message: &ParsedMessage) -> u16 {
        match &message.line {
            MessageLine::Response(line) => line.code.into_u16(),
            MessageLine::Request(line) => panic!("expected response, got {line}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn request_without_transport_fails() {
        let (endpoint, _peer) = endpoint(true, |_| {});
        endpoint.set_transport(None);

        assert!(matches!(
            endpoint.send_request(request(Method::OPTIONS)).await,
            Err(Error::NotConnected)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn non_invite_transaction() {
        let (endpoint, mut peer) = endpoint(true, |_| {});

        let mut tsx = endpoint.send_request(request(Method::MESSAGE)).await.unwrap();
        let sent = peer.receive().await;

        assert_eq!(sent.line.request_method(), Some(&Method::MESSAGE));
        assert!(
            sent.headers
                .iter()
                .any(|(name, value)| *name == Name::USER_AGENT && value.as_str() == "sipline-test")
        );

        endpoint.receive(peer.transport.clone(), response_to(&sent, 100, None));
        endpoint.receive(peer.transport.clone(), response_to(&sent, 202, Some("b1")));

        let response = tsx.receive_final().await.unwrap();
        assert_eq!(response.line.code.into_u16(), 202);
        assert_eq!(tsx.state(), TsxState::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn non_invite_timeout() {
        let (endpoint, mut peer) = endpoint(true, |_| {});

        let start = Instant::now();
        let mut tsx = endpoint.send_request(request(Method::OPTIONS)).await.unwrap();

        assert!(matches!(tsx.receive().await, Err(Error::RequestTimedOut)));
        assert!(start.elapsed() >= Duration::from_secs(32));

        // reliable transports never retransmit
        assert_eq!(peer.pending(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unreliable_retransmission() {
        let (endpoint, mut peer) = endpoint(false, |_| {});

        let mut tsx = endpoint.send_request(request(Method::OPTIONS)).await.unwrap();

        // T1 and 2*T1
        let _ = tokio::time::timeout(Duration::from_millis(1600), tsx.receive()).await;
        let sent = peer.receive().await;
        assert_eq!(peer.pending(), 2);

        endpoint.receive(peer.transport.clone(), response_to(&sent, 200, Some("b1")));
        assert_eq!(tsx.receive_final().await.unwrap().line.code, Code::OK);
        assert_eq!(tsx.state(), TsxState::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn invite_failure_is_acknowledged() {
        let (endpoint, mut peer) = endpoint(true, |_| {});

        let mut tsx = endpoint.send_invite(request(Method::INVITE)).await.unwrap();
        let invite = peer.receive().await;

        endpoint.receive(peer.transport.clone(), response_to(&invite, 486, Some("b1")));

        let response = tsx.receive().await.unwrap().unwrap();
        assert_eq!(response.line.code, Code::BUSY_HERE);
        assert_eq!(tsx.state(), TsxState::Terminated);

        let ack = peer.receive().await;
        assert_eq!(ack.line.request_method(), Some(&Method::ACK));

        let invite_via: Vec<Via> = invite.headers.get_named().unwrap();
        let ack_via: Vec<Via> = ack.headers.get_named().unwrap();
        assert_eq!(invite_via[0].branch(), ack_via[0].branch());

        let to: FromTo = ack.headers.get(Name::TO).unwrap();
        assert_eq!(to.tag.as_deref(), Some("b1"));
        assert_eq!(ack.headers.get_named::<CSeq>().unwrap(), CSeq::new(1, Method::ACK));

        assert!(tsx.receive().await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn invite_failure_reacknowledged_until_timer_d() {
        let (endpoint, mut peer) = endpoint(false, |b| {
            b.set_timers(Timers {
                t1: Duration::from_millis(250),
                ..Timers::default()
            });
        });

        let mut tsx = endpoint.send_invite(request(Method::INVITE)).await.unwrap();
        let invite = peer.receive().await;

        endpoint.receive(peer.transport.clone(), response_to(&invite, 486, Some("b1")));
        assert_eq!(tsx.receive().await.unwrap().unwrap().line.code, Code::BUSY_HERE);
        assert_eq!(tsx.state(), TsxState::Completed);

        let ack = peer.receive().await;
        assert_eq!(ack.line.request_method(), Some(&Method::ACK));

        // Timer D is 64*T1, 16s here
        tokio::time::sleep(Duration::from_secs(10)).await;
        endpoint.receive(peer.transport.clone(), response_to(&invite, 486, Some("b1")));

        let ack = peer.receive().await;
        assert_eq!(ack.line.request_method(), Some(&Method::ACK));

        tokio::time::sleep(Duration::from_secs(7)).await;
        endpoint.receive(peer.transport.clone(), response_to(&invite, 486, Some("b1")));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(peer.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn invite_success_keeps_receiving_retransmissions() {
        let (endpoint, mut peer) = endpoint(true, |_| {});

        let mut tsx = endpoint.send_invite(request(Method::INVITE)).await.unwrap();
        let invite = peer.receive().await;

        endpoint.receive(peer.transport.clone(), response_to(&invite, 180, Some("b1")));
        endpoint.receive(peer.transport.clone(), response_to(&invite, 200, Some("b1")));
        endpoint.receive(peer.transport.clone(), response_to(&invite, 200, Some("b1")));

        assert_eq!(tsx.receive().await.unwrap().unwrap().line.code, Code::RINGING);
        assert_eq!(tsx.state(), TsxState::Proceeding);
        assert_eq!(tsx.receive().await.unwrap().unwrap().line.code, Code::OK);
        assert_eq!(tsx.receive().await.unwrap().unwrap().line.code, Code::OK);
        assert_eq!(tsx.state(), TsxState::Terminated);

        // the transaction never sends an ACK for 2xx
        assert_eq!(peer.pending(), 0);

        let start = Instant::now();
        assert!(tsx.receive().await.unwrap().is_none());
        assert!(start.elapsed() >= Duration::from_secs(32));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_shares_invite_branch() {
        let (endpoint, mut peer) = endpoint(true, |_| {});

        let tsx = endpoint.send_invite(request(Method::INVITE)).await.unwrap();
        let invite = peer.receive().await;

        let cancel = tsx.create_cancel().unwrap();
        let mut cancel_tsx = endpoint
            .send_cancel(cancel, tsx.key().unwrap())
            .await
            .unwrap();

        let sent = peer.receive().await;
        assert_eq!(sent.line.request_method(), Some(&Method::CANCEL));
        assert_eq!(sent.headers.get_named::<CSeq>().unwrap(), CSeq::new(1, Method::CANCEL));

        let invite_via: Vec<Via> = invite.headers.get_named().unwrap();
        let cancel_via: Vec<Via> = sent.headers.get_named().unwrap();
        assert_eq!(invite_via[0].branch(), cancel_via[0].branch());

        endpoint.receive(peer.transport.clone(), response_to(&sent, 200, None));
        assert_eq!(cancel_tsx.receive_final().await.unwrap().line.code, Code::OK);
    }

    #[tokio::test(start_paused = true)]
    async fn unhandled_requests() {
        let (endpoint, mut peer) = endpoint(true, |_| {});

        endpoint.receive(peer.transport.clone(), incoming(Method::SUBSCRIBE, None));

        let response = peer.receive().await;
        assert_eq!(code_of(&response), 405);
        let allow: Vec<Allow> = response.headers.get_named().unwrap();
        assert_eq!(allow, vec![Allow(Method::INVITE), Allow(Method::MESSAGE)]);

        endpoint.receive(peer.transport.clone(), incoming(Method::BYE, Some("gone")));
        assert_eq!(code_of(&peer.receive().await), 481);

        // ACK is never answered
        endpoint.receive(peer.transport.clone(), incoming(Method::ACK, Some("gone")));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(peer.pending(), 0);
    }

    struct Responder;

    #[async_trait::async_trait]
    impl Layer for Responder {
        fn name(&self) -> &'static str {
            "responder"
        }

        fn init(&mut self, endpoint: &mut EndpointBuilder) {
            endpoint.add_allow(Method::OPTIONS);
        }

        async fn receive(&self, endpoint: &Endpoint, request: MayTake<'_, IncomingRequest>) {
            if request.line.method != Method::OPTIONS {
                return;
            }

            let mut request = request.take();
            let tsx = endpoint.create_server_tsx(&mut request);
            let response = endpoint.create_response(&request, Code::OK, None);

            tsx.respond(response).await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn layer_takes_request() {
        let (endpoint, mut peer) = endpoint(true, |b| b.add_layer(Responder));

        assert!(endpoint.allowed().contains(&Allow(Method::OPTIONS)));
        assert!(endpoint.layer::<Responder>().name() == "responder");

        endpoint.receive(peer.transport.clone(), incoming(Method::OPTIONS, None));

        let response = peer.receive().await;
        assert_eq!(code_of(&response), 200);
        assert_eq!(
            response.headers.get_named::<CallID>().unwrap(),
            CallID::new("remote-call")
        );
    }

    struct Capture(mpsc::UnboundedSender<IncomingRequest>);

    #[async_trait::async_trait]
    impl Layer for Capture {
        fn name(&self) -> &'static str {
            "capture"
        }

        async fn receive(&self, _: &Endpoint, request: MayTake<'_, IncomingRequest>) {
            let _ = self.0.send(request.take());
        }
    }

    fn capturing(reliable: bool) -> (Endpoint, Peer, mpsc::UnboundedReceiver<IncomingRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (endpoint, peer) = endpoint(reliable, |b| b.add_layer(Capture(tx)));
        (endpoint, peer, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn invite_failure_retransmitted_until_ack() {
        let (endpoint, mut peer, mut requests) = capturing(false);

        endpoint.receive(peer.transport.clone(), incoming(Method::INVITE, None));
        let mut request = requests.recv().await.unwrap();

        let tsx = endpoint.create_server_inv_tsx(&mut request);
        let mut state = tsx.watch_state();
        assert_eq!(tsx.state(), TsxState::Proceeding);

        let response = endpoint.create_response(&request, Code::BUSY_HERE, None);
        tsx.respond_failure(response).await.unwrap();
        assert_eq!(state.get(), TsxState::Completed);
        assert_eq!(code_of(&peer.receive().await), 486);

        // Timer G fires after T1, 2*T1 and 4*T1
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(peer.pending(), 3);

        endpoint.receive(peer.transport.clone(), incoming(Method::ACK, None));
        assert!(state.wait_for(TsxState::Confirmed).await);

        // Timer I absorbs ACK retransmissions
        endpoint.receive(peer.transport.clone(), incoming(Method::ACK, None));

        let confirmed = Instant::now();
        assert!(state.wait_for(TsxState::Terminated).await);
        assert!(confirmed.elapsed() >= Duration::from_secs(5));
        assert!(requests.try_recv().is_err());
        assert_eq!(peer.pending(), 0);

        endpoint.receive(peer.transport.clone(), incoming(Method::ACK, None));
        assert_eq!(requests.recv().await.unwrap().line.method, Method::ACK);
    }

    #[tokio::test(start_paused = true)]
    async fn invite_failure_abandoned_without_ack() {
        let (endpoint, mut peer, mut requests) = capturing(false);

        endpoint.receive(peer.transport.clone(), incoming(Method::INVITE, None));
        let mut request = requests.recv().await.unwrap();

        let tsx = endpoint.create_server_inv_tsx(&mut request);
        let mut state = tsx.watch_state();

        let start = Instant::now();
        let response = endpoint.create_response(&request, Code::NOT_FOUND, None);
        tsx.respond_failure(response).await.unwrap();

        // Timer H
        assert!(state.wait_for(TsxState::Terminated).await);
        assert!(start.elapsed() >= Duration::from_secs(32));

        // the response and ten retransmits, the interval doubling from T1 up to T2
        assert_eq!(peer.pending(), 11);
    }

    #[tokio::test(start_paused = true)]
    async fn reliable_invite_failure_confirmed_by_ack() {
        let (endpoint, mut peer, mut requests) = capturing(true);

        endpoint.receive(peer.transport.clone(), incoming(Method::INVITE, None));
        let mut request = requests.recv().await.unwrap();

        let tsx = endpoint.create_server_inv_tsx(&mut request);
        let mut state = tsx.watch_state();

        let response = endpoint.create_response(&request, Code::BUSY_HERE, None);
        tsx.respond_failure(response).await.unwrap();
        assert_eq!(code_of(&peer.receive().await), 486);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(peer.pending(), 0);

        endpoint.receive(peer.transport.clone(), incoming(Method::ACK, None));

        // Timer I is zero on reliable transports
        let start = Instant::now();
        assert!(state.wait_for(TsxState::Terminated).await);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn invite_success_terminates_server_transaction() {
        let (endpoint, mut peer, mut requests) = capturing(false);

        endpoint.receive(peer.transport.clone(), incoming(Method::INVITE, None));
        let mut request = requests.recv().await.unwrap();

        let mut tsx = endpoint.create_server_inv_tsx(&mut request);

        let mut ringing = endpoint.create_response(&request, Code::RINGING, None);
        tsx.respond_provisional(&mut ringing).await.unwrap();
        assert_eq!(tsx.state(), TsxState::Proceeding);

        let state = tsx.watch_state();
        let accepted = tsx
            .respond_success(endpoint.create_response(&request, Code::OK, None))
            .await
            .unwrap();

        assert_eq!(state.get(), TsxState::Terminated);
        assert_eq!(accepted.response().msg.line.code, Code::OK);

        // the ACK to a 2xx is left to the dialog
        endpoint.receive(peer.transport.clone(), incoming(Method::ACK, Some("a2")));
        assert_eq!(requests.recv().await.unwrap().line.method, Method::ACK);
        assert_eq!(peer.pending(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn non_invite_retransmission_gets_last_response() {
        let (endpoint, mut peer, mut requests) = capturing(false);

        endpoint.receive(peer.transport.clone(), incoming(Method::MESSAGE, None));
        let mut request = requests.recv().await.unwrap();

        let mut tsx = endpoint.create_server_tsx(&mut request);
        let mut state = tsx.watch_state();
        assert_eq!(tsx.state(), TsxState::Trying);

        let mut trying = endpoint.create_response(&request, Code::TRYING, None);
        tsx.respond_provisional(&mut trying).await.unwrap();
        assert_eq!(tsx.state(), TsxState::Proceeding);
        assert_eq!(code_of(&peer.receive().await), 100);

        let start = Instant::now();
        tsx.respond(endpoint.create_response(&request, Code::OK, None))
            .await
            .unwrap();
        assert_eq!(state.get(), TsxState::Completed);
        assert_eq!(code_of(&peer.receive().await), 200);

        endpoint.receive(peer.transport.clone(), incoming(Method::MESSAGE, None));
        assert_eq!(code_of(&peer.receive().await), 200);

        // Timer J
        assert!(state.wait_for(TsxState::Terminated).await);
        assert!(start.elapsed() >= Duration::from_secs(32));
        assert!(requests.try_recv().is_err());

        // past Timer J the same request is new again
        endpoint.receive(peer.transport.clone(), incoming(Method::MESSAGE, None));
        assert_eq!(requests.recv().await.unwrap().line.method, Method::MESSAGE);
    }

    #[tokio::test(start_paused = true)]
    async fn reliable_non_invite_terminates_immediately() {
        let (endpoint, mut peer, mut requests) = capturing(true);

        endpoint.receive(peer.transport.clone(), incoming(Method::MESSAGE, None));
        let mut request = requests.recv().await.unwrap();

        let tsx = endpoint.create_server_tsx(&mut request);
        let state = tsx.watch_state();

        tsx.respond(endpoint.create_response(&request, Code::OK, None))
            .await
            .unwrap();

        assert_eq!(state.get(), TsxState::Terminated);
        assert_eq!(code_of(&peer.receive().await), 200);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_invite_times_out() {
        let (endpoint, mut peer) = endpoint(false, |_| {});

        let start = Instant::now();
        let mut tsx = endpoint.send_invite(request(Method::INVITE)).await.unwrap();

        // Timer B
        assert!(matches!(tsx.receive().await, Err(Error::RequestTimedOut)));
        assert!(start.elapsed() >= Duration::from_secs(32));
        assert_eq!(tsx.state(), TsxState::Terminated);

        // Timer A doubles without a cap: 0.5s, 1.5s, 3.5s, 7.5s, 15.5s, 31.5s
        assert_eq!(peer.pending(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn proceeding_invite_canceled_by_timer_c() {
        let (endpoint, mut peer) = endpoint(true, |_| {});

        let mut tsx = endpoint.send_invite(request(Method::INVITE)).await.unwrap();
        let invite = peer.receive().await;

        endpoint.receive(peer.transport.clone(), response_to(&invite, 180, Some("b1")));
        assert_eq!(tsx.receive().await.unwrap().unwrap().line.code, Code::RINGING);

        let start = Instant::now();
        let pending = tokio::spawn(async move {
            let response = tsx.receive().await;
            (tsx, response)
        });

        let cancel = peer.receive().await;
        assert_eq!(cancel.line.request_method(), Some(&Method::CANCEL));
        assert!(start.elapsed() >= Duration::from_secs(180));

        endpoint.receive(peer.transport.clone(), response_to(&cancel, 200, None));
        endpoint.receive(peer.transport.clone(), response_to(&invite, 487, Some("b1")));

        let (tsx, response) = pending.await.unwrap();
        assert_eq!(
            response.unwrap().unwrap().line.code,
            Code::REQUEST_TERMINATED
        );
        assert!(tsx.proceeding_timed_out());
    }
}
