//! Scripted SIP peer on the other end of a memory transport

use crate::dialog::DialogLayer;
use crate::util::random_token;
use sip_core::transport::memory::{MemoryRemote, memory_transport};
use sip_core::transport::{Connector, InteropFlags, ParsedMessage, TransportEvent};
use sip_core::{Endpoint, EndpointBuilder, IncomingRequest, Layer, MayTake, Request};
use sip_types::header::typed::{CSeq, CallID, Contact, FromTo};
use sip_types::msg::MessageLine;
use sip_types::uri::{NameAddr, SipUri};
use sip_types::{Code, Method, Name};
use std::fmt::Write;
use tokio::sync::mpsc;

pub(crate) const SDP: &str = "v=0\r\no=- 1 1 IN IP4 192.0.2.1\r\ns=-\r\nc=IN IP4 192.0.2.1\r\nt=0 0\r\nm=audio 5004 RTP/AVP 0\r\na=sendrecv\r\n";

pub(crate) const PEER_SDP: &str = "v=0\r\no=- 2 2 IN IP4 192.0.2.10\r\ns=-\r\nc=IN IP4 192.0.2.10\r\nt=0 0\r\nm=audio 6000 RTP/AVP 0\r\na=sendrecv\r\n";

/// Takes every out-of-dialog request no other layer wanted
struct Capture {
    requests: mpsc::UnboundedSender<IncomingRequest>,
}

#[async_trait::async_trait]
impl Layer for Capture {
    fn name(&self) -> &'static str {
        "test-capture"
    }

    async fn receive(&self, _: &Endpoint, request: MayTake<'_, IncomingRequest>) {
        if request.base_headers.to.tag.is_none() && request.line.method != Method::ACK {
            let _ = self.requests.send(request.take());
        }
    }
}

/// Endpoint with a [`DialogLayer`], the layers added by `configure` and a connected memory transport
pub(crate) async fn connected_endpoint(
    configure: impl FnOnce(&mut EndpointBuilder),
) -> (Endpoint, Peer) {
    let (connector, remote) = memory_transport();
    let (requests_tx, requests_rx) = mpsc::unbounded_channel();

    let mut builder = Endpoint::builder();
    builder.set_user_agent("sipline-test");
    builder.add_layer(DialogLayer::default());
    configure(&mut builder);
    builder.add_layer(Capture {
        requests: requests_tx,
    });

    let endpoint = builder.build();

    let mut connection = connector
        .connect("wss://edge.example.com", &InteropFlags::default())
        .await
        .unwrap();

    endpoint.set_transport(Some(connection.transport.clone()));

    let pump = endpoint.clone();
    tokio::spawn(async move {
        while let Some(event) = connection.events.recv().await {
            match event {
                TransportEvent::Message(buffer) => {
                    pump.receive(connection.transport.clone(), buffer)
                }
                TransportEvent::Disconnected => {
                    pump.set_transport(None);
                    return;
                }
            }
        }
    });

    (
        endpoint,
        Peer {
            remote,
            captured: requests_rx,
        },
    )
}

pub(crate) struct Peer {
    pub(crate) remote: MemoryRemote,
    captured: mpsc::UnboundedReceiver<IncomingRequest>,
}

impl Peer {
    /// Next message sent by the endpoint
    pub(crate) async fn receive(&mut self) -> ParsedMessage {
        self.remote
            .receive_message()
            .await
            .expect("memory transport closed")
    }

    /// Next message sent by the endpoint, skipping the given methods/responses
    pub(crate) async fn receive_request(&mut self, method: Method) -> ParsedMessage {
        loop {
            let message = self.receive().await;

            if message.method().as_ref() == Some(&method) {
                return message;
            }
        }
    }

    pub(crate) fn nothing_sent(&mut self) -> bool {
        self.remote.try_receive().is_none()
    }

    pub(crate) fn send(&self, message: String) {
        assert!(self.remote.send(message), "endpoint is not connected");
    }

    /// Send `message` and wait for the request to reach the capture layer
    pub(crate) async fn incoming(&mut self, message: String) -> IncomingRequest {
        self.send(message);
        self.captured.recv().await.expect("capture layer gone")
    }

    pub(crate) fn request(
        &self,
        method: &str,
        call_id: &str,
        from_tag: &str,
        to_tag: Option<&str>,
        cseq: u32,
    ) -> MessageBuilder {
        let mut head = format!("{method} sip:alice@sipline.invalid SIP/2.0\r\n");

        let _ = write!(
            head,
            "From: <sip:bob@example.com>;tag={from_tag}\r\nTo: <sip:alice@example.com>"
        );
        if let Some(to_tag) = to_tag {
            let _ = write!(head, ";tag={to_tag}");
        }

        let _ = write!(
            head,
            "\r\nCall-ID: {call_id}\r\nCSeq: {cseq} {method}\r\nContact: <sip:bob@192.0.2.10>\r\nMax-Forwards: 70\r\n"
        );

        MessageBuilder {
            head,
            via: Some(format!("z9hG4bK{}", random_token(12))),
            headers: String::new(),
            body: None,
        }
    }

    /// A response to `request`, adding `to_tag` if the To header has none
    pub(crate) fn response_to(
        &self,
        request: &ParsedMessage,
        code: u16,
        to_tag: Option<&str>,
    ) -> MessageBuilder {
        let reason = Code::from(code).text().unwrap_or("Unknown");
        let mut head = format!("SIP/2.0 {code} {reason}\r\n");

        for (name, value) in request.headers.iter() {
            let copied = [Name::VIA, Name::FROM, Name::CALL_ID, Name::CSEQ];

            if copied.contains(name) {
                let _ = write!(head, "{name}: {value}\r\n");
            }
        }

        let mut to: FromTo = request.headers.get(Name::TO).unwrap();
        if to.tag.is_none() {
            to.tag = to_tag.map(Into::into);
        }

        let mut headers = sip_types::Headers::new();
        headers.insert_type(Name::TO, &to);
        let _ = write!(head, "{headers}");

        MessageBuilder {
            head,
            via: None,
            headers: String::new(),
            body: None,
        }
    }

    pub(crate) fn respond(&self, request: &ParsedMessage, code: u16, to_tag: Option<&str>) {
        self.send(self.response_to(request, code, to_tag).build());
    }

    /// Contact used for the local side of dialogs created in tests
    pub(crate) fn local_contact(&self) -> Contact {
        Contact::new(NameAddr::uri(
            "sip:alice@sipline.invalid;transport=ws".parse().unwrap(),
        ))
    }

    /// An INVITE from the endpoint's user to bob
    pub(crate) fn outgoing_invite(&self) -> Request {
        let target: SipUri = "sip:bob@example.com".parse().unwrap();
        let mut request = Request::new(Method::INVITE, target.clone());

        request.headers.insert_type(
            Name::FROM,
            &FromTo::new(
                NameAddr::uri("sip:alice@example.com".parse().unwrap()),
                Some("local".into()),
            ),
        );
        request
            .headers
            .insert_type(Name::TO, &FromTo::new(NameAddr::uri(target), None));
        request.headers.insert_named(&CallID::new(random_token(8)));
        request.headers.insert_named(&CSeq::new(1, Method::INVITE));
        request.headers.insert_named(&self.local_contact());

        request
    }
}

pub(crate) struct MessageBuilder {
    head: String,
    via: Option<String>,
    headers: String,
    body: Option<(String, String)>,
}

impl MessageBuilder {
    pub(crate) fn header(mut self, name: &str, value: &str) -> Self {
        let _ = write!(self.headers, "{name}: {value}\r\n");
        self
    }

    pub(crate) fn branch(mut self, branch: &str) -> Self {
        self.via = Some(branch.to_owned());
        self
    }

    pub(crate) fn body(mut self, content_type: &str, body: &str) -> Self {
        self.body = Some((content_type.to_owned(), body.to_owned()));
        self
    }

    pub(crate) fn sdp(self, sdp: &str) -> Self {
        self.body("application/sdp", sdp)
    }

    pub(crate) fn build(self) -> String {
        let mut message = self.head;

        if let Some(branch) = self.via {
            let _ = write!(message, "Via: SIP/2.0/WSS peer.invalid;branch={branch}\r\n");
        }

        message.push_str(&self.headers);

        match self.body {
            Some((content_type, body)) => {
                let _ = write!(
                    message,
                    "Content-Type: {content_type}\r\nContent-Length: {}\r\n\r\n{body}",
                    body.len()
                );
            }
            None => message.push_str("Content-Length: 0\r\n\r\n"),
        }

        message
    }
}

/// Accessors used by assertions
pub(crate) trait MessageExt {
    fn method(&self) -> Option<Method>;
    fn code(&self) -> Option<Code>;
    fn reason(&self) -> Option<String>;
    fn header(&self, name: &str) -> Option<String>;
    fn body_str(&self) -> &str;
}

impl MessageExt for ParsedMessage {
    fn method(&self) -> Option<Method> {
        self.line.request_method().cloned()
    }

    fn code(&self) -> Option<Code> {
        match &self.line {
            MessageLine::Response(line) => Some(line.code),
            MessageLine::Request(_) => None,
        }
    }

    fn reason(&self) -> Option<String> {
        match &self.line {
            MessageLine::Response(line) => line.reason.as_ref().map(|r| r.to_string()),
            MessageLine::Request(_) => None,
        }
    }

    fn header(&self, name: &str) -> Option<String> {
        let values: Vec<&str> = self
            .headers
            .iter()
            .filter(|(n, _)| **n == name)
            .map(|(_, v)| v.as_str())
            .collect();

        if values.is_empty() {
            None
        } else {
            Some(values.join(", "))
        }
    }

    fn body_str(&self) -> &str {
        std::str::from_utf8(&self.body).unwrap()
    }
}
