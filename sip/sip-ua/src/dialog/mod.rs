//! Dialogs (RFC 3261 Section 12)
//!
//! A [`Dialog`] is owned by the session or subscription that created it and builds every
//! request sent inside of it. Incoming in-dialog requests are routed by the [`DialogLayer`]
//! to the [`Usage`]s registered for the dialog.

use crate::Result;
use crate::util::{random_sequence_number, random_token};
use bytes::Bytes;
use bytesstr::BytesStr;
use layer::DialogEntry;
use sip_core::transaction::TsxResponse;
use sip_core::transport::OutgoingResponse;
use sip_core::{Endpoint, IncomingRequest, Request};
use sip_types::header::HeaderError;
use sip_types::header::typed::{CSeq, CallID, Contact, FromTo, MaxForwards, Routing};
use sip_types::msg::RequestLine;
use sip_types::uri::{NameAddr, SipUri};
use sip_types::{Code, Headers, Method, Name};

mod key;
mod layer;

pub use key::DialogKey;
pub use layer::{DialogLayer, Usage, UsageGuard, register_usage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogState {
    Early,
    Confirmed,
}

#[derive(Debug)]
pub struct Dialog {
    pub endpoint: Endpoint,

    /// Local CSeq number, increments with every request created using this dialog
    pub local_cseq: u32,

    /// From header of requests sent inside the dialog, always has a tag
    pub local: FromTo,

    /// To header of requests sent inside the dialog
    pub peer: FromTo,

    pub local_contact: Contact,

    /// The peer's Contact URI, request URI of requests sent inside the dialog
    pub target: SipUri,

    pub call_id: CallID,

    state: DialogState,

    /// Fixed when the dialog is created
    route_set: Vec<Routing>,

    key: DialogKey,
}

fn contact_uri(headers: &Headers) -> Result<SipUri, HeaderError> {
    let contact: Contact = headers.get_named()?;
    Ok(contact.addr.uri)
}

fn record_routes(headers: &Headers) -> Result<Vec<Routing>, HeaderError> {
    headers
        .try_get::<Vec<Routing>>(Name::RECORD_ROUTE)
        .transpose()
        .map(Option::unwrap_or_default)
}

impl Dialog {
    #[allow(clippy::too_many_arguments)]
    fn create(
        endpoint: Endpoint,
        state: DialogState,
        local: FromTo,
        peer: FromTo,
        call_id: CallID,
        local_cseq: u32,
        peer_cseq: Option<u32>,
        local_contact: Contact,
        target: SipUri,
        route_set: Vec<Routing>,
    ) -> Self {
        let key = DialogKey {
            call_id: call_id.0.clone(),
            local_tag: local
                .tag
                .clone()
                .unwrap_or_else(|| BytesStr::from_static("")),
            peer_tag: peer.tag.clone(),
        };

        endpoint
            .layer::<DialogLayer>()
            .dialogs
            .lock()
            .insert(key.clone(), DialogEntry::new(peer_cseq));

        log::debug!("created {state:?} dialog {key}");

        Self {
            endpoint,
            local_cseq,
            local,
            peer,
            local_contact,
            target,
            call_id,
            state,
            route_set,
            key,
        }
    }

    /// Create a dialog from a dialog creating request received by the endpoint.
    ///
    /// A fresh local tag is generated. The dialog stays early until [`Dialog::confirm`].
    ///
    /// # Panics
    /// Panics if the endpoint has no [`DialogLayer`]
    pub fn new_server(
        endpoint: Endpoint,
        request: &IncomingRequest,
        local_contact: Contact,
    ) -> Result<Self> {
        let base = &request.base_headers;

        let local = FromTo::new(base.to.addr.clone(), Some(random_token(10)));

        Ok(Self::create(
            endpoint,
            DialogState::Early,
            local,
            base.from.clone(),
            base.call_id.clone(),
            random_sequence_number(),
            Some(base.cseq.cseq),
            local_contact,
            contact_uri(&request.headers)?,
            record_routes(&request.headers)?,
        ))
    }

    /// Create a dialog from a response to a dialog creating `request` sent by us.
    ///
    /// 1XX responses create early dialogs, 2XX responses confirmed ones.
    ///
    /// # Panics
    /// Panics if the endpoint has no [`DialogLayer`]
    pub fn new_client(
        endpoint: Endpoint,
        request: &Request,
        response: &TsxResponse,
        local_contact: Contact,
    ) -> Result<Self> {
        let state = if response.line.code.is_final() {
            DialogState::Confirmed
        } else {
            DialogState::Early
        };

        let local: FromTo = request.headers.get(Name::FROM)?;
        let cseq: CSeq = request.headers.get_named()?;

        let mut route_set = record_routes(&response.headers)?;
        route_set.reverse();

        Ok(Self::create(
            endpoint,
            state,
            local,
            response.base_headers.to.clone(),
            response.base_headers.call_id.clone(),
            cseq.cseq,
            None,
            local_contact,
            contact_uri(&response.headers)?,
            route_set,
        ))
    }

    /// Create a dialog from a request the peer sent in reply to our dialog creating
    /// `request`, before the response arrived (e.g. a NOTIFY overtaking the 2XX to SUBSCRIBE)
    ///
    /// # Panics
    /// Panics if the endpoint has no [`DialogLayer`]
    pub fn new_from_peer_request(
        endpoint: Endpoint,
        request: &Request,
        peer_request: &IncomingRequest,
        local_contact: Contact,
    ) -> Result<Self> {
        let local: FromTo = request.headers.get(Name::FROM)?;
        let cseq: CSeq = request.headers.get_named()?;
        let base = &peer_request.base_headers;

        Ok(Self::create(
            endpoint,
            DialogState::Confirmed,
            local,
            base.from.clone(),
            base.call_id.clone(),
            cseq.cseq,
            Some(base.cseq.cseq),
            local_contact,
            contact_uri(&peer_request.headers)?,
            record_routes(&peer_request.headers)?,
        ))
    }

    /// Create a key that the dialog can be identified with
    pub fn key(&self) -> &DialogKey {
        &self.key
    }

    pub fn state(&self) -> DialogState {
        self.state
    }

    pub fn confirm(&mut self) {
        if self.state == DialogState::Early {
            log::debug!("dialog {} confirmed", self.key);
            self.state = DialogState::Confirmed;
        }
    }

    pub fn route_set(&self) -> &[Routing] {
        &self.route_set
    }

    /// Create a request inside this dialog, incrementing the local CSeq
    pub fn create_request(&mut self, method: Method) -> Request {
        self.local_cseq += 1;

        let cseq = CSeq::new(self.local_cseq, method.clone());

        self.build_request(method, cseq)
    }

    /// Create the ACK for a 2XX response to the INVITE with the CSeq number `cseq`
    pub fn create_ack(&self, cseq: u32) -> Request {
        self.build_request(Method::ACK, CSeq::new(cseq, Method::ACK))
    }

    fn build_request(&self, method: Method, cseq: CSeq) -> Request {
        // strict routers get the first route as request URI and the target as last route
        let (uri, routes) = match self.route_set.split_first() {
            Some((first, rest)) if !first.is_loose() => {
                let mut routes = rest.to_vec();
                routes.push(Routing::new(NameAddr::uri(self.target.clone())));

                (first.addr.uri.clone(), routes)
            }
            _ => (self.target.clone(), self.route_set.clone()),
        };

        let mut headers = Headers::with_capacity(8);

        headers.insert_type(Name::FROM, &self.local);
        headers.insert_type(Name::TO, &self.peer);
        headers.insert_named(&self.call_id);
        headers.insert_named(&cseq);
        headers.insert_named(&MaxForwards(70));

        if !routes.is_empty() {
            headers.insert_type(Name::ROUTE, &routes);
        }

        // target refresh requests carry our contact
        if matches!(
            method,
            Method::INVITE | Method::UPDATE | Method::SUBSCRIBE | Method::NOTIFY | Method::REFER
        ) {
            headers.insert_named(&self.local_contact);
        }

        Request {
            line: RequestLine { method, uri },
            headers,
            body: Bytes::new(),
        }
    }

    /// Create a response to a request received inside this dialog (or the request that created it)
    pub fn create_response(
        &self,
        request: &IncomingRequest,
        code: Code,
        reason: Option<BytesStr>,
    ) -> Result<OutgoingResponse> {
        let mut response = self.endpoint.create_response(request, code, reason);

        if code != Code::TRYING && request.base_headers.to.tag.is_none() {
            response
                .msg
                .headers
                .edit(Name::TO, |to: &mut FromTo| to.tag = self.local.tag.clone())?;
        }

        if request.line.method == Method::INVITE {
            let code = code.into_u16();

            if let 101..=399 | 485 = code {
                response.msg.headers.insert_named(&self.local_contact);
            }

            if let 180..=189 | 200..=299 | 405 = code {
                response.msg.headers.insert_named(self.endpoint.allowed());
            }

            if let 200..=299 = code {
                response.msg.headers.insert_named(self.endpoint.supported());
            }
        }

        Ok(response)
    }
}

impl Drop for Dialog {
    fn drop(&mut self) {
        self.endpoint
            .layer::<DialogLayer>()
            .dialogs
            .lock()
            .remove(&self.key);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_util::{MessageExt, connected_endpoint};
    use sip_types::CodeKind;
    use sip_core::transport::ParsedMessage;
    use std::time::Duration;

    fn routes(message: &ParsedMessage) -> Vec<String> {
        message
            .headers
            .try_get::<Vec<Routing>>(Name::ROUTE)
            .transpose()
            .unwrap()
            .unwrap_or_default()
            .iter()
            .map(|route| route.addr.uri.to_string())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn server_dialog_route_set_and_cseq_order() {
        let (endpoint, mut peer) = connected_endpoint(|_| {}).await;

        let invite = peer
            .request("INVITE", "call-1", "peer-tag", None, 10)
            .header("Record-Route", "<sip:p1.example.com;lr>, <sip:p2.example.com;lr>")
            .build();
        let request = peer.incoming(invite).await;

        let mut dialog =
            Dialog::new_server(endpoint.clone(), &request, peer.local_contact()).unwrap();
        assert_eq!(dialog.state(), DialogState::Early);

        let local_tag = dialog.key().local_tag.clone();

        // in-dialog request with CSeq in order is offered to usages (none, so 405)
        peer.send(
            peer.request("INFO", "call-1", "peer-tag", Some(&local_tag), 11)
                .build(),
        );
        let response = peer.receive().await;
        assert_eq!(response.code(), Some(Code::METHOD_NOT_ALLOWED));

        // lower CSeq gets rejected
        peer.send(
            peer.request("INFO", "call-1", "peer-tag", Some(&local_tag), 11)
                .branch("z9hG4bKretry")
                .build(),
        );
        let response = peer.receive().await;
        assert_eq!(response.code(), Some(Code::SERVER_INTERNAL_ERROR));
        assert_eq!(response.reason().as_deref(), Some("CSeq out of order"));

        // route set is used unchanged, in received order for the UAS
        let bye = dialog.create_request(Method::BYE);
        assert_eq!(bye.line.uri.to_string(), "sip:bob@192.0.2.10");
        let mut tsx = endpoint.send_request(bye).await.unwrap();

        let sent = peer.receive().await;
        assert_eq!(
            routes(&sent),
            vec!["sip:p1.example.com;lr", "sip:p2.example.com;lr"]
        );

        peer.respond(&sent, 200, None);
        assert_eq!(
            tsx.receive_final().await.unwrap().line.code.kind(),
            CodeKind::Success
        );

        drop(dialog);

        // dialog is gone, the endpoint answers 481
        peer.send(
            peer.request("INFO", "call-1", "peer-tag", Some(&local_tag), 12)
                .build(),
        );
        let response = peer.receive().await;
        assert_eq!(
            response.code(),
            Some(Code::CALL_OR_TRANSACTION_DOES_NOT_EXIST)
        );

        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn client_dialog_reverses_record_route() {
        let (endpoint, mut peer) = connected_endpoint(|_| {}).await;

        let request = peer.outgoing_invite();
        let mut tsx = endpoint.send_invite(request.clone()).await.unwrap();

        let invite = peer.receive().await;
        peer.send(
            peer.response_to(&invite, 200, Some("remote"))
                .header("Contact", "<sip:bob@192.0.2.20>")
                .header("Record-Route", "<sip:p1.example.com;lr>")
                .header("Record-Route", "<sip:p2.example.com;lr>")
                .build(),
        );

        let response = tsx.receive().await.unwrap().unwrap();

        let mut dialog =
            Dialog::new_client(endpoint.clone(), &request, &response, peer.local_contact())
                .unwrap();

        assert_eq!(dialog.state(), DialogState::Confirmed);
        assert_eq!(dialog.key().peer_tag.as_deref(), Some("remote"));

        let ack = dialog.create_ack(1);
        assert_eq!(ack.line.uri.to_string(), "sip:bob@192.0.2.20");

        let cseq_before = dialog.local_cseq;
        let info = dialog.create_request(Method::INFO);
        assert_eq!(
            info.headers.get_named::<CSeq>().unwrap().cseq,
            cseq_before + 1
        );

        let routes: Vec<String> = dialog
            .route_set()
            .iter()
            .map(|r| r.addr.uri.to_string())
            .collect();
        assert_eq!(routes, vec!["sip:p2.example.com;lr", "sip:p1.example.com;lr"]);
    }

    #[tokio::test(start_paused = true)]
    async fn strict_router_becomes_request_uri() {
        let (endpoint, mut peer) = connected_endpoint(|_| {}).await;

        let invite = peer
            .request("INVITE", "call-2", "peer-tag", None, 1)
            .header("Record-Route", "<sip:strict.example.com>")
            .build();
        let request = peer.incoming(invite).await;

        let mut dialog = Dialog::new_server(endpoint, &request, peer.local_contact()).unwrap();
        let bye = dialog.create_request(Method::BYE);

        assert_eq!(bye.line.uri.to_string(), "sip:strict.example.com");

        let routes: Vec<Routing> = bye.headers.get(Name::ROUTE).unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].addr.uri.to_string(), "sip:bob@192.0.2.10");
    }
}
