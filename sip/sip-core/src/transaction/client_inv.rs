use super::key::TsxKey;
use super::{TsxRegistration, TsxResponse, TsxState};
use crate::error::Error;
use crate::transport::{OutgoingParts, OutgoingRequest};
use crate::{Endpoint, Request, Result};
use bytes::Bytes;
use sip_types::header::HeaderError;
use sip_types::header::typed::{CSeq, MaxForwards, Via};
use sip_types::msg::RequestLine;
use sip_types::{CodeKind, Headers, Method, Name};
use std::time::Duration;
use tokio::time::{Instant, timeout_at};

/// Client INVITE transaction.
///
/// Failure responses are acknowledged by the transaction itself. Success responses end
/// the transaction; the transaction user must send the ACK. Retransmitted success
/// responses (and those of other forks) are still returned for 64*T1 so they can be
/// acknowledged again.
///
/// In the Proceeding state Timer C guards the transaction, it restarts with every provisional
/// response. When it fires a CANCEL is sent and the transaction waits another 64*T1 for the
/// final response.
#[must_use]
#[derive(Debug)]
pub struct ClientInvTsx {
    registration: Option<TsxRegistration>,
    request: OutgoingRequest,
    state: TsxState,

    /// Timer B, Timer C, or the end of the 2xx retransmission window
    timeout: Option<Instant>,
    timer_c_fired: bool,

    /// Timer A
    retransmit_delta: Duration,
    retransmit_at: Instant,
}

impl ClientInvTsx {
    /// Internal: Used by [`Endpoint::send_invite`]
    #[tracing::instrument(
        name = "tsx_inv_send",
        level = "debug",
        skip(endpoint, request), fields(%request)
    )]
    pub(crate) async fn send(endpoint: Endpoint, request: Request) -> Result<Self> {
        assert_eq!(
            request.line.method,
            Method::INVITE,
            "tried to create client invite transaction from {} request",
            request.line.method
        );

        let mut request = endpoint.create_outgoing(request)?;

        let registration = TsxRegistration::create(endpoint, TsxKey::client(&Method::INVITE));

        let via = registration
            .endpoint
            .create_via(&request.parts.transport, &registration.tsx_key);

        request.msg.headers.insert_named_front(&via);
        registration
            .endpoint
            .send_outgoing_request(&mut request)
            .await?;

        let timers = registration.endpoint.timers();
        let now = Instant::now();

        Ok(Self {
            registration: Some(registration),
            request,
            state: TsxState::Calling,
            timeout: Some(now + timers.transaction_timeout()),
            timer_c_fired: false,
            retransmit_delta: timers.t1,
            retransmit_at: now + timers.t1,
        })
    }

    /// Returns the request the transaction was created from
    pub fn request(&self) -> &OutgoingRequest {
        &self.request
    }

    pub fn state(&self) -> TsxState {
        self.state
    }

    /// Timer C fired and the INVITE was canceled by the transaction
    pub fn proceeding_timed_out(&self) -> bool {
        self.timer_c_fired
    }

    /// Key of the transaction, `None` once it is completed
    pub fn key(&self) -> Option<&TsxKey> {
        self.registration.as_ref().map(|r| &r.tsx_key)
    }

    /// Receive the next response.
    ///
    /// Returns `Ok(None)` once the transaction is over.
    pub async fn receive(&mut self) -> Result<Option<TsxResponse>> {
        let reliable = self.request.parts.transport.reliable();

        loop {
            let Some(registration) = self.registration.as_mut() else {
                return Ok(None);
            };

            let retransmit = !reliable && self.state == TsxState::Calling;

            let deadline = match (self.timeout, retransmit) {
                (Some(timeout), true) => Some(self.retransmit_at.min(timeout)),
                (Some(timeout), false) => Some(timeout),
                (None, _) => None,
            };

            let result = match deadline {
                Some(deadline) => timeout_at(deadline, registration.receive_response()).await,
                None => Ok(registration.receive_response().await),
            };

            match result {
                Ok(response) => return self.handle_response(response).await.map(Some),
                Err(_) if self.timeout.is_some_and(|timeout| Instant::now() >= timeout) => {
                    if self.state == TsxState::Proceeding && !self.timer_c_fired {
                        log::debug!("INVITE got no final response within Timer C, canceling");

                        let endpoint = registration.endpoint.clone();
                        let key = registration.tsx_key.clone();

                        self.timer_c_fired = true;
                        self.timeout = Some(Instant::now() + endpoint.timers().transaction_timeout());
                        self.cancel(endpoint, key);
                        continue;
                    }

                    self.registration = None;

                    if matches!(self.state, TsxState::Calling | TsxState::Proceeding) {
                        log::debug!("INVITE transaction timed out");

                        self.state = TsxState::Terminated;
                        return Err(Error::RequestTimedOut);
                    }

                    self.state = TsxState::Terminated;
                    return Ok(None);
                }
                Err(_) => {
                    registration
                        .endpoint
                        .send_outgoing_request(&mut self.request)
                        .await?;

                    self.retransmit_delta *= 2;
                    self.retransmit_at = Instant::now() + self.retransmit_delta;
                }
            }
        }
    }

    async fn handle_response(&mut self, response: TsxResponse) -> Result<TsxResponse> {
        match response.line.code.kind() {
            CodeKind::Provisional => {
                if matches!(self.state, TsxState::Calling | TsxState::Proceeding)
                    && !self.timer_c_fired
                    && let Some(registration) = &self.registration
                {
                    self.state = TsxState::Proceeding;
                    self.timeout = Some(Instant::now() + registration.endpoint.timers().c);
                }
            }
            CodeKind::Success => {
                if self.state != TsxState::Terminated
                    && let Some(registration) = &self.registration
                {
                    self.state = TsxState::Terminated;

                    let timers = registration.endpoint.timers();
                    self.timeout = Some(Instant::now() + timers.transaction_timeout());
                }
            }
            _ => {
                let Some(mut registration) = self.registration.take() else {
                    return Ok(response);
                };

                let mut ack = create_ack(&self.request, &response)?;

                registration.endpoint.send_outgoing_request(&mut ack).await?;

                if self.request.parts.transport.reliable() {
                    self.state = TsxState::Terminated;
                } else {
                    self.state = TsxState::Completed;

                    // retransmitted failure responses are acknowledged again
                    let timer_d = Instant::now() + registration.endpoint.timers().timer_d();

                    tokio::spawn(async move {
                        while timeout_at(timer_d, registration.receive()).await.is_ok() {
                            if let Err(e) = registration.endpoint.send_outgoing_request(&mut ack).await {
                                log::warn!("Failed to retransmit ACK, {e}");
                            }
                        }
                    });
                }
            }
        }

        Ok(response)
    }

    fn cancel(&self, endpoint: Endpoint, key: TsxKey) {
        let cancel = match self.create_cancel() {
            Ok(cancel) => cancel,
            Err(e) => {
                log::warn!("Failed to create CANCEL, {e}");
                return;
            }
        };

        tokio::spawn(async move {
            match endpoint.send_cancel(cancel, &key).await {
                Ok(mut transaction) => {
                    if let Err(e) = transaction.receive_final().await {
                        log::debug!("CANCEL transaction failed, {e}");
                    }
                }
                Err(e) => log::warn!("Failed to send CANCEL, {e}"),
            }
        });
    }

    /// Create a CANCEL request for this INVITE (RFC 3261 Section 9.1)
    ///
    /// The returned request must be sent using [`Endpoint::send_cancel`].
    pub fn create_cancel(&self) -> Result<Request, HeaderError> {
        let invite = &self.request.msg;

        let mut headers = Headers::with_capacity(6);

        invite.headers.clone_into(&mut headers, Name::FROM)?;
        invite.headers.clone_into(&mut headers, Name::TO)?;
        invite.headers.clone_into(&mut headers, Name::CALL_ID)?;

        let cseq: CSeq = invite.headers.get_named()?;
        headers.insert_named(&CSeq::new(cseq.cseq, Method::CANCEL));

        headers.insert_named(&MaxForwards(70));

        // Route headers must be identical to the INVITE's
        let _ = invite.headers.clone_into(&mut headers, Name::ROUTE);

        Ok(Request {
            line: RequestLine {
                method: Method::CANCEL,
                uri: invite.line.uri.clone(),
            },
            headers,
            body: Bytes::new(),
        })
    }
}

fn create_ack(
    request: &OutgoingRequest,
    response: &TsxResponse,
) -> Result<OutgoingRequest, HeaderError> {
    let mut headers = Headers::with_capacity(6);

    // single Via with the INVITE's branch
    let via: Vec<Via> = request.msg.headers.get_named()?;
    if let Some(via) = via.first() {
        headers.insert_named(via);
    }
    request.msg.headers.clone_into(&mut headers, Name::FROM)?;
    response.headers.clone_into(&mut headers, Name::TO)?;
    request.msg.headers.clone_into(&mut headers, Name::CALL_ID)?;

    let cseq: CSeq = request.msg.headers.get_named()?;
    headers.insert_named(&CSeq::new(cseq.cseq, Method::ACK));
    headers.insert_named(&MaxForwards(70));

    let _ = request.msg.headers.clone_into(&mut headers, Name::ROUTE);

    Ok(OutgoingRequest {
        msg: Request {
            line: RequestLine {
                method: Method::ACK,
                uri: request.msg.line.uri.clone(),
            },
            headers,
            body: Bytes::new(),
        },
        parts: OutgoingParts {
            transport: request.parts.transport.clone(),
            buffer: Default::default(),
        },
    })
}
