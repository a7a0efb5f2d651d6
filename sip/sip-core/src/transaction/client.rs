use super::key::TsxKey;
use super::{TsxRegistration, TsxResponse, TsxState};
use crate::error::Error;
use crate::transport::OutgoingRequest;
use crate::{Endpoint, Request, Result};
use sip_types::{CodeKind, Method};
use std::time::Duration;
use tokio::time::{Instant, timeout_at};

/// Client non-INVITE transaction. Used to receive responses to a sent request.
///
/// Dropping it prematurely may result in an invalid transaction and it cannot be guaranteed
/// that the peer has received the request, as the transaction is also responsible
/// for retransmitting the original request until a response is received or the
/// timeout is triggered.
#[must_use]
#[derive(Debug)]
pub struct ClientTsx {
    registration: Option<TsxRegistration>,
    request: OutgoingRequest,
    state: TsxState,

    /// Timer F
    timeout: Instant,

    /// Timer E
    retransmit_delta: Duration,
    retransmit_at: Instant,
}

impl ClientTsx {
    /// Internal: Used by [`Endpoint::send_request`] and [`Endpoint::send_cancel`]
    pub(crate) async fn send(endpoint: Endpoint, request: Request, key: TsxKey) -> Result<Self> {
        let method = request.line.method.clone();

        assert!(
            !matches!(method, Method::INVITE | Method::ACK),
            "tried to create client transaction from {method} request"
        );

        let mut request = endpoint.create_outgoing(request)?;

        let registration = TsxRegistration::create(endpoint, key);

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
            state: TsxState::Trying,
            timeout: now + timers.transaction_timeout(),
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

    /// Receive one or more responses
    ///
    /// Must be called until a final response or error is returned.
    ///
    /// # Panics
    /// After receiving the final response this function will panic if called again.
    pub async fn receive(&mut self) -> Result<TsxResponse> {
        let reliable = self.request.parts.transport.reliable();

        loop {
            let Some(registration) = self.registration.as_mut() else {
                panic!("transaction already received a final response");
            };

            let deadline = if reliable {
                self.timeout
            } else {
                self.retransmit_at.min(self.timeout)
            };

            match timeout_at(deadline, registration.receive_response()).await {
                Ok(response) => return Ok(self.handle_response(response)),
                Err(_) if Instant::now() >= self.timeout => {
                    log::debug!("transaction {} timed out", registration.tsx_key);

                    self.state = TsxState::Terminated;
                    self.registration = None;

                    return Err(Error::RequestTimedOut);
                }
                Err(_) => {
                    registration
                        .endpoint
                        .send_outgoing_request(&mut self.request)
                        .await?;

                    let timers = registration.endpoint.timers();

                    // Proceeding retransmits every T2
                    self.retransmit_delta = if self.state == TsxState::Proceeding {
                        timers.t2
                    } else {
                        timers.backoff(self.retransmit_delta)
                    };

                    self.retransmit_at = Instant::now() + self.retransmit_delta;
                }
            }
        }
    }

    /// Calls [`ClientTsx::receive`] and discards all provisional responses
    /// until it receives the final one, returning it.
    pub async fn receive_final(&mut self) -> Result<TsxResponse> {
        loop {
            let response = self.receive().await?;

            if let CodeKind::Provisional = response.line.code.kind() {
                continue;
            }

            return Ok(response);
        }
    }

    fn handle_response(&mut self, response: TsxResponse) -> TsxResponse {
        if let CodeKind::Provisional = response.line.code.kind() {
            self.state = TsxState::Proceeding;
            return response;
        }

        let Some(mut registration) = self.registration.take() else {
            return response;
        };

        if self.request.parts.transport.reliable() {
            self.state = TsxState::Terminated;
            return response;
        }

        self.state = TsxState::Completed;

        // Timer K, absorb retransmitted final responses
        let timer_k = Instant::now() + registration.endpoint.timers().t4;

        tokio::spawn(async move {
            while timeout_at(timer_k, registration.receive()).await.is_ok() {}
        });

        response
    }
}
