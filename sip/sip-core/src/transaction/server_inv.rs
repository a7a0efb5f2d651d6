use super::{TsxRegistration, TsxState, TsxStateWatch};
use crate::transport::OutgoingResponse;
use crate::{IncomingRequest, Result};
use sip_types::msg::MessageLine;
use sip_types::{CodeKind, Method};
use tokio::sync::watch;
use tokio::time::{Instant, timeout_at};

/// Server INVITE transaction. Used to respond to the incoming request.
///
/// Note that the correct functions must be used to send different kinds
/// of responses, as provisional, success and error responses all need
/// different handling.
///
/// Dropping the transaction prematurely can lead to weird/unexpected behavior.
#[derive(Debug)]
pub struct ServerInvTsx {
    registration: TsxRegistration,
    state: watch::Sender<TsxState>,
}

impl ServerInvTsx {
    /// Internal: Used by [`Endpoint::create_server_inv_tsx`](crate::Endpoint::create_server_inv_tsx)
    pub(crate) fn new(request: &mut IncomingRequest) -> Self {
        assert_eq!(
            request.line.method,
            Method::INVITE,
            "tried to create invite transaction from {} request",
            request.line.method
        );

        Self {
            registration: request.take_tsx_registration(),
            state: watch::Sender::new(TsxState::Proceeding),
        }
    }

    pub fn state(&self) -> TsxState {
        *self.state.borrow()
    }

    /// Observe the state after a final response consumed the transaction
    pub fn watch_state(&self) -> TsxStateWatch {
        TsxStateWatch::new(&self.state)
    }

    /// Respond with a provisional response (1XX)
    ///
    /// # Panics
    /// Panics if the given response is not a provisional response
    pub async fn respond_provisional(&mut self, response: &mut OutgoingResponse) -> Result<()> {
        assert_eq!(response.msg.line.code.kind(), CodeKind::Provisional);

        self.registration
            .endpoint
            .send_outgoing_response(response)
            .await?;

        Ok(())
    }

    /// Respond with a success response (2XX)
    ///
    /// # Returns
    /// The [`Accepted`] struct represents the `Accepted` state of the transactions.
    /// The transaction user is responsible for retransmits of the final success response
    /// since it is the one receiving the ACK request and not the transaction.
    ///
    /// # Panics
    /// Panics if the given response is not a success response
    pub async fn respond_success(self, mut response: OutgoingResponse) -> Result<Accepted> {
        assert_eq!(response.msg.line.code.kind(), CodeKind::Success);

        // Some implementations re-use the INVITE's branch for the ACK, it belongs to the dialog
        self.registration.add_filter(
            |msg| !matches!(&msg.line, MessageLine::Request(line) if line.method == Method::ACK),
        );

        self.registration
            .endpoint
            .send_outgoing_response(&mut response)
            .await?;

        // the ACK for a 2xx is its own transaction, handled by the dialog
        self.state.send_replace(TsxState::Terminated);

        Ok(Accepted {
            registration: self.registration,
            response,
        })
    }

    /// Respond with a failure response (3XX-6XX)
    ///
    /// Returns once the response is sent. Retransmissions of the response and the
    /// wait for the ACK are handled in the background.
    ///
    /// # Panics
    /// Panics if the given response is not a error response
    pub async fn respond_failure(mut self, mut response: OutgoingResponse) -> Result<()> {
        assert!(!matches!(
            response.msg.line.code.kind(),
            CodeKind::Provisional | CodeKind::Success
        ));

        self.registration
            .endpoint
            .send_outgoing_response(&mut response)
            .await?;

        let timers = self.registration.endpoint.timers();
        let reliable = response.parts.transport.reliable();

        self.state.send_replace(TsxState::Completed);

        tokio::spawn(async move {
            // Timer H
            let abandon = Instant::now() + timers.transaction_timeout();

            // Timer G
            let mut retransmit_delta = timers.t1;
            let mut retransmit = Instant::now() + retransmit_delta;

            loop {
                let deadline = if reliable { abandon } else { retransmit.min(abandon) };

                match timeout_at(deadline, self.registration.receive()).await {
                    Ok(msg) => match &msg.line {
                        MessageLine::Request(line) if line.method == Method::INVITE => {
                            if let Err(e) = self
                                .registration
                                .endpoint
                                .send_outgoing_response(&mut response)
                                .await
                            {
                                log::warn!("Failed to retransmit response, {e}");
                                self.state.send_replace(TsxState::Terminated);
                                return;
                            }
                        }
                        MessageLine::Request(line) if line.method == Method::ACK => break,
                        _ => {}
                    },
                    Err(_) if Instant::now() >= abandon => {
                        log::debug!(
                            "transaction {} never received an ACK",
                            self.registration.tsx_key
                        );
                        self.state.send_replace(TsxState::Terminated);
                        return;
                    }
                    Err(_) => {
                        if let Err(e) = self
                            .registration
                            .endpoint
                            .send_outgoing_response(&mut response)
                            .await
                        {
                            log::warn!("Failed to retransmit response, {e}");
                            self.state.send_replace(TsxState::Terminated);
                            return;
                        }

                        retransmit_delta = timers.backoff(retransmit_delta);
                        retransmit = Instant::now() + retransmit_delta;
                    }
                }
            }

            self.state.send_replace(TsxState::Confirmed);

            if !reliable {
                // Timer I, absorb retransmitted ACKs
                let timer_i = Instant::now() + timers.t4;
                while timeout_at(timer_i, self.registration.receive()).await.is_ok() {}
            }

            self.state.send_replace(TsxState::Terminated);
        });

        Ok(())
    }
}

/// Represents the `Accepted` state of a transaction. Its used to retransmit the
/// final success response to eventually receive the ACK request from the peer.
#[must_use]
#[derive(Debug)]
pub struct Accepted {
    registration: TsxRegistration,
    response: OutgoingResponse,
}

impl Accepted {
    /// Retransmit the final response
    pub async fn retransmit(&mut self) -> Result<()> {
        self.registration
            .endpoint
            .send_outgoing_response(&mut self.response)
            .await
    }

    /// The sent success response
    pub fn response(&self) -> &OutgoingResponse {
        &self.response
    }
}
