use super::{TsxRegistration, TsxState, TsxStateWatch};
use crate::transport::OutgoingResponse;
use crate::{IncomingRequest, Result};
use sip_types::msg::MessageLine;
use sip_types::{CodeKind, Method};
use tokio::sync::watch;
use tokio::time::{Instant, timeout_at};

/// Server non-INVITE transaction. Used to respond to an incoming request.
///
/// Retransmitted requests are answered with the last sent response.
#[derive(Debug)]
pub struct ServerTsx {
    registration: TsxRegistration,
    state: watch::Sender<TsxState>,
}

impl ServerTsx {
    /// Internal: Used by [`Endpoint::create_server_tsx`](crate::Endpoint::create_server_tsx)
    pub(crate) fn new(request: &mut IncomingRequest) -> Self {
        assert!(
            !matches!(request.line.method, Method::INVITE | Method::ACK),
            "tried to create server transaction from {} request",
            request.line.method
        );

        Self {
            registration: request.take_tsx_registration(),
            state: watch::Sender::new(TsxState::Trying),
        }
    }

    pub fn state(&self) -> TsxState {
        *self.state.borrow()
    }

    /// Observe the state after [`respond`](Self::respond) consumed the transaction
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

        // drain retransmissions received so far, the response just sent answers them
        while self.registration.receiver.try_recv().is_ok() {}

        self.state.send_replace(TsxState::Proceeding);

        Ok(())
    }

    /// Respond with a final response (2XX-6XX)
    ///
    /// # Panics
    /// Panics if the given response is not a final response
    pub async fn respond(mut self, mut response: OutgoingResponse) -> Result<()> {
        assert_ne!(response.msg.line.code.kind(), CodeKind::Provisional);

        self.registration
            .endpoint
            .send_outgoing_response(&mut response)
            .await?;

        if response.parts.transport.reliable() {
            self.state.send_replace(TsxState::Terminated);
            return Ok(());
        }

        self.state.send_replace(TsxState::Completed);

        // Timer J
        let timer_j = Instant::now() + self.registration.endpoint.timers().transaction_timeout();

        tokio::spawn(async move {
            while let Ok(msg) = timeout_at(timer_j, self.registration.receive()).await {
                if !matches!(msg.line, MessageLine::Request(_)) {
                    continue;
                }

                if let Err(e) = self
                    .registration
                    .endpoint
                    .send_outgoing_response(&mut response)
                    .await
                {
                    log::warn!("Failed to retransmit response, {e}");
                    break;
                }
            }

            self.state.send_replace(TsxState::Terminated);
        });

        Ok(())
    }
}
