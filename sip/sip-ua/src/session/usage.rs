use crate::dialog::{Dialog, Usage};
use crate::media::Negotiator;
use crate::Result;
use bytes::Bytes;
use parking_lot::Mutex;
use sip_core::transaction::{Accepted, ClientInvTsx, TsxKey};
use sip_core::transport::OutgoingRequest;
use sip_core::{Endpoint, IncomingRequest, MayTake};
use sip_types::header::typed::ContentType;
use sip_types::{Code, CodeKind, Method};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, timeout_at};

pub(crate) use crate::util::{respond, transact};

/// In-dialog requests handed to the session task
#[derive(Debug)]
pub(crate) enum UsageEvent {
    ReInvite(IncomingRequest),
    Bye(IncomingRequest),
    Info(IncomingRequest),
    Refer(IncomingRequest),
    Prack(IncomingRequest),
    /// The pending INVITE was canceled (forwarded by the InviteLayer)
    Cancel,
}

pub(crate) struct AwaitedAck {
    cseq: u32,
    ack_sender: oneshot::Sender<IncomingRequest>,
}

pub(crate) type AwaitedAckSlot = Arc<Mutex<Option<AwaitedAck>>>;

/// Wait for the ACK with `cseq`, call before sending the 2XX response
pub(crate) fn expect_ack(slot: &AwaitedAckSlot, cseq: u32) -> oneshot::Receiver<IncomingRequest> {
    let (ack_sender, ack_recv) = oneshot::channel();

    *slot.lock() = Some(AwaitedAck { cseq, ack_sender });

    ack_recv
}

pub(crate) struct InviteUsage {
    pub(crate) events: mpsc::UnboundedSender<UsageEvent>,
    pub(crate) awaited_ack: AwaitedAckSlot,
    pub(crate) negotiator: Negotiator,
}

#[async_trait::async_trait]
impl Usage for InviteUsage {
    fn name(&self) -> &'static str {
        "invite-session"
    }

    async fn receive(&self, endpoint: &Endpoint, request: MayTake<'_, IncomingRequest>) {
        match request.line.method {
            Method::INVITE if self.negotiator.in_progress() => {
                let mut invite = request.take();

                let response = endpoint.create_response(&invite, Code::REQUEST_PENDING, None);

                if let Err(e) = endpoint
                    .create_server_inv_tsx(&mut invite)
                    .respond_failure(response)
                    .await
                {
                    log::warn!("failed to respond 491 to re-INVITE, {e}");
                }
            }
            Method::INVITE => self.forward(request, UsageEvent::ReInvite),
            Method::BYE => self.forward(request, UsageEvent::Bye),
            Method::INFO => self.forward(request, UsageEvent::Info),
            Method::REFER => self.forward(request, UsageEvent::Refer),
            Method::PRACK => self.forward(request, UsageEvent::Prack),
            Method::NOTIFY => {
                // progress of a REFER we sent, only the final response to it is reported
                let mut notify = request.take();
                let response = endpoint.create_response(&notify, Code::OK, None);

                if let Err(e) = endpoint.create_server_tsx(&mut notify).respond(response).await {
                    log::warn!("failed to respond to NOTIFY, {e}");
                }
            }
            Method::ACK => {
                let mut awaited_ack = self.awaited_ack.lock();

                if awaited_ack
                    .as_ref()
                    .is_some_and(|awaited| awaited.cseq == request.base_headers.cseq.cseq)
                    && let Some(awaited) = awaited_ack.take()
                {
                    let _ = awaited.ack_sender.send(request.take());
                }
            }
            _ => {}
        }
    }
}

impl InviteUsage {
    fn forward(
        &self,
        mut request: MayTake<'_, IncomingRequest>,
        event: fn(IncomingRequest) -> UsageEvent,
    ) {
        let Some(taken) = request.inner().take() else {
            return;
        };

        // the session task is gone, put the request back for the default response
        if let Err(mpsc::error::SendError(event)) = self.events.send(event(taken)) {
            if let UsageEvent::ReInvite(r)
            | UsageEvent::Bye(r)
            | UsageEvent::Info(r)
            | UsageEvent::Refer(r)
            | UsageEvent::Prack(r) = event
            {
                *request.inner() = Some(r);
            }
        }
    }
}

/// Retransmit the 2XX response until the ACK arrives.
///
/// Returns [`sip_core::Error::RequestTimedOut`] when no ACK arrived within 64*T1.
pub(crate) async fn receive_ack(
    endpoint: &Endpoint,
    accepted: &mut Accepted,
    mut ack_recv: oneshot::Receiver<IncomingRequest>,
) -> Result<IncomingRequest> {
    let timers = endpoint.timers();
    let abandon = Instant::now() + timers.transaction_timeout();

    let mut delta = timers.t1;

    loop {
        let deadline = (Instant::now() + delta).min(abandon);

        match timeout_at(deadline, &mut ack_recv).await {
            Ok(Ok(ack)) => return Ok(ack),
            Ok(Err(_)) => return Err(sip_core::Error::RequestTimedOut.into()),
            Err(_) if Instant::now() >= abandon => {
                return Err(sip_core::Error::RequestTimedOut.into());
            }
            Err(_) => {
                accepted.retransmit().await?;
                delta = timers.backoff(delta);
            }
        }
    }
}

/// Send the ACK for a 2XX response to the INVITE with `cseq`, `answer` is the SDP answer
/// to an offer carried by the 2XX
pub(crate) async fn send_ack(
    dialog: &Dialog,
    cseq: u32,
    answer: Option<Bytes>,
) -> Result<OutgoingRequest> {
    let endpoint = &dialog.endpoint;

    let mut request = dialog.create_ack(cseq);

    if let Some(answer) = answer {
        request.headers.insert_named(&ContentType::SDP);
        request.body = answer;
    }

    let mut ack = endpoint.create_outgoing(request)?;

    let via = endpoint.create_via(&ack.parts.transport, &TsxKey::client(&Method::ACK));
    ack.msg.headers.insert_named_front(&via);

    endpoint.send_outgoing_request(&mut ack).await?;

    Ok(ack)
}

/// Acknowledge retransmitted 2XX responses until the INVITE transaction ends
pub(crate) fn absorb_retransmissions(
    endpoint: Endpoint,
    mut transaction: ClientInvTsx,
    mut ack: OutgoingRequest,
) {
    tokio::spawn(async move {
        while let Ok(Some(response)) = transaction.receive().await {
            if response.line.code.kind() != CodeKind::Success {
                continue;
            }

            if let Err(e) = endpoint.send_outgoing_request(&mut ack).await {
                log::warn!("failed to send ACK for retransmitted response, {e}");
                return;
            }
        }
    });
}
