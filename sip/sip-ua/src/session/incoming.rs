use super::confirmed::{self, Established, send_bye};
use super::layer::InviteLayer;
use super::usage::{AwaitedAckSlot, UsageEvent, expect_ack, receive_ack, respond};
use super::{
    Actor, Command, Originator, Reply, Session, SessionEvent, SessionState, TerminateOptions,
};
use crate::cause::Cause;
use crate::dialog::{Dialog, UsageGuard};
use crate::media::Modifiers;
use crate::profile::Support;
use crate::util::{extend_headers, random_sequence_number};
use crate::{Error, Result};
use bytesstr::BytesStr;
use sip_core::IncomingRequest;
use sip_core::transaction::ServerInvTsx;
use sip_core::transport::OutgoingResponse;
use sip_types::header::typed::{ContentType, RAck, RSeq, Require, Supported};
use sip_types::{Code, Method, Name};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep, sleep_until};

pub(crate) struct Incoming {
    pub(crate) dialog: Dialog,
    pub(crate) transaction: ServerInvTsx,
    pub(crate) invite: IncomingRequest,
    /// Branch of the INVITE, for CANCEL matching
    pub(crate) branch: BytesStr,
    pub(crate) usage_events: mpsc::UnboundedReceiver<UsageEvent>,
    pub(crate) awaited_ack: AwaitedAckSlot,
    pub(crate) usage_guard: UsageGuard,
    /// Confirmed session this INVITE takes over once it is confirmed itself
    pub(crate) replaces: Option<Session>,
}

/// Reliable provisional response waiting for its PRACK
struct Unacknowledged {
    response: OutgoingResponse,
    rseq: u32,
    interval: Duration,
    retransmit_at: Instant,
    abandon_at: Instant,
}

/// Reliable provisional responses (RFC 3262) of an incoming INVITE
struct Reliability {
    /// The INVITE carries `Require: 100rel`
    required: bool,
    /// The INVITE carries `Supported: 100rel`
    supported: bool,
    next_rseq: u32,
    unacknowledged: Option<Unacknowledged>,
    /// Accepting waits until the PRACK arrived
    deferred_accept: Option<(Vec<String>, Reply<()>)>,
}

impl Reliability {
    fn new(invite: &IncomingRequest) -> Self {
        let required = invite
            .headers
            .try_get_named::<Vec<Require>>()
            .and_then(|tags| tags.ok())
            .is_some_and(|tags| tags.iter().any(|Require(tag)| tag == "100rel"));

        let supported = invite
            .headers
            .try_get_named::<Vec<Supported>>()
            .and_then(|tags| tags.ok())
            .is_some_and(|tags| tags.iter().any(|Supported(tag)| tag == "100rel"));

        Self {
            required,
            supported,
            next_rseq: random_sequence_number() + 1,
            unacknowledged: None,
            deferred_accept: None,
        }
    }

    /// Whether a provisional response must be sent reliably
    fn applies(&self, requested: bool, profile: Support) -> bool {
        self.required
            || (self.supported
                && match profile {
                    Support::None => false,
                    Support::Supported => requested,
                    Support::Required => true,
                })
    }

    /// Match a PRACK against the unacknowledged response, returns true if it acknowledged it
    fn acknowledge(&mut self, prack: &IncomingRequest, invite_cseq: u32) -> bool {
        let Some(Ok(rack)) = prack.headers.try_get_named::<RAck>() else {
            return false;
        };

        let matches = self.unacknowledged.as_ref().is_some_and(|pending| {
            rack.rack == pending.rseq && rack.cseq == invite_cseq && rack.method == Method::INVITE
        });

        if matches {
            self.unacknowledged = None;
        }

        matches
    }
}

pub(crate) async fn run(mut actor: Actor, incoming: Incoming) {
    let Incoming {
        mut dialog,
        mut transaction,
        invite,
        branch,
        mut usage_events,
        awaited_ack,
        usage_guard,
        replaces,
    } = incoming;

    let endpoint = actor.endpoint.clone();
    let forget_cancellable = || endpoint.layer::<InviteLayer>().forget_cancellable(&branch);

    let no_answer = sleep(actor.profile.no_answer_timeout);
    tokio::pin!(no_answer);

    let mut reliability = Reliability::new(&invite);

    // Invited
    let (mut accepted, ack_recv) = loop {
        let (extra_headers, reply) = tokio::select! {
            _ = &mut no_answer => {
                forget_cancellable();

                log::debug!("incoming session {} was not answered in time", actor.shared.id);

                let code = Code::TEMPORARILY_UNAVAILABLE;
                if let Err(e) = reject(&dialog, transaction, &invite, code, None).await {
                    log::warn!("failed to reject unanswered INVITE, {e}");
                }

                actor.fail(Originator::System, Some(code), Cause::NoAnswer);
                return;
            }
            _ = prack_timer(&reliability.unacknowledged) => {
                if retransmit_reliable(&mut transaction, &mut reliability).await {
                    continue;
                }

                forget_cancellable();

                log::debug!("reliable provisional response of {} never acknowledged", actor.shared.id);

                let code = Code::SERVER_TIMEOUT;
                if let Err(e) = reject(&dialog, transaction, &invite, code, None).await {
                    log::warn!("failed to reject INVITE without PRACK, {e}");
                }

                if let Some((_, reply)) = reliability.deferred_accept.take() {
                    let _ = reply.send(Err(Error::Failed(Cause::NoPrack)));
                }

                actor.fail(Originator::System, Some(code), Cause::NoPrack);
                return;
            }
            Some(event) = usage_events.recv() => match event {
                UsageEvent::Cancel => {
                    actor.emit(SessionEvent::Cancel);

                    let code = Code::REQUEST_TERMINATED;
                    if let Err(e) = reject(&dialog, transaction, &invite, code, None).await {
                        log::warn!("failed to respond 487 to canceled INVITE, {e}");
                    }

                    actor.fail(Originator::Remote, None, Cause::Canceled);
                    return;
                }
                UsageEvent::Bye(bye) => {
                    forget_cancellable();

                    if let Err(e) = respond(&endpoint, bye, Code::OK).await {
                        log::warn!("failed to respond to BYE, {e}");
                    }

                    let code = Code::REQUEST_TERMINATED;
                    if let Err(e) = reject(&dialog, transaction, &invite, code, None).await {
                        log::warn!("failed to respond 487 to INVITE, {e}");
                    }

                    actor.fail(Originator::Remote, None, Cause::Bye);
                    return;
                }
                UsageEvent::Prack(prack) => {
                    let acknowledged = reliability.acknowledge(&prack, invite.base_headers.cseq.cseq);

                    let code = if acknowledged {
                        Code::OK
                    } else {
                        Code::CALL_OR_TRANSACTION_DOES_NOT_EXIST
                    };

                    if let Err(e) = respond(&endpoint, prack, code).await {
                        log::warn!("failed to respond to PRACK, {e}");
                    }

                    match reliability.deferred_accept.take() {
                        Some(accept) if acknowledged => accept,
                        deferred => {
                            reliability.deferred_accept = deferred;
                            continue;
                        }
                    }
                }
                UsageEvent::ReInvite(request)
                | UsageEvent::Info(request)
                | UsageEvent::Refer(request) => {
                    if let Err(e) = respond(&endpoint, request, Code::REQUEST_PENDING).await {
                        log::warn!("failed to respond to early in-dialog request, {e}");
                    }
                    continue;
                }
            },
            Some(command) = actor.commands.recv() => match command {
                Command::Progress { code, reason, extra_headers, rel100, reply } => {
                    let result = if reliability.applies(rel100, actor.profile.rel100) {
                        progress_reliably(
                            &actor,
                            &dialog,
                            &mut transaction,
                            &invite,
                            &mut reliability,
                            code,
                            reason.clone(),
                            &extra_headers,
                        )
                        .await
                    } else {
                        progress(&dialog, &mut transaction, &invite, code, reason.clone(), &extra_headers).await
                    };

                    if result.is_ok() {
                        actor.emit(SessionEvent::Progress {
                            originator: Originator::Local,
                            code,
                            reason,
                        });
                    }

                    let _ = reply.send(result);
                    continue;
                }
                Command::Reject { code, reason, reply }
                | Command::Terminate {
                    options: TerminateOptions { code: Some(code), reason },
                    reply,
                } => {
                    if !(300..=699).contains(&code.into_u16()) {
                        let _ = reply.send(Err(Error::InvalidOptions("reject code must be within 300 and 699")));
                        continue;
                    }

                    forget_cancellable();

                    let result = reject(&dialog, transaction, &invite, code, reason).await;

                    actor.fail(Originator::Local, Some(code), Cause::Rejected);

                    let _ = reply.send(result);
                    return;
                }
                Command::Terminate { options: TerminateOptions { code: None, reason }, reply } => {
                    forget_cancellable();

                    let code = Code::TEMPORARILY_UNAVAILABLE;
                    let result = reject(&dialog, transaction, &invite, code, reason).await;

                    actor.fail(Originator::Local, Some(code), Cause::Rejected);

                    let _ = reply.send(result);
                    return;
                }
                Command::Accept { extra_headers, reply } => {
                    if reliability.unacknowledged.is_none() {
                        (extra_headers, reply)
                    } else if reliability.deferred_accept.is_some() {
                        let _ = reply.send(Err(Error::InvalidOptions("session is already being accepted")));
                        continue;
                    } else {
                        log::debug!("accepting {} once the PRACK arrived", actor.shared.id);

                        reliability.deferred_accept = Some((extra_headers, reply));
                        continue;
                    }
                }
                command => {
                    command.reject_in(SessionState::Invited);
                    continue;
                }
            },
        };

        let response = match answer(&actor, &dialog, &invite, &extra_headers).await {
            Ok(response) => response,
            Err(e @ Error::InvalidOptions(_)) => {
                let _ = reply.send(Err(e));
                continue;
            }
            Err(e) => {
                forget_cancellable();
                log::warn!("failed to create answer, {e}");

                let code = Code::SERVER_INTERNAL_ERROR;
                if let Err(e) = reject(&dialog, transaction, &invite, code, None).await {
                    log::warn!("failed to reject INVITE, {e}");
                }

                actor.fail(Originator::System, None, e.cause());

                let _ = reply.send(Err(e));
                return;
            }
        };

        forget_cancellable();

        let ack_recv = expect_ack(&awaited_ack, invite.base_headers.cseq.cseq);

        match transaction.respond_success(response).await {
            Ok(accepted) => {
                actor.set_state(SessionState::WaitingForAck);
                actor.set_started();
                actor.emit(SessionEvent::Accepted {
                    originator: Originator::Local,
                    code: Code::OK,
                });

                let _ = reply.send(Ok(()));

                break (accepted, ack_recv);
            }
            Err(e) => {
                let e = Error::from(e);
                actor.fail(Originator::System, None, e.cause());

                let _ = reply.send(Err(e));
                return;
            }
        }
    };

    let mut bye_after_ack = false;
    let mut pending = Vec::new();

    // WaitingForAck
    let ack = {
        let ack = receive_ack(&endpoint, &mut accepted, ack_recv);
        tokio::pin!(ack);

        loop {
            tokio::select! {
                result = &mut ack => match result {
                    Ok(ack) => break ack,
                    Err(e) => {
                        log::warn!("session {} never received an ACK, {e}", actor.shared.id);

                        dialog.confirm();
                        send_bye(&mut dialog);

                        actor.finish(Originator::System, Cause::NoAck);
                        return;
                    }
                },
                Some(command) = actor.commands.recv() => match command {
                    Command::Terminate { reply, .. } => {
                        bye_after_ack = true;
                        let _ = reply.send(Ok(()));
                    }
                    command => command.reject_in(SessionState::WaitingForAck),
                },
                Some(event) = usage_events.recv() => match event {
                    UsageEvent::Bye(bye) => {
                        if let Err(e) = respond(&endpoint, bye, Code::OK).await {
                            log::warn!("failed to respond to BYE, {e}");
                        }

                        actor.emit(SessionEvent::Bye { originator: Originator::Remote });
                        actor.finish(Originator::Remote, Cause::Bye);
                        return;
                    }
                    UsageEvent::Cancel => {}
                    event => pending.push(event),
                },
            }
        }
    };

    dialog.confirm();

    if bye_after_ack {
        send_bye(&mut dialog);

        actor.emit(SessionEvent::Bye {
            originator: Originator::Local,
        });
        actor.finish(Originator::Local, Cause::Bye);
        return;
    }

    // without an offer in the INVITE the 2XX carried ours, the answer comes with the ACK
    if invite.body.is_empty()
        && let Err(cause) = apply_ack_answer(&actor, ack).await
    {
        log::warn!("session {} got no usable answer in the ACK, {cause}", actor.shared.id);

        send_bye(&mut dialog);
        actor.finish(Originator::Remote, cause);
        return;
    }

    actor.set_state(SessionState::Confirmed);

    if let Some(replaced) = replaces {
        replaced.replaced_by(Session {
            shared: actor.shared.clone(),
        });
    }

    confirmed::run(
        actor,
        Established {
            dialog,
            usage_events,
            awaited_ack,
            usage_guard,
            refer: None,
        },
        pending,
    )
    .await;
}

async fn apply_ack_answer(actor: &Actor, ack: IncomingRequest) -> Result<(), Cause> {
    if ack.body.is_empty() {
        return Err(Cause::BadMediaDescription);
    }

    actor
        .shared
        .media
        .set_description(ack.body)
        .await
        .map_err(|e| Error::from(e).cause())
}

async fn prack_timer(unacknowledged: &Option<Unacknowledged>) {
    match unacknowledged {
        Some(pending) => sleep_until(pending.retransmit_at.min(pending.abandon_at)).await,
        None => std::future::pending().await,
    }
}

/// Retransmit the unacknowledged reliable response, returns false once it must be given up
async fn retransmit_reliable(
    transaction: &mut ServerInvTsx,
    reliability: &mut Reliability,
) -> bool {
    let Some(pending) = reliability.unacknowledged.as_mut() else {
        return true;
    };

    let now = Instant::now();

    if now >= pending.abandon_at {
        return false;
    }

    if let Err(e) = transaction.respond_provisional(&mut pending.response).await {
        log::warn!("failed to retransmit reliable provisional response, {e}");
    }

    pending.interval *= 2;
    pending.retransmit_at = now + pending.interval;

    true
}

async fn progress(
    dialog: &Dialog,
    transaction: &mut ServerInvTsx,
    invite: &IncomingRequest,
    code: Code,
    reason: Option<BytesStr>,
    extra_headers: &[String],
) -> Result<()> {
    let mut response = dialog.create_response(invite, code, reason)?;

    extend_headers(&mut response.msg.headers, extra_headers)?;

    transaction.respond_provisional(&mut response).await?;

    Ok(())
}

/// Send a provisional response with an RSeq, it is retransmitted until a PRACK arrives.
///
/// Carries the answer if the INVITE had an offer.
#[allow(clippy::too_many_arguments)]
async fn progress_reliably(
    actor: &Actor,
    dialog: &Dialog,
    transaction: &mut ServerInvTsx,
    invite: &IncomingRequest,
    reliability: &mut Reliability,
    code: Code,
    reason: Option<BytesStr>,
    extra_headers: &[String],
) -> Result<()> {
    if reliability.unacknowledged.is_some() {
        return Err(Error::InvalidOptions(
            "previous reliable provisional response is not acknowledged yet",
        ));
    }

    let mut response = dialog.create_response(invite, code, reason)?;

    extend_headers(&mut response.msg.headers, extra_headers)?;

    let rseq = reliability.next_rseq;

    response.msg.headers.insert(Name::REQUIRE, "100rel");
    response.msg.headers.insert_named(&RSeq(rseq));

    if !invite.body.is_empty() {
        let _negotiation = actor.shared.negotiator.begin()?;

        let sdp = actor
            .shared
            .media
            .get_description(Modifiers::default())
            .await?;

        response.msg.headers.insert_named(&ContentType::SDP);
        response.msg.body = sdp;
    }

    transaction.respond_provisional(&mut response).await?;

    let timers = actor.endpoint.timers();
    let now = Instant::now();

    reliability.next_rseq += 1;
    reliability.unacknowledged = Some(Unacknowledged {
        response,
        rseq,
        interval: timers.t1,
        retransmit_at: now + timers.t1,
        abandon_at: now + timers.transaction_timeout(),
    });

    Ok(())
}

async fn reject(
    dialog: &Dialog,
    transaction: ServerInvTsx,
    invite: &IncomingRequest,
    code: Code,
    reason: Option<BytesStr>,
) -> Result<()> {
    let response = dialog.create_response(invite, code, reason)?;

    transaction.respond_failure(response).await?;

    Ok(())
}

/// Create the 2XX response carrying the local answer, or the offer if the INVITE had none
async fn answer(
    actor: &Actor,
    dialog: &Dialog,
    invite: &IncomingRequest,
    extra_headers: &[String],
) -> Result<sip_core::transport::OutgoingResponse> {
    let mut response = dialog.create_response(invite, Code::OK, None)?;

    extend_headers(&mut response.msg.headers, extra_headers)?;

    let _negotiation = actor.shared.negotiator.begin()?;

    let sdp = actor
        .shared
        .media
        .get_description(Modifiers::default())
        .await?;

    response.msg.headers.insert_named(&ContentType::SDP);
    response.msg.body = sdp;

    Ok(response)
}
