use super::dtmf::{DtmfQueue, DtmfOptions, info_body, parse_info_body};
use super::usage::{
    AwaitedAckSlot, UsageEvent, absorb_retransmissions, expect_ack, receive_ack, respond, send_ack,
    transact,
};
use super::layer::InviteLayer;
use super::{
    Actor, Command, InviteOptions, Originator, Reply, Session, SessionEvent, SessionState,
};
use crate::cause::{Cause, sip_error_cause};
use crate::dialog::{Dialog, UsageGuard};
use crate::media::{Modifiers, Negotiation, is_hold_description};
use crate::profile::{DtmfType, Support};
use crate::{Error, Result};
use bytesstr::BytesStr;
use sip_core::IncomingRequest;
use sip_core::transaction::{ClientInvTsx, TsxResponse};
use sip_types::header::typed::{ContentType, ReferTo};
use sip_types::uri::{NameAddr, SipUri};
use sip_types::{Code, CodeKind, Method, Name};
use tokio::sync::{mpsc, oneshot};

pub(crate) struct Established {
    pub(crate) dialog: Dialog,
    pub(crate) usage_events: mpsc::UnboundedReceiver<UsageEvent>,
    pub(crate) awaited_ack: AwaitedAckSlot,
    pub(crate) usage_guard: UsageGuard,
    /// Last REFER accepted from the peer
    pub(crate) refer: Option<ReceivedRefer>,
}

pub(crate) struct ReceivedRefer {
    target: SipUri,
    referred_by: Option<BytesStr>,
}

enum Flow {
    Continue,
    Ended,
}

/// A re-INVITE sent by us, waiting for its final response
struct PendingReinvite {
    hold: bool,
    cseq: u32,
    transaction: ClientInvTsx,
    negotiation: Negotiation,
    reply: Reply<bool>,
}

/// Drive a confirmed session until it ends. `pending` requests arrived before it was confirmed.
pub(crate) async fn run(mut actor: Actor, mut session: Established, pending: Vec<UsageEvent>) {
    log::debug!("session {} confirmed", actor.shared.id);

    let _replaceable = (actor.profile.replaces != Support::None).then(|| {
        InviteLayer::add_replaceable(
            &actor.endpoint,
            session.dialog.key().clone(),
            &actor.shared,
        )
    });

    for event in pending {
        if let Flow::Ended = handle_usage_event(&actor, &mut session, event).await {
            return;
        }
    }

    let mut dtmf = DtmfQueue::default();
    let mut reinvite = None;

    loop {
        let flow = tokio::select! {
            Some(command) = actor.commands.recv() => {
                handle_command(&actor, &mut session, &mut dtmf, &mut reinvite, command).await
            }
            Some(event) = session.usage_events.recv() => {
                handle_usage_event(&actor, &mut session, event).await
            }
            (tone, options) = dtmf.next() => {
                send_tone(&actor, &mut session.dialog, tone, options).await;
                Flow::Continue
            }
            response = reinvite_response(&mut reinvite) => {
                handle_reinvite_response(&actor, &mut session, &mut reinvite, response).await;
                Flow::Continue
            }
        };

        if let Flow::Ended = flow {
            break;
        }
    }

    if let Some(pending) = reinvite {
        let _ = pending.reply.send(Err(Error::InvalidState {
            operation: if pending.hold { "hold" } else { "unhold" },
            state: SessionState::Terminated.as_str(),
        }));
    }

    // the usage must be gone before the dialog is
    drop(session.usage_guard);
}

async fn handle_command(
    actor: &Actor,
    session: &mut Established,
    dtmf: &mut DtmfQueue,
    reinvite: &mut Option<PendingReinvite>,
    command: Command,
) -> Flow {
    match command {
        Command::Terminate { reply, .. } | Command::Bye { reply } => {
            send_bye(&mut session.dialog);

            actor.emit(SessionEvent::Bye {
                originator: Originator::Local,
            });
            actor.finish(Originator::Local, Cause::Bye);

            let _ = reply.send(Ok(()));

            Flow::Ended
        }
        Command::Hold { hold, reply } => {
            match send_hold_reinvite(actor, session, hold).await {
                Ok(Some((transaction, cseq, negotiation))) => {
                    *reinvite = Some(PendingReinvite {
                        hold,
                        cseq,
                        transaction,
                        negotiation,
                        reply,
                    });
                }
                Ok(None) => {
                    let _ = reply.send(Ok(false));
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            }

            Flow::Continue
        }
        Command::Dtmf {
            tones,
            options,
            reply,
        } => {
            dtmf.push(tones, options);

            let _ = reply.send(Ok(()));

            Flow::Continue
        }
        Command::Refer { target, reply } => {
            refer(&mut session.dialog, target, reply);

            Flow::Continue
        }
        Command::FollowRefer { options, reply } => {
            let Some(received) = session.refer.take() else {
                let _ = reply.send(Err(Error::InvalidOptions("no REFER was received")));
                return Flow::Continue;
            };

            let new_session = match follow_refer(actor, received, options) {
                Ok(new_session) => new_session,
                Err(e) => {
                    let _ = reply.send(Err(e));
                    return Flow::Continue;
                }
            };

            let _ = reply.send(Ok(new_session));

            send_bye(&mut session.dialog);

            actor.emit(SessionEvent::Bye {
                originator: Originator::Local,
            });
            actor.finish(Originator::Local, Cause::Bye);

            Flow::Ended
        }
        command => {
            command.reject_in(SessionState::Confirmed);

            Flow::Continue
        }
    }
}

async fn handle_usage_event(actor: &Actor, session: &mut Established, event: UsageEvent) -> Flow {
    let endpoint = &actor.endpoint;

    let result = match event {
        UsageEvent::Bye(bye) => {
            if let Err(e) = respond(endpoint, bye, Code::OK).await {
                log::warn!("failed to respond to BYE, {e}");
            }

            actor.emit(SessionEvent::Bye {
                originator: Originator::Remote,
            });
            actor.finish(Originator::Remote, Cause::Bye);

            return Flow::Ended;
        }
        UsageEvent::ReInvite(invite) => return handle_reinvite(actor, session, invite).await,
        UsageEvent::Info(info) => handle_info(actor, info).await,
        UsageEvent::Refer(request) => handle_refer(actor, session, request).await,
        // every reliable provisional response was acknowledged before the 2XX
        UsageEvent::Prack(prack) => {
            respond(endpoint, prack, Code::CALL_OR_TRANSACTION_DOES_NOT_EXIST).await
        }
        UsageEvent::Cancel => Ok(()),
    };

    if let Err(e) = result {
        log::warn!("failed to handle in-dialog request, {e}");
    }

    Flow::Continue
}

async fn handle_info(actor: &Actor, info: IncomingRequest) -> Result<()> {
    let is_dtmf = info
        .headers
        .try_get_named::<ContentType>()
        .and_then(|content_type| content_type.ok())
        .is_some_and(|content_type| content_type.is("application/dtmf-relay"));

    if !is_dtmf {
        return respond(&actor.endpoint, info, Code::UNSUPPORTED_MEDIA_TYPE).await;
    }

    let Some((tone, duration)) = parse_info_body(&info.body) else {
        return respond(&actor.endpoint, info, Code::BAD_REQUEST).await;
    };

    respond(&actor.endpoint, info, Code::OK).await?;

    actor.emit(SessionEvent::Dtmf {
        originator: Originator::Remote,
        tone,
        duration,
    });

    Ok(())
}

async fn handle_refer(
    actor: &Actor,
    session: &mut Established,
    request: IncomingRequest,
) -> Result<()> {
    let refer_to = match request.headers.get_named::<ReferTo>() {
        Ok(refer_to) => refer_to,
        Err(e) => {
            log::debug!("REFER without valid Refer-To, {e}");
            return respond(&actor.endpoint, request, Code::BAD_REQUEST).await;
        }
    };

    let referred_by = request
        .headers
        .iter()
        .find(|(name, _)| **name == Name::REFERRED_BY)
        .map(|(_, value)| value.clone());

    respond(&actor.endpoint, request, Code::ACCEPTED).await?;

    session.refer = Some(ReceivedRefer {
        target: refer_to.addr.uri.clone(),
        referred_by,
    });

    actor.emit(SessionEvent::Refer {
        target: refer_to.addr,
    });

    Ok(())
}

async fn handle_reinvite(
    actor: &Actor,
    session: &mut Established,
    mut invite: IncomingRequest,
) -> Flow {
    let endpoint = &actor.endpoint;

    let Ok(negotiation) = actor.shared.negotiator.begin() else {
        if let Err(e) = respond(endpoint, invite, Code::REQUEST_PENDING).await {
            log::warn!("failed to respond 491 to re-INVITE, {e}");
        }
        return Flow::Continue;
    };

    let transaction = endpoint.create_server_inv_tsx(&mut invite);

    if !invite.body.is_empty() {
        if let Err(e) = actor.shared.media.set_description(invite.body.clone()).await {
            log::warn!("re-INVITE offer not accepted, {e}");

            let response = endpoint.create_response(&invite, Code::NOT_ACCEPTABLE_HERE, None);
            if let Err(e) = transaction.respond_failure(response).await {
                log::warn!("failed to respond 488 to re-INVITE, {e}");
            }

            return Flow::Continue;
        }

        let remote_hold = is_hold_description(&invite.body);
        let was_on_hold = actor.shared.info.lock().hold.remote;

        if remote_hold != was_on_hold {
            actor.set_hold(|hold| hold.remote = remote_hold);

            let originator = Originator::Remote;
            actor.emit(if remote_hold {
                SessionEvent::Hold { originator }
            } else {
                SessionEvent::Unhold { originator }
            });
        }
    }

    let local_hold = actor.shared.info.lock().hold.local;

    let answer = actor
        .shared
        .media
        .get_description(Modifiers { hold: local_hold })
        .await;

    let response = match answer {
        Ok(sdp) => session
            .dialog
            .create_response(&invite, Code::OK, None)
            .map(|mut response| {
                response.msg.headers.insert_named(&ContentType::SDP);
                response.msg.body = sdp;
                response
            }),
        Err(e) => Err(Error::from(e)),
    };

    let response = match response {
        Ok(response) => response,
        Err(e) => {
            log::warn!("cannot answer re-INVITE, {e}");

            let response = endpoint.create_response(&invite, Code::SERVER_INTERNAL_ERROR, None);
            if let Err(e) = transaction.respond_failure(response).await {
                log::warn!("failed to respond 500 to re-INVITE, {e}");
            }

            return Flow::Continue;
        }
    };

    let ack_recv = expect_ack(&session.awaited_ack, invite.base_headers.cseq.cseq);

    let result = match transaction.respond_success(response).await {
        Ok(mut accepted) => receive_ack(endpoint, &mut accepted, ack_recv).await,
        Err(e) => Err(e.into()),
    };

    drop(negotiation);

    match result {
        Ok(_) => Flow::Continue,
        Err(e) => {
            log::warn!("re-INVITE was not acknowledged, {e}");

            send_bye(&mut session.dialog);
            actor.finish(Originator::System, Cause::NoAck);

            Flow::Ended
        }
    }
}

/// Send a re-INVITE putting the peer on hold or taking it off hold.
///
/// Returns `None` if the hold state was already as requested.
async fn send_hold_reinvite(
    actor: &Actor,
    session: &mut Established,
    hold: bool,
) -> Result<Option<(ClientInvTsx, u32, Negotiation)>> {
    if actor.shared.info.lock().hold.local == hold {
        return Ok(None);
    }

    let negotiation = actor.shared.negotiator.begin()?;

    let offer = actor
        .shared
        .media
        .get_description(Modifiers { hold })
        .await?;

    let mut request = session.dialog.create_request(Method::INVITE);
    request.headers.insert_named(&ContentType::SDP);
    request.body = offer;

    let cseq = session.dialog.local_cseq;

    let transaction = actor.endpoint.send_invite(request).await?;

    Ok(Some((transaction, cseq, negotiation)))
}

async fn reinvite_response(
    reinvite: &mut Option<PendingReinvite>,
) -> sip_core::Result<Option<TsxResponse>> {
    match reinvite {
        Some(pending) => pending.transaction.receive().await,
        None => std::future::pending().await,
    }
}

async fn handle_reinvite_response(
    actor: &Actor,
    session: &mut Established,
    reinvite: &mut Option<PendingReinvite>,
    response: sip_core::Result<Option<TsxResponse>>,
) {
    if let Ok(Some(response)) = &response
        && response.line.code.kind() == CodeKind::Provisional
    {
        return;
    }

    let Some(pending) = reinvite.take() else {
        return;
    };

    let PendingReinvite {
        hold,
        cseq,
        transaction,
        negotiation,
        reply,
    } = pending;

    let result = match response {
        Ok(Some(response)) => {
            complete_hold(actor, session, hold, cseq, transaction, response).await
        }
        Ok(None) => Err(sip_core::Error::RequestTimedOut.into()),
        Err(e) => Err(e.into()),
    };

    drop(negotiation);

    if let Err(e) = &result {
        log::debug!("re-INVITE failed, {e}");
    }

    let _ = reply.send(result);
}

async fn complete_hold(
    actor: &Actor,
    session: &mut Established,
    hold: bool,
    cseq: u32,
    transaction: ClientInvTsx,
    response: TsxResponse,
) -> Result<bool> {
    if transaction.proceeding_timed_out() {
        return Err(sip_core::Error::RequestTimedOut.into());
    }

    if response.line.code.kind() != CodeKind::Success {
        let cause = sip_error_cause(response.line.code, response.line.reason.as_ref());

        return Err(Error::Failed(cause));
    }

    let ack = send_ack(&session.dialog, cseq, None).await?;
    absorb_retransmissions(actor.endpoint.clone(), transaction, ack);

    if !response.body.is_empty() {
        actor.shared.media.set_description(response.body).await?;
    }

    actor.set_hold(|state| state.local = hold);

    let originator = Originator::Local;
    actor.emit(if hold {
        SessionEvent::Hold { originator }
    } else {
        SessionEvent::Unhold { originator }
    });

    Ok(true)
}

async fn send_tone(actor: &Actor, dialog: &mut Dialog, tone: char, options: DtmfOptions) {
    if tone == ',' {
        return;
    }

    match actor.shared.dtmf_type {
        DtmfType::Info => {
            let mut info = dialog.create_request(Method::INFO);
            info.headers.insert_named(&ContentType::DTMF_RELAY);
            info.body = info_body(tone, options.duration).into();

            let endpoint = dialog.endpoint.clone();

            tokio::spawn(async move {
                match transact(&endpoint, info).await {
                    Ok(response) if response.line.code.kind() == CodeKind::Success => {}
                    Ok(response) => log::debug!("DTMF INFO rejected with {}", response.line.code),
                    Err(e) => log::warn!("failed to send DTMF INFO, {e}"),
                }
            });
        }
        DtmfType::Rtp => {
            if let Err(e) = actor.shared.media.send_dtmf(tone, options.duration).await {
                log::warn!("media handler failed to send DTMF, {e}");
                return;
            }
        }
    }

    actor.emit(SessionEvent::Dtmf {
        originator: Originator::Local,
        tone,
        duration: options.duration,
    });
}

fn refer(dialog: &mut Dialog, target: SipUri, reply: oneshot::Sender<Result<Code>>) {
    let mut request = dialog.create_request(Method::REFER);
    request.headers.insert_named(&ReferTo {
        addr: NameAddr::uri(target),
    });

    let endpoint = dialog.endpoint.clone();

    tokio::spawn(async move {
        let result = transact(&endpoint, request).await.and_then(|response| {
            let code = response.line.code;

            if code.kind() == CodeKind::Success {
                Ok(code)
            } else {
                Err(Error::Failed(sip_error_cause(
                    code,
                    response.line.reason.as_ref(),
                )))
            }
        });

        let _ = reply.send(result);
    });
}

/// Start the session asked for by `received`.
///
/// A Replaces header embedded in the Refer-To URI and the REFER's Referred-By are added to
/// the new INVITE.
fn follow_refer(
    actor: &Actor,
    received: ReceivedRefer,
    mut options: InviteOptions,
) -> Result<Session> {
    let mut target = received.target;

    if let Some(replaces) = target.get_header("Replaces").and_then(|values| values.first().cloned()) {
        options.extra_headers.push(format!("Replaces: {replaces}"));
    }

    if let Some(referred_by) = received.referred_by {
        options.extra_headers.push(format!("Referred-By: {referred_by}"));
    }

    target.clear_headers();

    log::debug!("session {} follows REFER to {target}", actor.shared.id);

    Session::invite(
        actor.endpoint.clone(),
        actor.profile.clone(),
        target,
        options,
    )
}

/// Send a BYE inside `dialog` without waiting for the response
pub(crate) fn send_bye(dialog: &mut Dialog) {
    let bye = dialog.create_request(Method::BYE);
    let endpoint = dialog.endpoint.clone();

    tokio::spawn(async move {
        match transact(&endpoint, bye).await {
            Ok(response) => log::debug!("BYE answered with {}", response.line.code),
            Err(e) => log::warn!("failed to send BYE, {e}"),
        }
    });
}
