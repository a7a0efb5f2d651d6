use super::confirmed::{self, Established, send_bye};
use super::usage::{AwaitedAckSlot, InviteUsage, absorb_retransmissions, send_ack, transact};
use super::{Actor, Command, Originator, SessionEvent, SessionState};
use crate::cause::{Cause, sip_error_cause};
use crate::dialog::{Dialog, register_usage};
use crate::media::Modifiers;
use crate::profile::{Authenticator, Support};
use crate::Result;
use bytes::Bytes;
use sip_core::transaction::{ClientInvTsx, TsxResponse};
use sip_core::{Endpoint, Request};
use sip_types::header::typed::{CSeq, CallID, ContentType, FromTo, RAck, RSeq, Require};
use sip_types::{Code, CodeKind, Method, Name};
use tokio::sync::mpsc;

/// Identifies an outgoing session by its Call-ID and From tag
pub(super) fn session_id(request: &Request) -> Result<String> {
    let call_id: CallID = request.headers.get_named()?;
    let from: FromTo = request.headers.get(Name::FROM)?;

    Ok(format!(
        "{}{}",
        call_id.0,
        from.tag.as_deref().unwrap_or_default()
    ))
}

/// Per INVITE choices made through [`InviteOptions`](super::InviteOptions)
#[derive(Debug, Clone, Copy)]
pub(super) struct InviteFlags {
    /// No offer in the INVITE, it is expected in the 2XX
    pub(super) without_sdp: bool,
    pub(super) rel100: Support,
}

/// State of an INVITE sent by us, up to its final response
struct Inviting {
    request: Request,
    transaction: ClientInvTsx,
    authenticator: Authenticator,
    flags: InviteFlags,

    /// Set once any provisional response arrived, a CANCEL may be sent from then on
    provisional_received: bool,
    /// Cause to end the session with once the INVITE is gone
    cancel: Option<Cause>,
    cancel_sent: bool,

    /// Early dialog created for PRACKs
    early: Option<Dialog>,
    last_rseq: Option<u32>,
}

pub(super) async fn run(mut actor: Actor, mut request: Request, flags: InviteFlags) {
    if !flags.without_sdp {
        // Null, wait for the local offer
        let media = actor.shared.media.clone();
        let offer = media.get_description(Modifiers::default());
        tokio::pin!(offer);

        let offer = loop {
            tokio::select! {
                offer = &mut offer => break offer,
                Some(command) = actor.commands.recv() => match command {
                    Command::Terminate { reply, .. } | Command::Cancel { reply } => {
                        actor.fail(Originator::Local, None, Cause::Canceled);
                        let _ = reply.send(Ok(()));
                        return;
                    }
                    command => command.reject_in(SessionState::Null),
                },
            }
        };

        let offer = match offer {
            Ok(offer) => offer,
            Err(e) => {
                log::warn!("failed to create offer, {e}");
                actor.fail(Originator::Local, None, crate::Error::from(e).cause());
                return;
            }
        };

        request.headers.insert_named(&ContentType::SDP);
        request.body = offer;
    }

    match flags.rel100 {
        Support::None => {}
        Support::Supported => request.headers.insert(Name::SUPPORTED, "100rel"),
        Support::Required => request.headers.insert(Name::REQUIRE, "100rel"),
    }

    let mut authenticator = actor.profile.authenticator();
    authenticator.authorize(&mut request);

    let transaction = match actor.endpoint.send_invite(request.clone()).await {
        Ok(transaction) => transaction,
        Err(e) => {
            log::warn!("failed to send INVITE, {e}");
            actor.fail(Originator::System, None, crate::Error::from(e).cause());
            return;
        }
    };

    actor.set_state(SessionState::Inviting);

    let inviting = Inviting {
        request,
        transaction,
        authenticator,
        flags,
        provisional_received: false,
        cancel: None,
        cancel_sent: false,
        early: None,
        last_rseq: None,
    };

    invite(actor, inviting).await;
}

async fn invite(mut actor: Actor, mut inviting: Inviting) {
    loop {
        let response = tokio::select! {
            response = inviting.transaction.receive() => response,
            Some(command) = actor.commands.recv() => {
                match command {
                    Command::Terminate { reply, .. } | Command::Cancel { reply } => {
                        if inviting.cancel.is_none() {
                            actor.emit(SessionEvent::Cancel);
                        }

                        request_cancel(&actor.endpoint, &mut inviting, Cause::Canceled);

                        let _ = reply.send(Ok(()));
                    }
                    command => command.reject_in(actor.state()),
                }

                continue;
            }
        };

        let response = match response {
            Ok(Some(response)) => response,
            Ok(None) | Err(_) if inviting.cancel.is_some() => {
                let cause = inviting.cancel.take().unwrap_or(Cause::Canceled);
                actor.fail(Originator::Local, None, cause);
                return;
            }
            Ok(None) => {
                actor.fail(Originator::System, None, Cause::RequestTimeout);
                return;
            }
            Err(e) => {
                log::warn!("INVITE transaction failed, {e}");
                actor.fail(Originator::System, None, crate::Error::from(e).cause());
                return;
            }
        };

        match response.line.code.kind() {
            CodeKind::Provisional => {
                handle_provisional(&actor, &mut inviting, response).await;
            }
            CodeKind::Success => {
                accepted(actor, inviting, response).await;
                return;
            }
            _ => {
                let retry = inviting.cancel.is_none()
                    && inviting.authenticator.handle_response(
                        inviting.transaction.request(),
                        &response,
                        &mut inviting.request,
                    );

                if retry {
                    match actor.endpoint.send_invite(inviting.request.clone()).await {
                        Ok(transaction) => {
                            inviting.transaction = transaction;
                            inviting.provisional_received = false;
                            inviting.early = None;
                            inviting.last_rseq = None;
                            continue;
                        }
                        Err(e) => {
                            actor.fail(Originator::System, None, crate::Error::from(e).cause());
                            return;
                        }
                    }
                }

                let code = response.line.code;

                if inviting.transaction.proceeding_timed_out() {
                    actor.fail(Originator::System, Some(code), Cause::RequestTimeout);
                    return;
                }

                match inviting.cancel {
                    Some(cause) => actor.fail(Originator::Local, Some(code), cause),
                    None => {
                        let cause = sip_error_cause(code, response.line.reason.as_ref());

                        actor.emit(SessionEvent::Rejected {
                            originator: Originator::Remote,
                            code,
                            cause: cause.clone(),
                        });
                        actor.fail(Originator::Remote, Some(code), cause);
                    }
                }

                return;
            }
        }
    }
}

/// Remember that the INVITE must be canceled, sends the CANCEL once that is possible
fn request_cancel(endpoint: &Endpoint, inviting: &mut Inviting, cause: Cause) {
    if inviting.cancel.is_none() {
        inviting.cancel = Some(cause);
    }

    if !inviting.provisional_received || inviting.cancel_sent {
        return;
    }

    inviting.cancel_sent = true;

    let (cancel, Some(key)) = (
        inviting.transaction.create_cancel(),
        inviting.transaction.key().cloned(),
    ) else {
        return;
    };

    let cancel = match cancel {
        Ok(cancel) => cancel,
        Err(e) => {
            log::warn!("failed to create CANCEL, {e}");
            return;
        }
    };

    let endpoint = endpoint.clone();

    tokio::spawn(async move {
        let mut transaction = match endpoint.send_cancel(cancel, &key).await {
            Ok(transaction) => transaction,
            Err(e) => {
                log::warn!("failed to send CANCEL, {e}");
                return;
            }
        };

        match transaction.receive_final().await {
            Ok(response) => log::debug!("CANCEL answered with {}", response.line.code),
            Err(e) => log::warn!("CANCEL transaction failed, {e}"),
        }
    });
}

async fn handle_provisional(actor: &Actor, inviting: &mut Inviting, response: TsxResponse) {
    inviting.provisional_received = true;

    if inviting.cancel.is_some() {
        // the CANCEL was held back until now
        let cause = inviting.cancel.clone().unwrap_or(Cause::Canceled);
        request_cancel(&actor.endpoint, inviting, cause);
        return;
    }

    let code = response.line.code;

    if code == Code::TRYING {
        return;
    }

    if inviting.flags.rel100 != Support::None {
        send_prack(actor, inviting, &response);
    }

    // without an offer of our own a 1XX body is not an answer
    if !inviting.flags.without_sdp
        && !response.body.is_empty()
        && actor.state() == SessionState::Inviting
    {
        match actor.shared.media.set_description(response.body.clone()).await {
            Ok(()) => actor.set_state(SessionState::EarlyMedia),
            Err(e) => {
                log::warn!("early media description not accepted, {e}");

                request_cancel(&actor.endpoint, inviting, Cause::BadMediaDescription);
                return;
            }
        }
    }

    actor.emit(SessionEvent::Progress {
        originator: Originator::Remote,
        code,
        reason: response.line.reason,
    });
}

/// Acknowledge a reliable provisional response
fn send_prack(actor: &Actor, inviting: &mut Inviting, response: &TsxResponse) {
    let reliable = response
        .headers
        .try_get_named::<Vec<Require>>()
        .and_then(|require| require.ok())
        .is_some_and(|require| require.iter().any(|Require(tag)| tag == "100rel"));

    if !reliable || response.base_headers.to.tag.is_none() {
        return;
    }

    let Some(Ok(RSeq(rseq))) = response.headers.try_get_named::<RSeq>() else {
        log::warn!("reliable provisional response without RSeq");
        return;
    };

    // retransmissions are acknowledged by the PRACK transaction
    if inviting.last_rseq.is_some_and(|last| rseq <= last) {
        return;
    }

    inviting.last_rseq = Some(rseq);

    if inviting.early.is_none() {
        match Dialog::new_client(
            actor.endpoint.clone(),
            &inviting.request,
            response,
            actor.profile.contact.clone(),
        ) {
            Ok(dialog) => inviting.early = Some(dialog),
            Err(e) => {
                log::warn!("cannot create early dialog, {e}");
                return;
            }
        }
    }

    let Some(dialog) = inviting.early.as_mut() else {
        return;
    };

    let mut prack = dialog.create_request(Method::PRACK);
    prack.headers.insert_named(&RAck::new(
        rseq,
        response.base_headers.cseq.cseq,
        Method::INVITE,
    ));

    let endpoint = actor.endpoint.clone();

    tokio::spawn(async move {
        if let Err(e) = transact(&endpoint, prack).await {
            log::warn!("PRACK failed, {e}");
        }
    });
}

async fn accepted(actor: Actor, mut inviting: Inviting, response: TsxResponse) {
    let code = response.line.code;

    let dialog = match inviting.early.take() {
        Some(mut dialog) if dialog.key().peer_tag == response.base_headers.to.tag => {
            dialog.confirm();
            Ok(dialog)
        }
        _ => Dialog::new_client(
            actor.endpoint.clone(),
            &inviting.request,
            &response,
            actor.profile.contact.clone(),
        ),
    };

    let mut dialog = match dialog {
        Ok(dialog) => dialog,
        Err(e) => {
            log::warn!("cannot create dialog from {code} response, {e}");
            actor.fail(Originator::System, Some(code), Cause::DialogError);
            return;
        }
    };

    let cseq = match inviting.request.headers.get_named::<CSeq>() {
        Ok(cseq) => cseq.cseq,
        Err(e) => {
            log::warn!("INVITE without CSeq, {e}");
            actor.fail(Originator::System, Some(code), Cause::DialogError);
            return;
        }
    };

    if let Some(cause) = inviting.cancel {
        // answered while canceling, end the session right away
        acknowledge(&actor, &dialog, cseq, None, inviting.transaction).await;

        send_bye(&mut dialog);
        actor.fail(Originator::Local, Some(code), cause);
        return;
    }

    let description = if inviting.flags.without_sdp {
        answer_offer(&actor, &response).await.map(Some)
    } else if actor.state() == SessionState::EarlyMedia {
        Ok(None)
    } else if response.body.is_empty() {
        Err(Cause::BadMediaDescription)
    } else {
        actor
            .shared
            .media
            .set_description(response.body.clone())
            .await
            .map(|()| None)
            .map_err(|e| crate::Error::from(e).cause())
    };

    let answer = match description {
        Ok(answer) => answer,
        Err(cause) => {
            log::warn!("description of {code} response not usable, {cause}");

            acknowledge(&actor, &dialog, cseq, None, inviting.transaction).await;

            send_bye(&mut dialog);
            actor.fail(Originator::Remote, Some(code), cause);
            return;
        }
    };

    acknowledge(&actor, &dialog, cseq, answer, inviting.transaction).await;

    let (usage_events_tx, usage_events) = mpsc::unbounded_channel();
    let awaited_ack = AwaitedAckSlot::default();

    let usage_guard = register_usage(
        actor.endpoint.clone(),
        dialog.key().clone(),
        InviteUsage {
            events: usage_events_tx,
            awaited_ack: awaited_ack.clone(),
            negotiator: actor.shared.negotiator.clone(),
        },
    );

    let Some(usage_guard) = usage_guard else {
        send_bye(&mut dialog);
        actor.fail(Originator::System, Some(code), Cause::DialogError);
        return;
    };

    actor.set_state(SessionState::Confirmed);
    actor.set_started();
    actor.emit(SessionEvent::Accepted {
        originator: Originator::Remote,
        code,
    });

    confirmed::run(
        actor,
        Established {
            dialog,
            usage_events,
            awaited_ack,
            usage_guard,
            refer: None,
        },
        vec![],
    )
    .await;
}

/// Send the ACK and keep acknowledging retransmissions of the 2XX
async fn acknowledge(
    actor: &Actor,
    dialog: &Dialog,
    cseq: u32,
    answer: Option<Bytes>,
    transaction: ClientInvTsx,
) {
    match send_ack(dialog, cseq, answer).await {
        Ok(ack) => absorb_retransmissions(actor.endpoint.clone(), transaction, ack),
        Err(e) => log::warn!("failed to send ACK, {e}"),
    }
}

/// Apply the offer of a 2XX to an INVITE sent without one, returns the answer for the ACK
async fn answer_offer(actor: &Actor, response: &TsxResponse) -> Result<Bytes, Cause> {
    if response.body.is_empty() {
        return Err(Cause::BadMediaDescription);
    }

    let media = &actor.shared.media;

    let answer = async {
        media.set_description(response.body.clone()).await?;
        media.get_description(Modifiers::default()).await
    };

    answer.await.map_err(|e| crate::Error::from(e).cause())
}
