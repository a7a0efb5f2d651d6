use super::incoming::{self, Incoming};
use super::usage::{AwaitedAckSlot, InviteUsage, UsageEvent};
use super::{Direction, Session, SessionParts, SessionState, Shared};
use crate::cause::Cause;
use crate::dialog::{Dialog, DialogKey, register_usage};
use crate::emitter::Emitter;
use crate::profile::{Profile, Support};
use crate::{Error, Result};
use bytesstr::BytesStr;
use parking_lot::Mutex;
use sip_core::transport::OutgoingResponse;
use sip_core::{Endpoint, EndpointBuilder, IncomingRequest, Layer, MayTake};
use sip_types::header::typed::{ContentType, Replaces, Require, Supported};
use sip_types::{Code, Method, Name};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

/// Creates [`Session`]s for incoming INVITEs and routes CANCEL requests to them
pub struct InviteLayer {
    profile: Profile,
    sessions: Emitter<Session>,

    /// Sessions in `Invited` state by the branch of their INVITE
    cancellables: Mutex<HashMap<BytesStr, mpsc::UnboundedSender<UsageEvent>>>,

    /// Confirmed sessions an INVITE with a Replaces header may take over
    replaceable: Mutex<HashMap<DialogKey, Weak<Shared>>>,
}

impl InviteLayer {
    /// Every incoming session is emitted on `sessions`
    pub fn new(profile: Profile, sessions: Emitter<Session>) -> Self {
        Self {
            profile,
            sessions,
            cancellables: Default::default(),
            replaceable: Default::default(),
        }
    }

    pub(crate) fn forget_cancellable(&self, branch: &BytesStr) {
        self.cancellables.lock().remove(branch);
    }

    /// Make the session of the confirmed dialog `key` replaceable until the guard is dropped
    pub(crate) fn add_replaceable(
        endpoint: &Endpoint,
        key: DialogKey,
        shared: &Arc<Shared>,
    ) -> ReplaceableGuard {
        endpoint
            .layer::<InviteLayer>()
            .replaceable
            .lock()
            .insert(key.clone(), Arc::downgrade(shared));

        ReplaceableGuard {
            endpoint: endpoint.clone(),
            key,
        }
    }
}

pub(crate) struct ReplaceableGuard {
    endpoint: Endpoint,
    key: DialogKey,
}

impl Drop for ReplaceableGuard {
    fn drop(&mut self) {
        self.endpoint
            .layer::<InviteLayer>()
            .replaceable
            .lock()
            .remove(&self.key);
    }
}

#[async_trait::async_trait]
impl Layer for InviteLayer {
    fn name(&self) -> &'static str {
        "invite"
    }

    fn init(&mut self, endpoint: &mut EndpointBuilder) {
        for method in [
            Method::INVITE,
            Method::ACK,
            Method::CANCEL,
            Method::BYE,
            Method::INFO,
            Method::REFER,
            Method::NOTIFY,
            Method::PRACK,
        ] {
            endpoint.add_allow(method);
        }

        if self.profile.rel100 != Support::None {
            endpoint.add_supported("100rel");
        }

        if self.profile.replaces != Support::None {
            endpoint.add_supported("replaces");
        }
    }

    async fn receive(&self, endpoint: &Endpoint, request: MayTake<'_, IncomingRequest>) {
        let result = match request.line.method {
            Method::INVITE if request.base_headers.to.tag.is_none() => {
                self.handle_invite(endpoint, request.take()).await
            }
            Method::CANCEL => self.handle_cancel(endpoint, request.take()).await,
            _ => return,
        };

        if let Err(e) = result {
            log::warn!("failed to handle incoming request, {e}");
        }
    }
}

impl InviteLayer {
    async fn handle_invite(&self, endpoint: &Endpoint, mut invite: IncomingRequest) -> Result<()> {
        let content_type = invite
            .headers
            .try_get_named::<ContentType>()
            .and_then(|content_type| content_type.ok());

        if !invite.body.is_empty()
            && !content_type.is_some_and(|content_type| content_type.is("application/sdp"))
        {
            log::debug!("rejecting INVITE with a body that is not SDP");

            let response = endpoint.create_response(&invite, Code::UNSUPPORTED_MEDIA_TYPE, None);
            return refuse(endpoint, invite, response).await;
        }

        if let Some(response) = self.check_extensions(endpoint, &invite) {
            return refuse(endpoint, invite, response).await;
        }

        let replaces = match self.replaced_session(&invite) {
            Ok(replaces) => replaces,
            Err(code) => {
                let response = endpoint.create_response(&invite, code, None);
                return refuse(endpoint, invite, response).await;
            }
        };

        let mut transaction = endpoint.create_server_inv_tsx(&mut invite);

        let dialog = match Dialog::new_server(endpoint.clone(), &invite, self.profile.contact.clone())
        {
            Ok(dialog) => dialog,
            Err(e) => {
                log::warn!("cannot create dialog for INVITE, {e}");

                let response = endpoint.create_response(&invite, Code::BAD_REQUEST, None);
                return Ok(transaction.respond_failure(response).await?);
            }
        };

        let mut trying = dialog.create_response(&invite, Code::TRYING, None)?;
        transaction.respond_provisional(&mut trying).await?;

        let parts = SessionParts {
            id: format!("{}{}", dialog.call_id.0, dialog.key().local_tag),
            direction: Direction::Incoming,
            state: SessionState::Invited,
            local_identity: invite.base_headers.to.addr.clone(),
            remote_identity: invite.base_headers.from.addr.clone(),
            events: Emitter::new(),
            media_events: Emitter::new(),
        };

        let (session, actor) = Session::create(endpoint.clone(), self.profile.clone(), parts);

        if !invite.body.is_empty()
            && let Err(e) = actor.shared.media.set_description(invite.body.clone()).await
        {
            log::warn!("rejecting INVITE, remote offer not accepted, {e}");

            actor.shared.media.close();

            let response = dialog.create_response(&invite, Code::NOT_ACCEPTABLE_HERE, None)?;
            return Ok(transaction.respond_failure(response).await?);
        }

        let (usage_events_tx, usage_events) = mpsc::unbounded_channel();
        let awaited_ack = AwaitedAckSlot::default();

        let usage_guard = register_usage(
            endpoint.clone(),
            dialog.key().clone(),
            InviteUsage {
                events: usage_events_tx.clone(),
                awaited_ack: awaited_ack.clone(),
                negotiator: actor.shared.negotiator.clone(),
            },
        )
        .ok_or(Error::Failed(Cause::DialogError))?;

        let branch = invite.tsx_key.branch().clone();

        self.cancellables
            .lock()
            .insert(branch.clone(), usage_events_tx);

        log::debug!("new incoming session {}", session.id());

        // listeners get to subscribe to the session's events before it runs
        self.sessions.emit(session);

        tokio::spawn(incoming::run(
            actor,
            Incoming {
                dialog,
                transaction,
                invite,
                branch,
                usage_events,
                awaited_ack,
                usage_guard,
                replaces,
            },
        ));

        Ok(())
    }

    /// Response refusing an INVITE that requires extensions we do not use, or does not
    /// support one we require
    fn check_extensions(
        &self,
        endpoint: &Endpoint,
        invite: &IncomingRequest,
    ) -> Option<OutgoingResponse> {
        let required: Vec<BytesStr> = invite
            .headers
            .try_get_named::<Vec<Require>>()
            .and_then(|tags| tags.ok())
            .unwrap_or_default()
            .into_iter()
            .map(|Require(tag)| tag)
            .collect();

        let unsupported: Vec<&str> = required
            .iter()
            .map(BytesStr::as_str)
            .filter(|tag| match *tag {
                "100rel" => self.profile.rel100 == Support::None,
                "replaces" => self.profile.replaces == Support::None,
                _ => true,
            })
            .collect();

        if !unsupported.is_empty() {
            log::debug!("rejecting INVITE requiring {unsupported:?}");

            let mut response = endpoint.create_response(invite, Code::BAD_EXTENSION, None);
            response
                .msg
                .headers
                .insert(Name::UNSUPPORTED, unsupported.join(", "));

            return Some(response);
        }

        let supported: Vec<BytesStr> = invite
            .headers
            .try_get_named::<Vec<Supported>>()
            .and_then(|tags| tags.ok())
            .unwrap_or_default()
            .into_iter()
            .map(|Supported(tag)| tag)
            .collect();

        let peer_has_100rel = required
            .iter()
            .chain(supported.iter())
            .any(|tag| tag == "100rel");

        if self.profile.rel100 == Support::Required && !peer_has_100rel {
            log::debug!("rejecting INVITE without support for reliable provisional responses");

            let mut response = endpoint.create_response(invite, Code::EXTENSION_REQUIRED, None);
            response.msg.headers.insert(Name::REQUIRE, "100rel");

            return Some(response);
        }

        None
    }

    /// The session named by the INVITE's Replaces header, or the code to refuse the INVITE with
    fn replaced_session(&self, invite: &IncomingRequest) -> Result<Option<Session>, Code> {
        if self.profile.replaces == Support::None {
            return Ok(None);
        }

        let replaces = match invite.headers.try_get_named::<Replaces>() {
            None => return Ok(None),
            Some(Ok(replaces)) => replaces,
            Some(Err(e)) => {
                log::debug!("invalid Replaces header, {e}");
                return Err(Code::BAD_REQUEST);
            }
        };

        // tags as seen from our side of the dialog
        let key = DialogKey {
            call_id: replaces.call_id,
            local_tag: replaces.to_tag,
            peer_tag: Some(replaces.from_tag),
        };

        let shared = self.replaceable.lock().get(&key).and_then(Weak::upgrade);

        match shared {
            Some(shared) if *shared.state.borrow() == SessionState::Confirmed => {
                if replaces.early_only {
                    // only confirmed sessions are replaceable
                    Err(Code::BUSY_HERE)
                } else {
                    Ok(Some(Session { shared }))
                }
            }
            _ => {
                log::debug!("INVITE replaces unknown dialog {key}");
                Err(Code::CALL_OR_TRANSACTION_DOES_NOT_EXIST)
            }
        }
    }

    async fn handle_cancel(&self, endpoint: &Endpoint, mut cancel: IncomingRequest) -> Result<()> {
        let branch = cancel.tsx_key.branch();

        let invite = self.cancellables.lock().remove(branch);

        let code = match invite {
            Some(invite) if invite.send(UsageEvent::Cancel).is_ok() => Code::OK,
            _ => Code::CALL_OR_TRANSACTION_DOES_NOT_EXIST,
        };

        let response = endpoint.create_response(&cancel, code, None);

        Ok(endpoint
            .create_server_tsx(&mut cancel)
            .respond(response)
            .await?)
    }
}

/// Answer an INVITE that never becomes a session
async fn refuse(
    endpoint: &Endpoint,
    mut invite: IncomingRequest,
    response: OutgoingResponse,
) -> Result<()> {
    Ok(endpoint
        .create_server_inv_tsx(&mut invite)
        .respond_failure(response)
        .await?)
}
