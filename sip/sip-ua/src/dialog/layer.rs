use super::key::DialogKey;
use bytesstr::BytesStr;
use parking_lot::Mutex;
use sip_core::{Endpoint, IncomingRequest, Layer, MayTake, Result};
use sip_types::{Code, Method};
use slotmap::{DefaultKey, SlotMap};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{Instrument, info_span};

/// Part of the application living inside a dialog (e.g. an INVITE session)
#[async_trait::async_trait]
pub trait Usage: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn receive(&self, endpoint: &Endpoint, request: MayTake<'_, IncomingRequest>);
}

pub(super) struct DialogEntry {
    /// Highest CSeq number received from the peer
    peer_cseq: Option<u32>,
    usages: SlotMap<DefaultKey, Arc<dyn Usage>>,
}

impl DialogEntry {
    pub(super) fn new(peer_cseq: Option<u32>) -> Self {
        Self {
            peer_cseq,
            usages: SlotMap::new(),
        }
    }
}

/// Routes in-dialog requests to the usages of their dialog
#[derive(Default)]
pub struct DialogLayer {
    pub(super) dialogs: Mutex<HashMap<DialogKey, DialogEntry>>,
}

enum Dispatch {
    Usages(Vec<Arc<dyn Usage>>),
    OutOfOrder,
}

#[async_trait::async_trait]
impl Layer for DialogLayer {
    fn name(&self) -> &'static str {
        "dialog"
    }

    async fn receive(&self, endpoint: &Endpoint, request: MayTake<'_, IncomingRequest>) {
        let Some(key) = DialogKey::from_incoming(&request) else {
            return;
        };

        let dispatch = {
            let mut dialogs = self.dialogs.lock();

            let Some(entry) = dialogs.get_mut(&key) else {
                return;
            };

            let cseq = request.base_headers.cseq.cseq;

            // ACK and CANCEL carry the CSeq of the request they belong to
            if matches!(request.line.method, Method::ACK | Method::CANCEL) {
                Dispatch::Usages(entry.usages.values().cloned().collect())
            } else if entry.peer_cseq.is_some_and(|last| cseq <= last) {
                Dispatch::OutOfOrder
            } else {
                entry.peer_cseq = Some(cseq);
                Dispatch::Usages(entry.usages.values().cloned().collect())
            }
        };

        log::debug!("request {} matches dialog {key}", request.line.method);

        let usages = match dispatch {
            Dispatch::Usages(usages) => usages,
            Dispatch::OutOfOrder => {
                log::warn!(
                    "rejecting {} with CSeq {} in dialog {key}, out of order",
                    request.line.method,
                    request.base_headers.cseq.cseq
                );

                if let Err(e) = reject_out_of_order(endpoint, request.take()).await {
                    log::warn!("failed to reject out of order request, {e}");
                }

                return;
            }
        };

        let mut request = request;

        for usage in usages {
            let span = info_span!("usage", name = %usage.name());

            usage
                .receive(endpoint, MayTake::new(request.inner()))
                .instrument(span)
                .await;

            if request.inner().is_none() {
                return;
            }
        }

        // Requests not handled by any usage get a default response
        if let Err(e) = handle_unwanted_request(endpoint, request.take()).await {
            log::warn!("failed to respond to unwanted in-dialog request, {e}");
        }
    }
}

async fn reject_out_of_order(endpoint: &Endpoint, mut request: IncomingRequest) -> Result<()> {
    if request.line.method == Method::ACK {
        return Ok(());
    }

    let response = endpoint.create_response(
        &request,
        Code::SERVER_INTERNAL_ERROR,
        Some(BytesStr::from_static("CSeq out of order")),
    );

    if request.line.method == Method::INVITE {
        endpoint
            .create_server_inv_tsx(&mut request)
            .respond_failure(response)
            .await
    } else {
        endpoint.create_server_tsx(&mut request).respond(response).await
    }
}

async fn handle_unwanted_request(endpoint: &Endpoint, mut request: IncomingRequest) -> Result<()> {
    if request.line.method == Method::ACK {
        // Cannot respond to unwanted ACK
        return Ok(());
    }

    let code = if request.line.method == Method::OPTIONS {
        Code::OK
    } else {
        Code::METHOD_NOT_ALLOWED
    };

    let mut response = endpoint.create_response(&request, code, None);
    response.msg.headers.insert_named(endpoint.allowed());

    if request.line.method == Method::INVITE {
        endpoint
            .create_server_inv_tsx(&mut request)
            .respond_failure(response)
            .await
    } else {
        endpoint.create_server_tsx(&mut request).respond(response).await
    }
}

/// The lifetime of the guard ensures the existence of the usage inside a dialog.
/// When dropped the usage will be removed from the dialog.
#[derive(Debug)]
pub struct UsageGuard {
    endpoint: Endpoint,
    dialog_key: DialogKey,
    usage_key: DefaultKey,
}

impl Drop for UsageGuard {
    fn drop(&mut self) {
        let mut dialogs = self.endpoint.layer::<DialogLayer>().dialogs.lock();

        if let Some(entry) = dialogs.get_mut(&self.dialog_key) {
            entry.usages.remove(self.usage_key);
        }
    }
}

/// Register the given `usage` inside the dialog with the `dialog_key`
///
/// Returns `None` if the dialog does not exist (anymore).
pub fn register_usage<U>(endpoint: Endpoint, dialog_key: DialogKey, usage: U) -> Option<UsageGuard>
where
    U: Usage,
{
    let mut dialogs = endpoint.layer::<DialogLayer>().dialogs.lock();
    let entry = dialogs.get_mut(&dialog_key)?;

    let usage_key = entry.usages.insert(Arc::new(usage));

    drop(dialogs);

    Some(UsageGuard {
        endpoint,
        dialog_key,
        usage_key,
    })
}
