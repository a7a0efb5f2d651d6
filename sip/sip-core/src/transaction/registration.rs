use super::{TsxKey, TsxMessage, TsxResponse};
use crate::Endpoint;
use sip_types::msg::MessageLine;
use std::mem::replace;
use tokio::sync::mpsc;

/// Used by every transaction to register itself inside the endpoint
/// and receive transactional messages from it.
///
/// Dropping it removes the transaction from the endpoint.
#[derive(Debug)]
pub(crate) struct TsxRegistration {
    pub(crate) endpoint: Endpoint,
    pub(crate) tsx_key: TsxKey,

    pub(super) receiver: mpsc::UnboundedReceiver<TsxMessage>,
}

impl TsxRegistration {
    pub(crate) fn create(endpoint: Endpoint, tsx_key: TsxKey) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();

        endpoint.transactions().register_transaction(
            tsx_key.clone(),
            Box::new(move |msg| sender.send(msg).map_err(|e| e.0).err()),
        );

        Self {
            endpoint,
            tsx_key,
            receiver,
        }
    }

    /// Add a filter to reject messages that match the transaction but must be
    /// processed by a higher level layer.
    pub(crate) fn add_filter<F>(&self, filter: F)
    where
        F: Fn(&TsxMessage) -> bool + Send + Sync + 'static,
    {
        let mut map = self.endpoint.transactions().map.lock();

        let Some(handler) = map.get_mut(&self.tsx_key) else {
            return;
        };

        let old_handler = replace(handler, Box::new(Some));

        *handler = Box::new(move |msg| {
            if filter(&msg) {
                old_handler(msg)
            } else {
                Some(msg)
            }
        });
    }

    pub(crate) async fn receive(&mut self) -> TsxMessage {
        match self.receiver.recv().await {
            Some(msg) => msg,
            // the handler inside the endpoint lives as long as this registration
            None => std::future::pending().await,
        }
    }

    pub(crate) async fn receive_response(&mut self) -> TsxResponse {
        loop {
            match self.receive().await {
                TsxMessage {
                    line: MessageLine::Request(line),
                    ..
                } => {
                    log::debug!("client transaction {} ignoring {line}", self.tsx_key);
                }
                TsxMessage {
                    tp_info,
                    line: MessageLine::Response(line),
                    base_headers,
                    headers,
                    body,
                } => {
                    return TsxResponse {
                        tp_info,
                        line,
                        base_headers,
                        headers,
                        body,
                    };
                }
            }
        }
    }
}

impl Drop for TsxRegistration {
    fn drop(&mut self) {
        self.endpoint.transactions().remove_transaction(&self.tsx_key);
    }
}
