//! RFC 3261 transaction layer
//!
//! Every transaction is an object owned by the transaction user, driven by calling its
//! async functions. Retransmissions and timeouts happen inside those calls or inside a
//! short-lived task spawned after a final response was sent or received.

use crate::transport::MessageTpInfo;
use crate::{BaseHeaders, Endpoint};
use bytes::Bytes;
use bytesstr::BytesStr;
use parking_lot::Mutex;
use sip_types::Headers;
use sip_types::msg::{MessageLine, StatusLine};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

mod client;
mod client_inv;
mod key;
mod registration;
mod server;
mod server_inv;

pub mod consts {
    pub const RFC3261_BRANCH_PREFIX: &str = "z9hG4bK";
}

pub use client::ClientTsx;
pub use client_inv::ClientInvTsx;
pub use key::TsxKey;
pub use server::ServerTsx;
pub use server_inv::{Accepted, ServerInvTsx};

pub(crate) use registration::TsxRegistration;

/// RFC 3261 timer values every other timer is derived from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timers {
    /// Round trip time estimate, first retransmit interval
    pub t1: Duration,
    /// Maximum retransmit interval for non-INVITE requests and INVITE responses
    pub t2: Duration,
    /// Maximum duration a message will remain in the network
    pub t4: Duration,
    /// Timer C, how long an INVITE may stay in the Proceeding state without another
    /// provisional response before it is canceled
    pub c: Duration,
}

impl Default for Timers {
    fn default() -> Self {
        Self {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
            c: Duration::from_secs(180),
        }
    }
}

impl Timers {
    /// Timer B, F, H and J: 64*T1
    pub fn transaction_timeout(&self) -> Duration {
        self.t1 * 64
    }

    /// Timer D, how long retransmitted INVITE failure responses are acknowledged again.
    /// 32s with the default T1.
    pub fn timer_d(&self) -> Duration {
        self.t1 * 64
    }

    /// The next retransmit interval after `current`, doubling capped at T2
    pub fn backoff(&self, current: Duration) -> Duration {
        (current * 2).min(self.t2)
    }
}

/// State of a transaction
///
/// Client non-INVITE: Trying, Proceeding, Completed, Terminated.
/// Client INVITE: Calling, Proceeding, Completed, Terminated.
/// Server non-INVITE: Trying, Proceeding, Completed, Terminated.
/// Server INVITE: Proceeding, Completed, Confirmed, Terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TsxState {
    Trying,
    Calling,
    Proceeding,
    Completed,
    Confirmed,
    Terminated,
}

/// Read side of a server transaction's state.
///
/// Server transactions finish in a background task after the final response was sent,
/// this handle keeps observing them after the transaction object itself was consumed.
#[derive(Debug, Clone)]
pub struct TsxStateWatch(watch::Receiver<TsxState>);

impl TsxStateWatch {
    pub(crate) fn new(sender: &watch::Sender<TsxState>) -> Self {
        Self(sender.subscribe())
    }

    pub fn get(&self) -> TsxState {
        *self.0.borrow()
    }

    /// Wait until the transaction reached `state`, returns false if the transaction
    /// ended in another state
    pub async fn wait_for(&mut self, state: TsxState) -> bool {
        self.0.wait_for(|current| *current == state).await.is_ok()
    }
}


pub(crate) type TsxHandler = Box<dyn Fn(TsxMessage) -> Option<TsxMessage> + Send + Sync>;

#[derive(Default)]
pub(crate) struct Transactions {
    map: Mutex<HashMap<TsxKey, TsxHandler>>,
}

impl Transactions {
    /// Pass `message` to the transaction registered for `tsx_key`.
    ///
    /// Returns the message if no transaction took it. In that case, for requests, a
    /// registration is created which buffers retransmissions until the transaction user
    /// creates the server transaction.
    pub(crate) fn deliver(
        &self,
        endpoint: &Endpoint,
        tsx_key: &TsxKey,
        message: TsxMessage,
    ) -> Result<(), (TsxMessage, Option<TsxRegistration>)> {
        let mut map = self.map.lock();

        if let Some(handler) = map.get(tsx_key) {
            return match handler(message) {
                Some(rejected) => Err((rejected, None)),
                None => Ok(()),
            };
        }

        if !tsx_key.is_server() {
            return Err((message, None));
        }

        let (sender, receiver) = mpsc::unbounded_channel();

        map.insert(
            tsx_key.clone(),
            Box::new(move |msg| sender.send(msg).map_err(|e| e.0).err()),
        );

        Err((
            message,
            Some(TsxRegistration {
                endpoint: endpoint.clone(),
                tsx_key: tsx_key.clone(),
                receiver,
            }),
        ))
    }

    pub(crate) fn register_transaction(&self, key: TsxKey, handler: TsxHandler) {
        let mut map = self.map.lock();

        match map.entry(key) {
            Entry::Occupied(e) => log::warn!("Replacing existing transaction {}", e.key()),
            Entry::Vacant(e) => {
                e.insert(handler);
            }
        }
    }

    pub(crate) fn remove_transaction(&self, key: &TsxKey) {
        self.map.lock().remove(key);
    }
}

/// Response received inside a transaction
#[derive(Debug)]
pub struct TsxResponse {
    pub tp_info: MessageTpInfo,

    pub line: StatusLine,
    pub base_headers: BaseHeaders,
    pub headers: Headers,
    pub body: Bytes,
}

/// Message received inside a transaction context
#[derive(Debug)]
pub struct TsxMessage {
    pub tp_info: MessageTpInfo,

    pub line: MessageLine,
    pub base_headers: BaseHeaders,
    pub headers: Headers,
    pub body: Bytes,
}

fn generate_branch() -> BytesStr {
    use rand::distr::Alphanumeric;
    use rand::{Rng, rng};

    consts::RFC3261_BRANCH_PREFIX
        .bytes()
        .chain(rng().sample_iter(Alphanumeric).take(23))
        .map(char::from)
        .collect::<String>()
        .into()
}
