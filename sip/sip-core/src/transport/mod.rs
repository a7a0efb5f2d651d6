//! The transport collaborator
//!
//! The core only knows a narrow interface: a connected [`Transport`] that sends raw
//! messages, and a stream of [`TransportEvent`]s carrying received messages and the
//! loss of the connection. Concrete transports (e.g. WebSocket) are created by a
//! [`Connector`] implementation provided by the application.

use crate::{Request, Response};
use bytes::Bytes;
use sip_types::Headers;
use sip_types::host::HostPort;
use sip_types::msg::MessageLine;
use std::fmt::{Debug, Display};
use std::ops::Deref;
use std::sync::Arc;
use std::time::SystemTime;
use std::{fmt, io};
use tokio::sync::mpsc;

pub mod memory;
mod parse;

pub use parse::{ParsedMessage, parse_message};

/// Abstraction over a connected transport
#[async_trait::async_trait]
pub trait Transport: Debug + Display + Send + Sync + 'static {
    /// Name of the transport put into the Via header (e.g. WS, WSS, TCP)
    fn name(&self) -> &'static str;

    /// Indicates if the transport is a secure connection
    fn secure(&self) -> bool;

    /// Is the transport reliable, changes how retransmissions in transactions are handled.
    fn reliable(&self) -> bool;

    /// The sent-by address put into the Via header
    fn sent_by(&self) -> HostPort;

    /// Send a complete message to the connected peer
    async fn send(&self, message: &[u8]) -> io::Result<()>;

    /// Close the connection, no [`TransportEvent::Disconnected`] is produced afterwards
    fn close(&self) {}
}

/// Events produced by a connected transport
#[derive(Debug)]
pub enum TransportEvent {
    /// A raw message was received
    Message(Bytes),

    /// The connection is gone, the transport will not produce any more events
    Disconnected,
}

/// A freshly established connection returned by a [`Connector`]
pub struct Connection {
    pub transport: TpHandle,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Per deployment compatibility toggles.
///
/// They are handed unchanged to the [`Connector`], the core never inspects them.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InteropFlags {
    pub via_tcp: bool,
    pub ip_in_contact: bool,
    pub wss_in_transport: bool,
    pub strip_tcp: bool,
}

/// Creates connections to a server
#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Connect to the server behind `uri` (e.g. `wss://edge.example.com`)
    async fn connect(&self, uri: &str, flags: &InteropFlags) -> io::Result<Connection>;
}

/// Cheaply clonable handle over an implementation of [`Transport`].
#[derive(Debug, Clone)]
pub struct TpHandle {
    transport: Arc<dyn Transport>,
}

impl Deref for TpHandle {
    type Target = dyn Transport;

    fn deref(&self) -> &Self::Target {
        &*self.transport
    }
}

impl PartialEq for TpHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.transport, &other.transport)
    }
}

impl fmt::Display for TpHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.transport, f)
    }
}

impl TpHandle {
    pub fn new<T: Transport>(transport: T) -> Self {
        Self {
            transport: Arc::new(transport),
        }
    }
}

/// Transport related info for a message
#[derive(Debug)]
pub struct MessageTpInfo {
    /// Timestamp the messages was received at
    pub timestamp: SystemTime,

    /// The complete buffer containing the message
    pub buffer: Bytes,

    /// Handle to the transport the messages was received from
    pub transport: TpHandle,
}

/// Message received directly from a transport
pub struct ReceivedMessage {
    pub tp_info: MessageTpInfo,

    /// Leading line of the message. Notates if the message is a request or response
    pub line: MessageLine,

    /// All headers found inside the message, neither parsed nor validated
    pub headers: Headers,

    /// Body part of the messages as raw bytes
    pub body: Bytes,
}

impl fmt::Display for ReceivedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.line, f)
    }
}

impl ReceivedMessage {
    pub fn new(transport: TpHandle, message: ParsedMessage) -> Self {
        Self {
            tp_info: MessageTpInfo {
                timestamp: SystemTime::now(),
                buffer: message.buffer,
                transport,
            },
            line: message.line,
            headers: message.headers,
            body: message.body,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutgoingResponse {
    pub msg: Response,
    pub parts: OutgoingParts,
}

#[derive(Debug, Clone)]
pub struct OutgoingRequest {
    pub msg: Request,
    pub parts: OutgoingParts,
}

#[derive(Debug, Clone)]
pub struct OutgoingParts {
    /// Transport the message will be sent with
    pub transport: TpHandle,

    /// Buffer the message got printed into
    pub buffer: Bytes,
}
