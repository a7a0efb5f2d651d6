//! In-memory transport
//!
//! [`memory_transport`] returns a [`Connector`] for the user agent and a [`MemoryRemote`]
//! playing the server side: it records every message sent by the user agent, injects
//! messages, drops connections and refuses connection attempts.

use super::{Connection, Connector, InteropFlags, ParsedMessage, TpHandle, Transport, TransportEvent};
use crate::transport::parse_message;
use bytes::Bytes;
use parking_lot::Mutex;
use sip_types::host::HostPort;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::{fmt, io};
use tokio::sync::mpsc;

/// Host put into the Via header by memory transports
pub const MEMORY_SENT_BY: &str = "sipline.invalid";

#[derive(Default)]
struct Shared {
    attempts: Vec<String>,
    refused: HashSet<String>,
    refuse_all: bool,
    current: Option<Current>,
}

struct Current {
    uri: String,
    open: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

/// Create a connected connector/remote pair
pub fn memory_transport() -> (MemoryConnector, MemoryRemote) {
    let shared = Arc::new(Mutex::new(Shared::default()));
    let (sent_tx, sent_rx) = mpsc::unbounded_channel();

    (
        MemoryConnector {
            shared: shared.clone(),
            sent: sent_tx,
        },
        MemoryRemote {
            shared,
            sent: sent_rx,
        },
    )
}

pub struct MemoryConnector {
    shared: Arc<Mutex<Shared>>,
    sent: mpsc::UnboundedSender<Bytes>,
}

#[async_trait::async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, uri: &str, flags: &InteropFlags) -> io::Result<Connection> {
        let mut shared = self.shared.lock();

        shared.attempts.push(uri.to_owned());

        if shared.refuse_all || shared.refused.contains(uri) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("connection to {uri} refused"),
            ));
        }

        if let Some(previous) = shared.current.take() {
            previous.open.store(false, Ordering::SeqCst);
        }

        let secure = uri.starts_with("wss://");
        let name = if flags.via_tcp {
            "TCP"
        } else if secure {
            "WSS"
        } else {
            "WS"
        };

        let open = Arc::new(AtomicBool::new(true));
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        shared.current = Some(Current {
            uri: uri.to_owned(),
            open: open.clone(),
            events: events_tx,
        });

        let transport = MemoryTransport {
            uri: uri.to_owned(),
            name,
            secure,
            open,
            sent: self.sent.clone(),
        };

        Ok(Connection {
            transport: TpHandle::new(transport),
            events: events_rx,
        })
    }
}

#[derive(Debug)]
struct MemoryTransport {
    uri: String,
    name: &'static str,
    secure: bool,
    open: Arc<AtomicBool>,
    sent: mpsc::UnboundedSender<Bytes>,
}

impl fmt::Display for MemoryTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "memory:{}", self.uri)
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &'static str {
        self.name
    }

    fn secure(&self) -> bool {
        self.secure
    }

    fn reliable(&self) -> bool {
        true
    }

    fn sent_by(&self) -> HostPort {
        HostPort::host_name(MEMORY_SENT_BY)
    }

    async fn send(&self, message: &[u8]) -> io::Result<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "memory transport is closed",
            ));
        }

        self.sent
            .send(Bytes::copy_from_slice(message))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "memory remote is gone"))
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

/// Server side of the in-memory transport
pub struct MemoryRemote {
    shared: Arc<Mutex<Shared>>,
    sent: mpsc::UnboundedReceiver<Bytes>,
}

impl MemoryRemote {
    /// Wait for the next message sent by the user agent
    pub async fn receive(&mut self) -> Option<Bytes> {
        self.sent.recv().await
    }

    /// Wait for the next message sent by the user agent and parse it
    pub async fn receive_message(&mut self) -> Option<ParsedMessage> {
        loop {
            let buffer = self.sent.recv().await?;

            match parse_message(buffer) {
                Ok(message) => return Some(message),
                Err(e) => log::warn!("memory remote received malformed message, {e}"),
            }
        }
    }

    /// Return a message sent by the user agent, if one is queued
    pub fn try_receive(&mut self) -> Option<Bytes> {
        self.sent.try_recv().ok()
    }

    /// Deliver `message` to the user agent over the current connection.
    ///
    /// Returns false if there is no open connection.
    pub fn send(&self, message: impl Into<Bytes>) -> bool {
        let shared = self.shared.lock();

        match &shared.current {
            Some(current) if current.open.load(Ordering::SeqCst) => current
                .events
                .send(TransportEvent::Message(message.into()))
                .is_ok(),
            _ => false,
        }
    }

    /// Drop the current connection
    pub fn disconnect(&self) {
        let mut shared = self.shared.lock();

        if let Some(current) = shared.current.take() {
            current.open.store(false, Ordering::SeqCst);
            let _ = current.events.send(TransportEvent::Disconnected);
        }
    }

    /// Refuse every future connection attempt to `uri`
    pub fn refuse(&self, uri: &str) {
        self.shared.lock().refused.insert(uri.to_owned());
    }

    /// Refuse every future connection attempt, or stop doing so
    pub fn refuse_all(&self, refuse: bool) {
        let mut shared = self.shared.lock();
        shared.refuse_all = refuse;

        if !refuse {
            shared.refused.clear();
        }
    }

    /// Every uri a connection attempt was made to, in order
    pub fn attempts(&self) -> Vec<String> {
        self.shared.lock().attempts.clone()
    }

    /// The uri of the open connection, if any
    pub fn connected_to(&self) -> Option<String> {
        let shared = self.shared.lock();

        shared
            .current
            .as_ref()
            .filter(|current| current.open.load(Ordering::SeqCst))
            .map(|current| current.uri.clone())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn send_and_inject() {
        let (connector, mut remote) = memory_transport();

        let mut connection = connector
            .connect("wss://edge.example.com", &InteropFlags::default())
            .await
            .unwrap();

        assert_eq!(connection.transport.name(), "WSS");
        assert!(connection.transport.reliable());
        assert_eq!(remote.connected_to().as_deref(), Some("wss://edge.example.com"));

        connection.transport.send(b"ping").await.unwrap();
        assert_eq!(remote.receive().await.unwrap(), Bytes::from_static(b"ping"));

        assert!(remote.send(Bytes::from_static(b"pong")));
        assert!(matches!(
            connection.events.recv().await,
            Some(TransportEvent::Message(msg)) if msg == "pong"
        ));
    }

    #[tokio::test]
    async fn disconnect_closes_transport() {
        let (connector, remote) = memory_transport();

        let mut connection = connector
            .connect("ws://edge.example.com", &InteropFlags::default())
            .await
            .unwrap();

        remote.disconnect();

        assert!(matches!(
            connection.events.recv().await,
            Some(TransportEvent::Disconnected)
        ));
        assert!(connection.transport.send(b"late").await.is_err());
        assert!(!remote.send(Bytes::from_static(b"late")));
        assert_eq!(remote.connected_to(), None);
    }

    #[tokio::test]
    async fn refused_attempts_are_recorded() {
        let (connector, remote) = memory_transport();

        remote.refuse("wss://a.example.com");

        let flags = InteropFlags {
            via_tcp: true,
            ..Default::default()
        };

        assert!(connector.connect("wss://a.example.com", &flags).await.is_err());

        let connection = connector.connect("wss://b.example.com", &flags).await.unwrap();
        assert_eq!(connection.transport.name(), "TCP");

        assert_eq!(
            remote.attempts(),
            vec!["wss://a.example.com", "wss://b.example.com"]
        );
    }
}
