//! Keeps the endpoint connected to one of the configured WebSocket servers

use crate::config::{Config, WsServer};
use crate::logging::Logger;
use crate::user_agent::UaEvent;
use parking_lot::Mutex;
use sip_core::Endpoint;
use sip_core::transport::{Connection, Connector, InteropFlags, TransportEvent};
use sip_types::header::typed::Routing;
use sip_types::uri::{NameAddr, SipUri};
use sip_ua::{Emitter, PreloadedRoute, Registrator};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Retry schedule, taken from the configuration
#[derive(Debug, Clone)]
pub(crate) struct Schedule {
    /// Servers in the order they are tried
    pub(crate) servers: Vec<WsServer>,
    pub(crate) attempts_per_server: u32,
    pub(crate) reconnection_timeout: Duration,
    pub(crate) recovery_min: Duration,
    pub(crate) recovery_max: Duration,
}

impl Schedule {
    pub(crate) fn from_config(config: &Config) -> Self {
        Self {
            servers: config.servers_by_weight(),
            attempts_per_server: config.ws_server_max_reconnection.max(1),
            reconnection_timeout: Duration::from_secs(config.ws_server_reconnection_timeout),
            recovery_min: Duration::from_secs(config.connection_recovery_min_interval),
            recovery_max: Duration::from_secs(config.connection_recovery_max_interval),
        }
    }

    /// Delay before the next round over all servers after `failed_rounds` rounds failed
    pub(crate) fn recovery_delay(&self, failed_rounds: u32) -> Duration {
        let factor = 2u32.saturating_pow(failed_rounds.saturating_sub(1));

        self.recovery_min
            .checked_mul(factor)
            .unwrap_or(self.recovery_max)
            .min(self.recovery_max)
    }
}

/// Everything the connection task needs, shared with the user agent
pub(crate) struct ConnectionTask {
    pub(crate) endpoint: Endpoint,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) flags: InteropFlags,
    pub(crate) schedule: Schedule,
    pub(crate) preloaded_route: Option<PreloadedRoute>,
    pub(crate) registrator: Registrator,
    /// Register after the first connect
    pub(crate) register: bool,
    /// Extra headers of the last REGISTER requested by the application
    pub(crate) register_headers: Arc<Mutex<Vec<String>>>,
    pub(crate) events: Emitter<UaEvent>,
    pub(crate) logger: Logger,
    pub(crate) cancel: CancellationToken,
}

enum Ended {
    Disconnected,
    Stopped,
}

impl ConnectionTask {
    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let mut next_server = 0;
        let mut register = self.register;

        loop {
            let Some((index, connection, attempts)) = self.connect(next_server).await else {
                return;
            };

            next_server = index;

            let server = &self.schedule.servers[index];
            self.logger
                .info(format_args!("connected to {} after {attempts} attempt(s)", server.ws_uri));

            self.endpoint.set_transport(Some(connection.transport.clone()));

            if let Some(route) = &self.preloaded_route {
                route.set(route_to(server));
            }

            self.events.emit(UaEvent::Connected { attempts });

            if register {
                self.spawn_register();
            }

            let ended = self.pump(connection).await;

            self.endpoint.set_transport(None);

            if let Some(route) = &self.preloaded_route {
                route.set(None);
            }

            // a binding that existed before the connection was lost is restored after reconnecting
            register = self.registrator.transport_closed();

            self.events.emit(UaEvent::Disconnected);

            if let Ended::Stopped = ended {
                return;
            }

            self.logger
                .warn(format_args!("connection to {} lost", server.ws_uri));
        }
    }

    /// Try every server starting with `first` until one accepts.
    ///
    /// Returns the index of the server, the connection and the number of attempts it took.
    /// Returns `None` when stopped.
    async fn connect(&self, first: usize) -> Option<(usize, Connection, u32)> {
        let servers = &self.schedule.servers;
        let mut attempts = 0;
        let mut failed_rounds = 0;

        loop {
            for offset in 0..servers.len() {
                let index = (first + offset) % servers.len();
                let server = &servers[index];

                for retry in 0..self.schedule.attempts_per_server {
                    if retry > 0 && !self.sleep(self.schedule.reconnection_timeout).await {
                        return None;
                    }

                    attempts += 1;

                    let result = tokio::select! {
                        _ = self.cancel.cancelled() => return None,
                        result = self.connector.connect(&server.ws_uri, &self.flags) => result,
                    };

                    match result {
                        Ok(connection) => return Some((index, connection, attempts)),
                        Err(e) => self
                            .logger
                            .warn(format_args!("failed to connect to {}, {e}", server.ws_uri)),
                    }
                }
            }

            failed_rounds += 1;

            let delay = self.schedule.recovery_delay(failed_rounds);
            self.logger.error(format_args!(
                "every server failed, next attempt in {}s",
                delay.as_secs()
            ));

            if !self.sleep(delay).await {
                return None;
            }
        }
    }

    /// Returns false if stopped while sleeping
    async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    async fn pump(&self, mut connection: Connection) -> Ended {
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => {
                    connection.transport.close();
                    return Ended::Stopped;
                }
                event = connection.events.recv() => event,
            };

            match event {
                Some(TransportEvent::Message(buffer)) => {
                    self.endpoint.receive(connection.transport.clone(), buffer)
                }
                Some(TransportEvent::Disconnected) | None => return Ended::Disconnected,
            }
        }
    }

    fn spawn_register(&self) {
        let registrator = self.registrator.clone();
        let headers = self.register_headers.lock().clone();
        let logger = self.logger.clone();

        tokio::spawn(async move {
            if let Err(e) = registrator.register(&headers).await {
                logger.warn(format_args!("registration failed, {e}"));
            }
        });
    }
}

/// `sip:host:port;transport=ws;lr` for the WebSocket server `server`
fn route_to(server: &WsServer) -> Option<Routing> {
    let authority = server
        .ws_uri
        .split_once("://")
        .map_or(server.ws_uri.as_str(), |(_, rest)| rest);
    let authority = authority.split(['/', '?']).next().unwrap_or_default();

    let uri: SipUri = format!("sip:{authority};transport=ws;lr").parse().ok()?;

    Some(Routing::new(NameAddr::uri(uri)))
}
