//! # sipline
//!
//! A SIP user agent talking to its servers over WebSocket connections.
//!
//! [`UserAgent`] ties everything together: it keeps a connection to one of the configured
//! servers, registers the user's contact, and creates [`Session`](sip_ua::Session)s,
//! [`Subscription`](sip_ua::Subscription)s and single requests like MESSAGE.
//!
//! The WebSocket transport itself and the media handling are supplied by the application
//! through a [`Connector`](sip_core::transport::Connector) and a
//! [`MediaHandlerFactory`](sip_ua::media::MediaHandlerFactory).

mod config;
mod connection;
mod layer;
mod logging;
mod media;
mod user_agent;

#[cfg(test)]
mod tests;

pub use config::{Config, WsServer};
pub use logging::{LogConfig, LogConnector};
pub use user_agent::{IncomingMessage, UaEvent, UserAgent};

pub use sip_core;
pub use sip_types;
pub use sip_ua;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Ua(#[from] sip_ua::Error),
}
