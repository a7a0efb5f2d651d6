//! # SIP User Agent
//!
//! Registrations, INVITE sessions, subscriptions and single requests on top of a
//! [`sip_core::Endpoint`], with media negotiation delegated to a [`media::MediaHandler`].
//!
//! Notable types are
//!
//! - [`Registrator`] keeps a binding of the user agent's contact at a registrar
//! - [`Session`] an INVITE session, created by [`Session::invite`] or received through the [`InviteLayer`]
//! - [`Subscription`] a SUBSCRIBE/NOTIFY event subscription
//! - [`ClientContext`] a single out-of-dialog request like MESSAGE
//!
//! Every one of them reports what happens to it through an [`Emitter`].
//!
//! The modules [`dialog`], [`media`] and [`util`] contain the building blocks used by the types above
//! and can be used for more specialized use cases.

pub mod dialog;
pub mod media;
pub mod util;

mod cause;
mod context;
mod emitter;
mod error;
mod profile;
mod registration;
mod session;
mod subscription;

#[cfg(test)]
mod test_util;

pub use cause::{Cause, sip_error_cause};
pub use context::{ClientContext, ContextEvent, RequestOptions};
pub use emitter::Emitter;
pub use error::{Error, Result};
pub use profile::{DtmfType, PreloadedRoute, Profile, Support};
pub use registration::{RegistrationEvent, Registrator};
pub use session::{
    Direction, DtmfOptions, HoldState, InviteLayer, InviteOptions, Originator, ProgressOptions,
    Session, SessionEvent, SessionState, TerminateOptions,
};
pub use subscription::{
    Notification, SubscribeOptions, Subscription, SubscriptionEvent, SubscriptionLayer,
    SubscriptionStatus,
};
