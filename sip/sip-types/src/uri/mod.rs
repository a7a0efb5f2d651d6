//! SIP URI and name-addr models

pub mod params;
mod name_addr;
mod sip;

pub use name_addr::{NameAddr, NameAddrInContext};
pub use sip::{InContext, Scheme, SipUri};
