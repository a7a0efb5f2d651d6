//! SIP types for the sipline user agent
//!
//! Contains the URI and name-addr models, header names and the header map, typed headers
//! and the message-line parser. Everything can be parsed from and printed to its textual
//! SIP representation.
#![forbid(unsafe_code)]

#[macro_use]
mod macros;

pub mod parse;
pub mod print;

pub mod uri;
mod code;
pub mod header;
pub mod host;
mod method;
pub mod msg;

pub use code::{Code, CodeKind};
pub use method::Method;

pub use header::headers::Headers;
pub use header::name::Name;
