//! Printing utilities for SIP message components

use std::fmt;

/// Where an URI is being printed, some parameters are not allowed everywhere
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UriContext {
    /// Request-line URI
    ReqUri,

    /// From/To header
    FromTo,

    /// Contact header
    Contact,

    /// Route/Record-Route header
    Routing,
}

impl UriContext {
    /// Returns if the URI parameter `name` may be printed in this context (RFC 3261 Table 1)
    pub fn allows_param(self, name: &str) -> bool {
        match self {
            UriContext::ReqUri => true,
            UriContext::FromTo => !matches!(name, "maddr" | "ttl" | "transport" | "lr" | "method"),
            UriContext::Contact | UriContext::Routing => !matches!(name, "ttl" | "method"),
        }
    }

    /// Returns if URI headers (`?name=value`) may be printed in this context
    pub fn allows_headers(self) -> bool {
        matches!(self, UriContext::Contact)
    }
}

/// Debug printer for raw message buffers, escaping line breaks and non printable bytes
pub struct BytesPrint<'b>(pub &'b [u8]);

impl fmt::Debug for BytesPrint<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in self.0 {
            match b {
                b'\n' => writeln!(f, "\\n")?,
                b'\r' => f.write_str("\\r")?,
                b'\t' => f.write_str("\\t")?,
                0x20..0x7f => write!(f, "{}", b as char)?,
                _ => write!(f, "\\x{b:02x}")?,
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn from_to_drops_transport_params() {
        assert!(!UriContext::FromTo.allows_param("transport"));
        assert!(UriContext::FromTo.allows_param("user"));
        assert!(UriContext::Routing.allows_param("lr"));
        assert!(!UriContext::ReqUri.allows_headers());
    }

    #[test]
    fn bytes_print_escapes() {
        let printed = format!("{:?}", BytesPrint(b"A\r\n\x01"));

        assert_eq!(printed, "A\\r\\n\n\\x01");
    }
}
