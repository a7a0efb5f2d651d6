use bytesstr::BytesStr;
use sip_core::IncomingRequest;
use std::fmt;

/// Identifies a dialog: Call-ID, local tag and remote tag
#[derive(Debug, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct DialogKey {
    pub call_id: BytesStr,
    pub local_tag: BytesStr,
    pub peer_tag: Option<BytesStr>,
}

impl DialogKey {
    /// Key of the dialog an incoming request belongs to, `None` for out-of-dialog requests
    pub(crate) fn from_incoming(request: &IncomingRequest) -> Option<Self> {
        let base_headers = &request.base_headers;

        Some(Self {
            call_id: base_headers.call_id.0.clone(),
            local_tag: base_headers.to.tag.as_ref()?.clone(),
            peer_tag: base_headers.from.tag.clone(),
        })
    }
}

impl fmt::Display for DialogKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};local={}", self.call_id, self.local_tag)?;

        if let Some(peer_tag) = &self.peer_tag {
            write!(f, ";peer={peer_tag}")?;
        }

        Ok(())
    }
}
