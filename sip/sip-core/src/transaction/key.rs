use super::generate_branch;
use crate::BaseHeaders;
use bytesstr::BytesStr;
use sip_types::header::HeaderError;
use sip_types::msg::MessageLine;
use sip_types::{Method, Name};
use std::fmt;

/// Transaction key, used to match a message to an ongoing transaction
///
/// Built from the top Via's branch, the CSeq method and the role. INVITE and ACK share a
/// key so an ACK to a failure response reaches the INVITE server transaction. CANCEL has
/// its own key but the same branch as the INVITE it cancels.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct TsxKey {
    role: Role,
    branch: BytesStr,
    method: Option<Method>,
}

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
enum Role {
    Server,
    Client,
}

impl fmt::Display for TsxKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let role = match self.role {
            Role::Server => "server",
            Role::Client => "client",
        };

        let method = self.method.as_ref().unwrap_or(&Method::INVITE);

        write!(f, "{role}:{}:{method}", self.branch)
    }
}

// invite and ack are represented as None
fn filter_method(method: &Method) -> Option<Method> {
    if method.is_invite_or_ack() {
        None
    } else {
        Some(method.clone())
    }
}

impl TsxKey {
    /// Create a new client key with a random branch
    pub fn client(method: &Method) -> Self {
        Self {
            role: Role::Client,
            branch: generate_branch(),
            method: filter_method(method),
        }
    }

    /// The key of a transaction with the same branch and role but another method.
    ///
    /// Used to match a CANCEL to the INVITE transaction it cancels.
    pub fn with_method(&self, method: &Method) -> Self {
        Self {
            role: self.role,
            branch: self.branch.clone(),
            method: filter_method(method),
        }
    }

    pub fn is_server(&self) -> bool {
        self.role == Role::Server
    }

    pub fn is_invite(&self) -> bool {
        self.method.is_none()
    }

    pub fn branch(&self) -> &BytesStr {
        &self.branch
    }

    /// Create a [`TsxKey`] from the line and headers of a received message
    pub fn from_message_parts(
        line: &MessageLine,
        headers: &BaseHeaders,
    ) -> Result<Self, HeaderError> {
        let role = match line {
            MessageLine::Request(_) => Role::Server,
            MessageLine::Response(_) => Role::Client,
        };

        let branch = headers
            .top_via()
            .branch()
            .ok_or_else(|| HeaderError::malformed_adhoc(Name::VIA, "missing branch"))?;

        Ok(Self {
            role,
            branch: branch.clone(),
            method: filter_method(&headers.cseq.method),
        })
    }
}
