//! Client side authentication of SIP requests rejected with `401` or `407`

use sip_types::Headers;
use sip_types::msg::{RequestLine, StatusLine};
use std::error::Error;
use std::fmt::Debug;

mod digest;

pub use digest::{DigestAuthenticator, DigestCredentials, DigestError, DigestUser};

/// SIP request authenticator
pub trait ClientAuthenticator {
    type Error: Error + Debug + Send + Sync + 'static;

    /// Add the authorization headers gathered from previous challenges to a request
    ///
    /// Does nothing until a challenge was handled. Responses are recomputed for the method
    /// and URI of `line`.
    fn authorize_request(&mut self, line: &RequestLine, request: &mut Headers);

    /// Handle a `401`/`407` response to `rejected_request`
    ///
    /// Returns an error when the request must not be sent again.
    fn handle_rejection(
        &mut self,
        rejected_request: RequestParts<'_>,
        reject_response: ResponseParts<'_>,
    ) -> Result<(), Self::Error>;
}

/// The request that has to be authenticated
#[derive(Debug, Clone, Copy)]
pub struct RequestParts<'s> {
    pub line: &'s RequestLine,
    pub headers: &'s Headers,
    pub body: &'s [u8],
}

/// The response that rejected the request
#[derive(Debug, Clone, Copy)]
pub struct ResponseParts<'s> {
    pub line: &'s StatusLine,
    pub headers: &'s Headers,
    pub body: &'s [u8],
}
