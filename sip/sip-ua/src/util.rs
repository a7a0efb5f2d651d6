use crate::{Error, Result};
use bytesstr::BytesStr;
use rand::{Rng, distr::Alphanumeric, rng};
use sip_core::transaction::TsxResponse;
use sip_core::{Endpoint, IncomingRequest, Request};
use sip_types::{Code, Headers, Method, Name};
use std::time::Duration;

/// Random alphanumeric token, used for tags and Call-IDs
pub(crate) fn random_token(len: usize) -> BytesStr {
    rng()
        .sample_iter(Alphanumeric)
        .take(len)
        .map(char::from)
        .collect::<String>()
        .into()
}

pub(crate) fn random_sequence_number() -> u32 {
    rand::rng().random_range(0..(u32::MAX >> 1))
}

/// Delay after which a binding or subscription valid for `expires` must be refreshed.
///
/// Refreshes `margin` before the expiry. Short lifetimes that do not leave room for the
/// margin are refreshed after half of it instead. The result is always below `expires`
/// for every non-zero `expires`.
pub fn refresh_delay(expires: Duration, margin: Duration) -> Duration {
    if expires <= margin * 2 {
        expires / 2
    } else {
        expires - margin
    }
}

/// Append application supplied header lines (`Name: value`) to `headers`
pub(crate) fn extend_headers(headers: &mut Headers, extra: &[String]) -> Result<()> {
    for line in extra {
        let Some((name, value)) = line.split_once(':') else {
            return Err(Error::InvalidOptions("extra header without ':'"));
        };

        let name = name.trim();
        if name.is_empty() {
            return Err(Error::InvalidOptions("extra header without name"));
        }

        headers.insert(Name::from(name.to_owned()), value.trim().to_owned());
    }

    Ok(())
}

/// Respond to a request nothing processes further, `code` must not be 2XX for INVITEs
pub(crate) async fn respond(
    endpoint: &Endpoint,
    mut request: IncomingRequest,
    code: Code,
) -> Result<()> {
    let response = endpoint.create_response(&request, code, None);

    if request.line.method == Method::INVITE {
        endpoint
            .create_server_inv_tsx(&mut request)
            .respond_failure(response)
            .await?;
    } else {
        endpoint
            .create_server_tsx(&mut request)
            .respond(response)
            .await?;
    }

    Ok(())
}

/// Send a non-INVITE request and wait for its final response
pub(crate) async fn transact(endpoint: &Endpoint, request: Request) -> Result<TsxResponse> {
    let mut transaction = endpoint.send_request(request).await?;

    Ok(transaction.receive_final().await?)
}
