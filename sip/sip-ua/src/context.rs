//! Client side of a single out-of-dialog request (e.g. MESSAGE or OPTIONS)

use crate::cause::{Cause, sip_error_cause};
use crate::emitter::Emitter;
use crate::profile::{Authenticator, Profile};
use crate::util::extend_headers;
use crate::Result;
use bytes::Bytes;
use bytesstr::BytesStr;
use sip_core::{Endpoint, Request};
use sip_types::header::typed::ContentType;
use sip_types::uri::SipUri;
use sip_types::{Code, CodeKind, Method};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextEvent {
    /// Provisional response received
    Progress {
        code: Code,
        reason: Option<BytesStr>,
    },
    Accepted {
        code: Code,
        reason: Option<BytesStr>,
    },
    /// Final failure response received
    Rejected {
        code: Code,
        reason: Option<BytesStr>,
        cause: Cause,
    },
    /// Ended without a final response, or with a rejection after any retries
    Failed { code: Option<Code>, cause: Cause },
}

impl ContextEvent {
    pub fn is_final(&self) -> bool {
        !matches!(self, ContextEvent::Progress { .. })
    }
}

#[derive(Debug, Default, Clone)]
pub struct RequestOptions {
    /// Additional `Name: value` header lines
    pub extra_headers: Vec<String>,
    pub content_type: Option<ContentType>,
    pub body: Bytes,

    /// Listeners registered here see every event of the request
    pub events: Emitter<ContextEvent>,
}

/// A request sent by the user agent, waiting for its final response
#[derive(Debug)]
pub struct ClientContext {
    method: Method,
    target: SipUri,
    events: Emitter<ContextEvent>,
    cancel: CancellationToken,
    outcome: watch::Receiver<Option<ContextEvent>>,
}

impl ClientContext {
    /// Create the request and send it in the background
    pub fn send(
        endpoint: Endpoint,
        profile: &Profile,
        method: Method,
        target: SipUri,
        options: RequestOptions,
    ) -> Result<Self> {
        let mut request = profile.create_request(method.clone(), target.clone());

        extend_headers(&mut request.headers, &options.extra_headers)?;

        if let Some(content_type) = &options.content_type {
            request.headers.insert_named(content_type);
            request.body = options.body;
        }

        let cancel = CancellationToken::new();
        let (outcome_tx, outcome) = watch::channel(None);

        tokio::spawn(run(
            endpoint,
            request,
            profile.authenticator(),
            options.events.clone(),
            cancel.clone(),
            outcome_tx,
        ));

        Ok(Self {
            method,
            target,
            events: options.events,
            cancel,
            outcome,
        })
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn target(&self) -> &SipUri {
        &self.target
    }

    pub fn events(&self) -> &Emitter<ContextEvent> {
        &self.events
    }

    /// Stop waiting for the final response, emits `Failed` with [`Cause::Canceled`]
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the final event of the request
    pub async fn outcome(&self) -> ContextEvent {
        let mut outcome = self.outcome.clone();

        match outcome.wait_for(Option::is_some).await {
            Ok(event) => event.clone().unwrap_or(ContextEvent::Failed {
                code: None,
                cause: Cause::InternalError,
            }),
            Err(_) => ContextEvent::Failed {
                code: None,
                cause: Cause::InternalError,
            },
        }
    }
}

async fn run(
    endpoint: Endpoint,
    request: Request,
    authenticator: Authenticator,
    events: Emitter<ContextEvent>,
    cancel: CancellationToken,
    outcome: watch::Sender<Option<ContextEvent>>,
) {
    let method = request.line.method.clone();

    let event = tokio::select! {
        _ = cancel.cancelled() => ContextEvent::Failed { code: None, cause: Cause::Canceled },
        result = transact(&endpoint, request, authenticator, &events) => match result {
            Ok(event) => event,
            Err(e) => {
                log::warn!("{method} request failed, {e}");
                ContextEvent::Failed { code: None, cause: e.cause() }
            }
        },
    };

    log::debug!("{method} request finished with {event:?}");

    events.emit(event.clone());
    let _ = outcome.send(Some(event));
}

async fn transact(
    endpoint: &Endpoint,
    mut request: Request,
    mut authenticator: Authenticator,
    events: &Emitter<ContextEvent>,
) -> Result<ContextEvent> {
    authenticator.authorize(&mut request);

    'send: loop {
        let mut tsx = endpoint.send_request(request.clone()).await?;

        loop {
            let response = tsx.receive().await?;

            let code = response.line.code;
            let reason = response.line.reason.clone();

            match code.kind() {
                CodeKind::Provisional => events.emit(ContextEvent::Progress { code, reason }),
                CodeKind::Success => return Ok(ContextEvent::Accepted { code, reason }),
                _ => {
                    if authenticator.handle_response(tsx.request(), &response, &mut request) {
                        continue 'send;
                    }

                    let cause = sip_error_cause(code, reason.as_ref());

                    return Ok(ContextEvent::Rejected {
                        code,
                        reason,
                        cause,
                    });
                }
            }
        }
    }
}
