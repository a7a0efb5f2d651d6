use crate::logging::Logger;
use crate::user_agent::{IncomingMessage, UaEvent};
use rand::distr::Alphanumeric;
use rand::{Rng, rng};
use sip_core::{Endpoint, EndpointBuilder, IncomingRequest, Layer, MayTake};
use sip_types::header::typed::{ContentType, FromTo};
use sip_types::{Code, Method, Name};
use sip_ua::Emitter;

/// Answers out-of-dialog MESSAGE and OPTIONS requests
pub(crate) struct UaLayer {
    pub(crate) events: Emitter<UaEvent>,
    pub(crate) logger: Logger,
}

#[async_trait::async_trait]
impl Layer for UaLayer {
    fn name(&self) -> &'static str {
        "user-agent"
    }

    fn init(&mut self, endpoint: &mut EndpointBuilder) {
        endpoint.add_allow(Method::MESSAGE);
        endpoint.add_allow(Method::OPTIONS);
    }

    async fn receive(&self, endpoint: &Endpoint, request: MayTake<'_, IncomingRequest>) {
        if request.base_headers.to.tag.is_some() {
            return;
        }

        let result = match request.line.method {
            Method::MESSAGE => self.handle_message(endpoint, request.take()).await,
            Method::OPTIONS => handle_options(endpoint, request.take()).await,
            _ => return,
        };

        if let Err(e) = result {
            self.logger
                .warn(format_args!("failed to respond to incoming request, {e}"));
        }
    }
}

impl UaLayer {
    async fn handle_message(
        &self,
        endpoint: &Endpoint,
        mut request: IncomingRequest,
    ) -> sip_core::Result<()> {
        if !self.events.has_listeners() {
            self.logger
                .debug(format_args!("rejecting MESSAGE, nobody is listening"));

            let mut response = endpoint.create_response(&request, Code::METHOD_NOT_ALLOWED, None);
            response.msg.headers.insert_named(endpoint.allowed());

            return endpoint
                .create_server_tsx(&mut request)
                .respond(response)
                .await;
        }

        let mut response = endpoint.create_response(&request, Code::OK, None);
        add_to_tag(&mut response.msg.headers);

        endpoint
            .create_server_tsx(&mut request)
            .respond(response)
            .await?;

        let content_type = request
            .headers
            .try_get_named::<ContentType>()
            .and_then(Result::ok);

        self.events.emit(UaEvent::Message(IncomingMessage {
            from: request.base_headers.from.addr,
            to: request.base_headers.to.addr,
            content_type,
            body: request.body,
        }));

        Ok(())
    }
}

async fn handle_options(endpoint: &Endpoint, mut request: IncomingRequest) -> sip_core::Result<()> {
    let mut response = endpoint.create_response(&request, Code::OK, None);
    add_to_tag(&mut response.msg.headers);

    response.msg.headers.insert_named(endpoint.allowed());
    response.msg.headers.insert_named(endpoint.supported());
    response.msg.headers.insert(Name::ACCEPT, "application/sdp");

    endpoint
        .create_server_tsx(&mut request)
        .respond(response)
        .await
}

fn add_to_tag(headers: &mut sip_types::Headers) {
    let tag: String = rng()
        .sample_iter(Alphanumeric)
        .take(10)
        .map(char::from)
        .collect();

    // the To header was copied from a successfully parsed request
    let _ = headers.edit(Name::TO, |to: &mut FromTo| to.tag = Some(tag.into()));
}
