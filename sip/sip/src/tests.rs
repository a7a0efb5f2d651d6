use crate::{Config, Error, UaEvent, UserAgent, WsServer};
use sip_core::transport::ParsedMessage;
use sip_core::transport::memory::{MemoryRemote, memory_transport};
use sip_types::header::typed::{Event, FromTo};
use sip_types::msg::MessageLine;
use sip_types::{Code, Headers, Method, Name};
use sip_ua::media::StaticMedia;
use sip_ua::{Cause, ContextEvent, RequestOptions, SessionState, SubscribeOptions};
use std::fmt::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

const SDP: &str = "v=0\r\no=- 1 1 IN IP4 192.0.2.1\r\ns=-\r\nc=IN IP4 192.0.2.1\r\nt=0 0\r\nm=audio 5004 RTP/AVP 0\r\na=sendrecv\r\n";

fn config() -> Config {
    let _ = env_logger::builder().is_test(true).try_init();

    Config {
        ws_servers: vec![WsServer::new("wss://edge.example.com")],
        ..Config::new("sip:alice@example.com")
    }
}

fn user_agent(config: Config) -> (UserAgent, Server) {
    let (connector, remote) = memory_transport();

    let ua = UserAgent::new(config, Arc::new(connector), StaticMedia::factory(SDP)).unwrap();

    (ua, Server { remote })
}

/// Let every spawned task run until it waits for something
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

struct Server {
    remote: MemoryRemote,
}

impl Server {
    async fn receive(&mut self) -> ParsedMessage {
        self.remote
            .receive_message()
            .await
            .expect("memory transport closed")
    }

    async fn request(&mut self, method: Method) -> ParsedMessage {
        loop {
            let message = self.receive().await;

            if message.line.request_method() == Some(&method) {
                return message;
            }
        }
    }

    /// Next final response
    async fn final_response(&mut self) -> ParsedMessage {
        loop {
            let message = self.receive().await;

            if let MessageLine::Response(line) = &message.line
                && line.code.into_u16() >= 200
            {
                return message;
            }
        }
    }

    fn respond(&self, request: &ParsedMessage, code: u16, extra: &[&str]) {
        let mut response = format!("SIP/2.0 {code} Whatever\r\n");

        for (name, value) in request.headers.iter() {
            if [Name::VIA, Name::FROM, Name::CALL_ID, Name::CSEQ].contains(name) {
                let _ = write!(response, "{name}: {value}\r\n");
            }
        }

        let mut to: FromTo = request.headers.get(Name::TO).unwrap();
        to.tag.get_or_insert_with(|| "server-tag".into());

        let mut headers = Headers::new();
        headers.insert_type(Name::TO, &to);
        let _ = write!(response, "{headers}");

        for line in extra {
            let _ = write!(response, "{line}\r\n");
        }

        response.push_str("Content-Length: 0\r\n\r\n");

        assert!(self.remote.send(response), "user agent is not connected");
    }

    fn send(&self, message: String) {
        assert!(self.remote.send(message), "user agent is not connected");
    }
}

fn code(message: &ParsedMessage) -> Code {
    match &message.line {
        MessageLine::Response(line) => line.code,
        MessageLine::Request(line) => panic!("expected a response, got {}", line.method),
    }
}

fn header(message: &ParsedMessage, name: &str) -> Option<String> {
    let values: Vec<&str> = message
        .headers
        .iter()
        .filter(|(n, _)| **n == name)
        .map(|(_, v)| v.as_str())
        .collect();

    (!values.is_empty()).then(|| values.join(", "))
}

fn message_request(branch: &str, call_id: &str, body: Option<&str>) -> String {
    let mut message = format!(
        "MESSAGE sip:alice@example.com SIP/2.0\r\n\
         Via: SIP/2.0/WSS edge.example.com;branch=z9hG4bK{branch}\r\n\
         From: <sip:bob@example.com>;tag=bob-tag\r\n\
         To: <sip:alice@example.com>\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: 1 MESSAGE\r\n\
         Max-Forwards: 70\r\n"
    );

    match body {
        Some(body) => {
            let _ = write!(
                message,
                "Content-Type: text/plain\r\nContent-Length: {}\r\n\r\n{body}",
                body.len()
            );
        }
        None => message.push_str("Content-Length: 0\r\n\r\n"),
    }

    message
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<UaEvent>) -> UaEvent {
    events.recv().await.expect("user agent events closed")
}

#[tokio::test(start_paused = true)]
async fn register_on_start_and_unregister_on_stop() {
    let (ua, mut server) = user_agent(config());
    let mut events = ua.events().subscribe();

    assert!(matches!(
        next_event(&mut events).await,
        UaEvent::Connected { attempts: 1 }
    ));
    assert!(ua.is_connected());

    let register = server.request(Method::REGISTER).await;
    assert_eq!(
        register.line.to_string().trim_end(),
        "REGISTER sip:example.com SIP/2.0"
    );
    assert_eq!(header(&register, "Expires").as_deref(), Some("600"));
    assert!(header(&register, "Contact").unwrap().contains("transport=ws"));
    server.respond(&register, 200, &["Expires: 300"]);

    assert!(matches!(
        next_event(&mut events).await,
        UaEvent::Registered { expires } if expires == Duration::from_secs(300)
    ));
    assert!(ua.is_registered());

    let stop = tokio::spawn({
        let ua = ua.clone();
        async move { ua.stop().await }
    });

    let unregister = server.request(Method::REGISTER).await;
    assert_eq!(header(&unregister, "Expires").as_deref(), Some("0"));
    server.respond(&unregister, 200, &[]);

    stop.await.unwrap();

    assert!(matches!(
        next_event(&mut events).await,
        UaEvent::Unregistered {
            code: Some(Code::OK),
            cause: None
        }
    ));
    assert!(matches!(next_event(&mut events).await, UaEvent::Disconnected));
    assert!(!ua.is_connected());
    assert!(server.remote.connected_to().is_none());
}

#[tokio::test(start_paused = true)]
async fn servers_rotate_by_weight_and_reregister() {
    let config = Config {
        ws_servers: vec![
            WsServer {
                ws_uri: "wss://a.example.com".into(),
                weight: 1,
            },
            WsServer {
                ws_uri: "wss://b.example.com".into(),
                weight: 5,
            },
        ],
        ws_server_max_reconnection: 2,
        ..config()
    };

    let (connector, remote) = memory_transport();
    remote.refuse("wss://b.example.com");

    let ua = UserAgent::new(config, Arc::new(connector), StaticMedia::factory(SDP)).unwrap();
    let mut server = Server { remote };
    let mut events = ua.events().subscribe();

    let start = Instant::now();

    assert!(matches!(
        next_event(&mut events).await,
        UaEvent::Connected { attempts: 3 }
    ));
    // one reconnection timeout between the two attempts to b
    assert_eq!(start.elapsed(), Duration::from_secs(4));
    assert_eq!(
        server.remote.attempts(),
        [
            "wss://b.example.com",
            "wss://b.example.com",
            "wss://a.example.com"
        ]
    );

    let register = server.request(Method::REGISTER).await;
    server.respond(&register, 200, &[]);
    assert!(matches!(
        next_event(&mut events).await,
        UaEvent::Registered { .. }
    ));

    server.remote.disconnect();

    assert!(matches!(
        next_event(&mut events).await,
        UaEvent::Unregistered {
            code: None,
            cause: Some(Cause::ConnectionError)
        }
    ));
    assert!(matches!(next_event(&mut events).await, UaEvent::Disconnected));

    // the last working server is tried first
    assert!(matches!(
        next_event(&mut events).await,
        UaEvent::Connected { attempts: 1 }
    ));
    assert_eq!(server.remote.connected_to().as_deref(), Some("wss://a.example.com"));

    let register = server.request(Method::REGISTER).await;
    server.respond(&register, 200, &[]);
    assert!(matches!(
        next_event(&mut events).await,
        UaEvent::Registered { .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn recovery_delay_grows_while_every_server_fails() {
    let config = Config {
        register: false,
        ws_server_max_reconnection: 1,
        ..config()
    };

    let (connector, remote) = memory_transport();
    remote.refuse_all(true);

    let ua = UserAgent::new(config, Arc::new(connector), StaticMedia::factory(SDP)).unwrap();
    let mut events = ua.events().subscribe();

    let start = Instant::now();

    // attempts at 0s, 2s, 6s and 14s
    for (at, attempts) in [(1, 1), (3, 2), (7, 3), (15, 4)] {
        tokio::time::sleep_until(start + Duration::from_secs(at)).await;
        assert_eq!(remote.attempts().len(), attempts, "after {at}s");
    }

    remote.refuse_all(false);

    assert!(matches!(
        next_event(&mut events).await,
        UaEvent::Connected { attempts: 5 }
    ));
    assert_eq!(start.elapsed(), Duration::from_secs(30));
}

#[tokio::test(start_paused = true)]
async fn incoming_message_needs_a_listener() {
    let (ua, mut server) = user_agent(Config {
        register: false,
        ..config()
    });

    settle().await;
    assert!(ua.is_connected());

    server.send(message_request("m1", "message-1", Some("hello")));

    let rejected = server.final_response().await;
    assert_eq!(code(&rejected), Code::METHOD_NOT_ALLOWED);
    assert!(header(&rejected, "Allow").unwrap().contains("MESSAGE"));

    let mut events = ua.events().subscribe();

    server.send(message_request("m2", "message-2", Some("hello")));

    let accepted = server.final_response().await;
    assert_eq!(code(&accepted), Code::OK);

    let UaEvent::Message(message) = next_event(&mut events).await else {
        panic!("expected a message event");
    };

    assert_eq!(message.from.uri.to_string(), "sip:bob@example.com");
    assert_eq!(message.to.uri.to_string(), "sip:alice@example.com");
    assert!(message.content_type.unwrap().is("text/plain"));
    assert_eq!(&message.body[..], b"hello");
}

#[tokio::test(start_paused = true)]
async fn options_are_answered() {
    let (_ua, mut server) = user_agent(Config {
        register: false,
        ..config()
    });

    settle().await;

    server.send(
        "OPTIONS sip:alice@example.com SIP/2.0\r\n\
         Via: SIP/2.0/WSS edge.example.com;branch=z9hG4bKoptions\r\n\
         From: <sip:bob@example.com>;tag=bob-tag\r\n\
         To: <sip:alice@example.com>\r\n\
         Call-ID: options-1\r\n\
         CSeq: 1 OPTIONS\r\n\
         Max-Forwards: 70\r\n\
         Content-Length: 0\r\n\r\n"
            .to_owned(),
    );

    let response = server.final_response().await;
    assert_eq!(code(&response), Code::OK);

    let allow = header(&response, "Allow").unwrap();
    for method in ["INVITE", "MESSAGE", "OPTIONS", "NOTIFY"] {
        assert!(allow.contains(method), "{method} missing in {allow}");
    }
    assert_eq!(header(&response, "Accept").as_deref(), Some("application/sdp"));
    assert!(header(&response, "To").unwrap().contains("tag="));
}

#[tokio::test(start_paused = true)]
async fn outgoing_message_with_preloaded_route() {
    let (ua, mut server) = user_agent(Config {
        register: false,
        use_preloaded_route: true,
        ws_servers: vec![WsServer::new("wss://edge.example.com:8443/ws")],
        ..config()
    });

    settle().await;

    let context = ua
        .message("bob", "hi bob", RequestOptions::default())
        .unwrap();

    let message = server.request(Method::MESSAGE).await;
    assert_eq!(
        message.line.to_string().trim_end(),
        "MESSAGE sip:bob@example.com SIP/2.0"
    );
    assert_eq!(
        header(&message, "Route").as_deref(),
        Some("<sip:edge.example.com:8443;transport=ws;lr>")
    );
    assert_eq!(header(&message, "Content-Type").as_deref(), Some("text/plain"));
    assert_eq!(&message.body[..], b"hi bob");

    server.respond(&message, 202, &[]);

    assert!(matches!(
        context.outcome().await,
        ContextEvent::Accepted {
            code: Code::ACCEPTED,
            ..
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn invalid_targets_and_configuration() {
    let (ua, _server) = user_agent(Config {
        autostart: false,
        ..config()
    });

    assert!(matches!(
        ua.message("", "text", RequestOptions::default()),
        Err(Error::Ua(sip_ua::Error::InvalidTarget(_)))
    ));
    assert!(matches!(
        ua.message("bob@exa mple.com", "text", RequestOptions::default()),
        Err(Error::Ua(sip_ua::Error::InvalidTarget(_)))
    ));

    let (connector, _remote) = memory_transport();
    let result = UserAgent::new(
        Config::new("sip:example.com"),
        Arc::new(connector),
        StaticMedia::factory(SDP),
    );
    assert!(matches!(result, Err(Error::Config(_))));
}

#[tokio::test(start_paused = true)]
async fn subscribe_through_user_agent() {
    let (ua, mut server) = user_agent(Config {
        register: false,
        ..config()
    });

    settle().await;

    let subscription = ua
        .subscribe(
            "sip:bob@example.com",
            Event::new("presence"),
            SubscribeOptions::default(),
        )
        .unwrap();

    let subscribe = server.request(Method::SUBSCRIBE).await;
    assert_eq!(header(&subscribe, "Event").as_deref(), Some("presence"));
    assert_eq!(header(&subscribe, "Expires").as_deref(), Some("3600"));

    server.respond(&subscribe, 489, &[]);

    subscription.terminated().await;
    assert_eq!(subscription.error_codes(), [Code::BAD_EVENT]);
}

#[tokio::test(start_paused = true)]
async fn stop_rejects_pending_incoming_session() {
    let (ua, mut server) = user_agent(Config {
        register: false,
        ..config()
    });
    let mut events = ua.events().subscribe();

    assert!(matches!(
        next_event(&mut events).await,
        UaEvent::Connected { .. }
    ));

    server.send(format!(
        "INVITE sip:alice@example.com SIP/2.0\r\n\
         Via: SIP/2.0/WSS edge.example.com;branch=z9hG4bKinvite\r\n\
         From: <sip:bob@example.com>;tag=bob-tag\r\n\
         To: <sip:alice@example.com>\r\n\
         Call-ID: invite-1\r\n\
         CSeq: 1 INVITE\r\n\
         Contact: <sip:bob@192.0.2.10;transport=ws>\r\n\
         Max-Forwards: 70\r\n\
         Content-Type: application/sdp\r\n\
         Content-Length: {}\r\n\r\n{SDP}",
        SDP.len()
    ));

    let UaEvent::Invite(session) = next_event(&mut events).await else {
        panic!("expected an incoming session");
    };

    let stop = tokio::spawn({
        let ua = ua.clone();
        async move { ua.stop().await }
    });

    let response = server.final_response().await;
    assert_eq!(code(&response), Code::TEMPORARILY_UNAVAILABLE);

    stop.await.unwrap();

    assert_eq!(session.state(), SessionState::Terminated);
    assert!(!ua.is_connected());
}
