use crate::logging::LogConfig;
use crate::{Error, Result};
use serde::{Deserialize, Deserializer};
use sip_auth::DigestUser;
use sip_core::transaction::Timers;
use sip_core::transport::InteropFlags;
use sip_types::host::HostPort;
use sip_types::uri::{NameAddr, SipUri};
use sip_ua::{DtmfType, Support};
use std::time::Duration;

const DEFAULT_WS_SERVER: &str = "wss://edge.sip.onsip.com";

/// A WebSocket server the user agent may connect to
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsServer {
    #[serde(alias = "ws_uri")]
    pub ws_uri: String,

    /// Servers with a higher weight are tried first
    #[serde(default)]
    pub weight: u32,
}

impl WsServer {
    pub fn new(ws_uri: impl Into<String>) -> Self {
        Self {
            ws_uri: ws_uri.into(),
            weight: 0,
        }
    }
}

/// User agent configuration.
///
/// Deserializes from the camelCase option names (e.g. `wsServers`, `registerExpires`),
/// unknown options are ignored.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Address of record, e.g. `sip:alice@example.com`
    pub uri: String,
    pub display_name: Option<String>,

    #[serde(deserialize_with = "ws_servers")]
    pub ws_servers: Vec<WsServer>,

    /// Defaults to the user part of `uri`
    pub authorization_user: Option<String>,
    pub password: Option<String>,

    /// Register when the transport connects for the first time
    pub register: bool,
    /// Seconds
    pub register_expires: u32,
    /// Defaults to the domain of `uri`
    pub registrar_server: Option<String>,

    /// Seconds
    pub connection_recovery_min_interval: u64,
    /// Seconds
    pub connection_recovery_max_interval: u64,
    pub ws_server_max_reconnection: u32,
    /// Seconds
    pub ws_server_reconnection_timeout: u64,

    /// Seconds
    pub no_answer_timeout: u64,
    /// Milliseconds
    pub ice_checking_timeout: u64,

    #[serde(deserialize_with = "one_or_many")]
    pub stun_servers: Vec<String>,
    #[serde(deserialize_with = "one_or_many")]
    pub turn_servers: Vec<String>,

    pub user_agent_string: Option<String>,
    pub trace_sip: bool,
    /// Call [`UserAgent::start`](crate::UserAgent::start) on construction
    pub autostart: bool,

    pub rel100: Support,
    /// Accept INVITEs carrying a Replaces header
    pub replaces: Support,
    pub dtmf_type: DtmfType,
    pub use_preloaded_route: bool,

    /// Sent as `+sip.instance` in the Contact
    pub instance_id: Option<String>,

    pub hack_via_tcp: bool,
    pub hack_ip_in_contact: bool,
    pub hack_wss_in_transport: bool,
    pub hack_strip_tcp: bool,
    /// Remove `a=imageattr` lines from remote descriptions before they reach the media handler
    pub hack_clean_jitsi_sdp_imageattr: bool,

    pub allow_legacy_notifications: bool,

    pub log: LogConfig,

    /// Milliseconds
    pub timer_t1: Option<u64>,
    /// Milliseconds
    pub timer_t2: Option<u64>,
    /// Milliseconds
    pub timer_t4: Option<u64>,
    /// Milliseconds, INVITE Proceeding guard
    pub timer_c: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            uri: String::new(),
            display_name: None,
            ws_servers: vec![WsServer::new(DEFAULT_WS_SERVER)],
            authorization_user: None,
            password: None,
            register: true,
            register_expires: 600,
            registrar_server: None,
            connection_recovery_min_interval: 2,
            connection_recovery_max_interval: 30,
            ws_server_max_reconnection: 3,
            ws_server_reconnection_timeout: 4,
            no_answer_timeout: 60,
            ice_checking_timeout: 5000,
            stun_servers: vec![],
            turn_servers: vec![],
            user_agent_string: None,
            trace_sip: false,
            autostart: true,
            rel100: Support::None,
            replaces: Support::None,
            dtmf_type: DtmfType::Info,
            use_preloaded_route: false,
            instance_id: None,
            hack_via_tcp: false,
            hack_ip_in_contact: false,
            hack_wss_in_transport: false,
            hack_strip_tcp: false,
            hack_clean_jitsi_sdp_imageattr: false,
            allow_legacy_notifications: false,
            log: LogConfig::default(),
            timer_t1: None,
            timer_t2: None,
            timer_t4: None,
            timer_c: None,
        }
    }
}

impl Config {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            ..Self::default()
        }
    }

    /// Parse and validate a JSON configuration
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Config =
            serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;

        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.identity_uri()?;

        if self.ws_servers.is_empty() {
            return Err(Error::Config("no WebSocket server configured".into()));
        }

        for server in &self.ws_servers {
            if !(server.ws_uri.starts_with("ws://") || server.ws_uri.starts_with("wss://")) {
                return Err(Error::Config(format!(
                    "invalid WebSocket server {:?}",
                    server.ws_uri
                )));
            }
        }

        if self.connection_recovery_min_interval > self.connection_recovery_max_interval {
            return Err(Error::Config(
                "connectionRecoveryMinInterval is greater than connectionRecoveryMaxInterval"
                    .into(),
            ));
        }

        if self.register_expires == 0 {
            return Err(Error::Config("registerExpires must be positive".into()));
        }

        if let Some(registrar) = &self.registrar_server {
            parse_uri(registrar, "registrarServer")?;
        }

        Ok(())
    }

    pub(crate) fn identity_uri(&self) -> Result<SipUri> {
        let uri = parse_uri(&self.uri, "uri")?;

        if uri.user.is_none() {
            return Err(Error::Config(format!("uri {:?} has no user part", self.uri)));
        }

        Ok(uri)
    }

    pub(crate) fn identity(&self) -> Result<NameAddr> {
        Ok(NameAddr::new(
            self.display_name.clone(),
            self.identity_uri()?,
        ))
    }

    /// Explicit registrar or `sip:` + the domain of the identity
    pub(crate) fn registrar(&self) -> Result<SipUri> {
        match &self.registrar_server {
            Some(registrar) => parse_uri(registrar, "registrarServer"),
            None => Ok(SipUri::new(self.identity_uri()?.host_port)),
        }
    }

    pub(crate) fn domain(&self) -> Result<HostPort> {
        Ok(self.identity_uri()?.host_port)
    }

    pub(crate) fn credentials(&self) -> Result<Option<DigestUser>> {
        let Some(password) = &self.password else {
            return Ok(None);
        };

        let user = match &self.authorization_user {
            Some(user) => user.clone(),
            None => self
                .identity_uri()?
                .user
                .map(|user| user.to_string())
                .unwrap_or_default(),
        };

        Ok(Some(DigestUser::new(user, password.as_bytes())))
    }

    pub(crate) fn timers(&self) -> Timers {
        let defaults = Timers::default();

        Timers {
            t1: self.timer_t1.map(Duration::from_millis).unwrap_or(defaults.t1),
            t2: self.timer_t2.map(Duration::from_millis).unwrap_or(defaults.t2),
            t4: self.timer_t4.map(Duration::from_millis).unwrap_or(defaults.t4),
            c: self.timer_c.map(Duration::from_millis).unwrap_or(defaults.c),
        }
    }

    pub(crate) fn interop_flags(&self) -> InteropFlags {
        InteropFlags {
            via_tcp: self.hack_via_tcp,
            ip_in_contact: self.hack_ip_in_contact,
            wss_in_transport: self.hack_wss_in_transport,
            strip_tcp: self.hack_strip_tcp,
        }
    }

    /// Servers in the order they are tried, highest weight first
    pub(crate) fn servers_by_weight(&self) -> Vec<WsServer> {
        let mut servers = self.ws_servers.clone();
        servers.sort_by(|a, b| b.weight.cmp(&a.weight));
        servers
    }
}

fn parse_uri(uri: &str, option: &str) -> Result<SipUri> {
    let with_scheme = if uri.starts_with("sip:") || uri.starts_with("sips:") {
        uri.to_owned()
    } else {
        format!("sip:{uri}")
    };

    with_scheme
        .parse()
        .map_err(|e| Error::Config(format!("invalid {option} {uri:?}, {e}")))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> From<OneOrMany<T>> for Vec<T> {
    fn from(value: OneOrMany<T>) -> Self {
        match value {
            OneOrMany::One(value) => vec![value],
            OneOrMany::Many(values) => values,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WsServerEntry {
    Uri(String),
    Server(WsServer),
}

fn ws_servers<'de, D>(deserializer: D) -> Result<Vec<WsServer>, D::Error>
where
    D: Deserializer<'de>,
{
    let entries: Vec<WsServerEntry> = OneOrMany::deserialize(deserializer)?.into();

    Ok(entries
        .into_iter()
        .map(|entry| match entry {
            WsServerEntry::Uri(uri) => WsServer::new(uri),
            WsServerEntry::Server(server) => server,
        })
        .collect())
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(OneOrMany::deserialize(deserializer)?.into())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::from_json(r#"{"uri": "sip:alice@example.com"}"#).unwrap();

        assert_eq!(config.ws_servers, vec![WsServer::new("wss://edge.sip.onsip.com")]);
        assert!(config.register);
        assert_eq!(config.register_expires, 600);
        assert_eq!(config.connection_recovery_min_interval, 2);
        assert_eq!(config.connection_recovery_max_interval, 30);
        assert_eq!(config.ws_server_max_reconnection, 3);
        assert_eq!(config.no_answer_timeout, 60);
        assert_eq!(config.ice_checking_timeout, 5000);
        assert_eq!(config.rel100, Support::None);
        assert_eq!(config.replaces, Support::None);
        assert_eq!(config.dtmf_type, DtmfType::Info);
        assert!(config.autostart);
        assert_eq!(config.timers(), Timers::default());
    }

    #[test]
    fn option_names() {
        let config = Config::from_json(
            r#"{
                "uri": "alice@example.com",
                "displayName": "Alice",
                "wsServers": [
                    "wss://a.example.com",
                    {"ws_uri": "wss://b.example.com", "weight": 10},
                    {"wsUri": "ws://c.example.com", "weight": 5}
                ],
                "authorizationUser": "alice-auth",
                "password": "secret",
                "registerExpires": 300,
                "stunServers": "stun:stun.example.com",
                "rel100": "required",
                "replaces": "supported",
                "dtmfType": "rtp",
                "hackViaTcp": true,
                "timerT1": 250,
                "timerC": 90000,
                "log": {"builtinEnabled": false, "level": 0},
                "somethingUnknown": [1, 2, 3]
            }"#,
        )
        .unwrap();

        assert_eq!(config.display_name.as_deref(), Some("Alice"));
        assert_eq!(config.register_expires, 300);
        assert_eq!(config.stun_servers, vec!["stun:stun.example.com"]);
        assert_eq!(config.rel100, Support::Required);
        assert_eq!(config.replaces, Support::Supported);
        assert_eq!(config.dtmf_type, DtmfType::Rtp);
        assert!(config.interop_flags().via_tcp);
        assert_eq!(config.timers().t1, Duration::from_millis(250));
        assert_eq!(config.timers().timer_d(), Duration::from_secs(16));
        assert_eq!(config.timers().c, Duration::from_secs(90));
        assert!(!config.log.builtin_enabled);

        let order: Vec<String> = config
            .servers_by_weight()
            .into_iter()
            .map(|server| server.ws_uri)
            .collect();
        assert_eq!(
            order,
            ["wss://b.example.com", "ws://c.example.com", "wss://a.example.com"]
        );

        assert_eq!(config.identity_uri().unwrap().to_string(), "sip:alice@example.com");
        assert!(config.credentials().unwrap().is_some());
    }

    #[test]
    fn single_server_string() {
        let config = Config::from_json(
            r#"{"uri": "sip:alice@example.com", "wsServers": "ws://edge.example.com"}"#,
        )
        .unwrap();

        assert_eq!(config.ws_servers, vec![WsServer::new("ws://edge.example.com")]);
    }

    #[test]
    fn registrar_defaults_to_domain() {
        let config = Config::new("sip:alice@example.com:5080");

        assert_eq!(config.registrar().unwrap().to_string(), "sip:example.com:5080");

        let config = Config {
            registrar_server: Some("sip:registrar.example.com".into()),
            ..Config::new("sip:alice@example.com")
        };

        assert_eq!(
            config.registrar().unwrap().to_string(),
            "sip:registrar.example.com"
        );
    }

    #[test]
    fn invalid_configurations() {
        let invalid = [
            r#"{}"#,
            r#"{"uri": "sip:example.com"}"#,
            r#"{"uri": "sip:alice@example.com", "wsServers": "http://edge.example.com"}"#,
            r#"{"uri": "sip:alice@example.com", "wsServers": []}"#,
            r#"{"uri": "sip:alice@example.com", "registerExpires": 0}"#,
            r#"{"uri": "sip:alice@example.com", "connectionRecoveryMinInterval": 40}"#,
            r#"{"uri": "sip:alice@example.com", "rel100": "sometimes"}"#,
            r#"not json"#,
        ];

        for json in invalid {
            assert!(
                matches!(Config::from_json(json), Err(Error::Config(_))),
                "{json} was accepted"
            );
        }
    }
}
