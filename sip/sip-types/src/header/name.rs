use bytesstr::BytesStr;
use std::fmt;

/// Name of a SIP header, used as key inside [`Headers`](crate::Headers)
///
/// Comparison is case-insensitive and treats compact forms (`v`, `f`, `m`, ...)
/// as equal to their long form.
#[derive(Debug, Clone)]
pub struct Name(Repr);

impl Name {
    /// Name that is not known to this crate. Returned by parsers for any unknown header.
    pub const fn unknown(name: BytesStr) -> Self {
        Self(Repr::Unknown(name))
    }

    fn matches(&self, other: &str) -> bool {
        self.as_print_str().eq_ignore_ascii_case(other)
            || self
                .compact()
                .is_some_and(|compact| compact.eq_ignore_ascii_case(other))
    }
}

impl PartialEq for Name {
    fn eq(&self, other: &Self) -> bool {
        match (&self.0, &other.0) {
            (Repr::Unknown(a), Repr::Unknown(b)) => a.eq_ignore_ascii_case(b),
            (Repr::Unknown(a), _) => other.matches(a),
            (_, Repr::Unknown(b)) => self.matches(b),
            (a, b) => std::mem::discriminant(a) == std::mem::discriminant(b),
        }
    }
}

impl Eq for Name {}

impl PartialEq<str> for Name {
    fn eq(&self, other: &str) -> bool {
        self.matches(other)
    }
}

impl PartialEq<&str> for Name {
    fn eq(&self, other: &&str) -> bool {
        self.matches(other)
    }
}

impl<T> From<T> for Name
where
    T: Into<BytesStr> + AsRef<str>,
{
    fn from(name: T) -> Self {
        Name::from_str_value(name)
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_print_str())
    }
}

macro_rules! header_names {
    ($($print:literal, $ident:ident, $compact:expr, $konst:ident;)+) => {
        #[derive(Debug, Clone)]
        enum Repr {
            $($ident,)+
            Unknown(BytesStr),
        }

        static NAMES: &[Name] = &[$(Name::$konst,)+];

        impl Name {
            $(pub const $konst: Name = Name(Repr::$ident);)+

            fn from_str_value(name: impl Into<BytesStr> + AsRef<str>) -> Name {
                let slice = name.as_ref();

                NAMES
                    .iter()
                    .find(|known| known.matches(slice))
                    .cloned()
                    .unwrap_or_else(|| Name::unknown(name.into()))
            }

            pub fn as_print_str(&self) -> &str {
                match &self.0 {
                    $(Repr::$ident => $print,)+
                    Repr::Unknown(name) => name.as_str(),
                }
            }

            /// Compact form of the header name, if it has one
            pub const fn compact(&self) -> Option<&'static str> {
                match &self.0 {
                    $(Repr::$ident => $compact,)+
                    Repr::Unknown(_) => None,
                }
            }
        }
    };
}

header_names! {
    "Accept",              Accept,             None,      ACCEPT;
    "Allow",               Allow,              None,      ALLOW;
    "Allow-Events",        AllowEvents,        Some("u"), ALLOW_EVENTS;
    "Authorization",       Authorization,      None,      AUTHORIZATION;
    "Call-ID",             CallID,             Some("i"), CALL_ID;
    "Contact",             Contact,            Some("m"), CONTACT;
    "Content-Disposition", ContentDisposition, None,      CONTENT_DISPOSITION;
    "Content-Encoding",    ContentEncoding,    Some("e"), CONTENT_ENCODING;
    "Content-Length",      ContentLength,      Some("l"), CONTENT_LENGTH;
    "Content-Type",        ContentType,        Some("c"), CONTENT_TYPE;
    "CSeq",                CSeq,               None,      CSEQ;
    "Event",               Event,              Some("o"), EVENT;
    "Expires",             Expires,            None,      EXPIRES;
    "From",                From,               Some("f"), FROM;
    "Max-Forwards",        MaxForwards,        None,      MAX_FORWARDS;
    "Min-Expires",         MinExpires,         None,      MIN_EXPIRES;
    "P-Preferred-Identity", PPreferredIdentity, None,     P_PREFERRED_IDENTITY;
    "Privacy",             Privacy,            None,      PRIVACY;
    "Proxy-Authenticate",  ProxyAuthenticate,  None,      PROXY_AUTHENTICATE;
    "Proxy-Authorization", ProxyAuthorization, None,      PROXY_AUTHORIZATION;
    "RAck",                RAck,               None,      RACK;
    "Reason",              Reason,             None,      REASON;
    "Record-Route",        RecordRoute,        None,      RECORD_ROUTE;
    "Refer-To",            ReferTo,            Some("r"), REFER_TO;
    "Referred-By",         ReferredBy,         Some("b"), REFERRED_BY;
    "Replaces",            Replaces,           None,      REPLACES;
    "Require",             Require,            None,      REQUIRE;
    "Retry-After",         RetryAfter,         None,      RETRY_AFTER;
    "Route",               Route,              None,      ROUTE;
    "RSeq",                RSeq,               None,      RSEQ;
    "Server",              Server,             None,      SERVER;
    "Subject",             Subject,            Some("s"), SUBJECT;
    "Subscription-State",  SubscriptionState,  None,      SUBSCRIPTION_STATE;
    "Supported",           Supported,          Some("k"), SUPPORTED;
    "To",                  To,                 Some("t"), TO;
    "Unsupported",         Unsupported,        None,      UNSUPPORTED;
    "User-Agent",          UserAgent,          None,      USER_AGENT;
    "Via",                 Via,                Some("v"), VIA;
    "WWW-Authenticate",    WWWAuthenticate,    None,      WWW_AUTHENTICATE;
}
