//! Typed representations of the headers the user agent reads and writes

mod auth;
mod call_id;
mod contact;
mod content;
mod cseq;
mod event;
mod from_to;
mod prack;
mod refer_to;
mod replaces;
mod routing;
mod subscription_state;
mod via;

pub use auth::{
    Algorithm, AuthChallenge, AuthParam, AuthResponse, DigestChallenge, DigestResponse, QopOption,
    QopResponse,
};
pub use call_id::CallID;
pub use contact::Contact;
pub use content::{ContentLength, ContentType};
pub use cseq::CSeq;
pub use event::{AllowEvents, Event};
pub use from_to::FromTo;
pub use prack::{RAck, RSeq};
pub use refer_to::ReferTo;
pub use replaces::Replaces;
pub use routing::Routing;
pub use subscription_state::{EventReason, SubState, SubscriptionState};
pub use via::Via;

use crate::Method;
use crate::Name;
use bytesstr::BytesStr;

csv_header!(
    /// `Allow` header, one method per value
    Allow,
    Method,
    Name::ALLOW
);

csv_header!(
    /// `Supported` header, one option tag per value
    Supported,
    BytesStr,
    Name::SUPPORTED
);

csv_header!(
    /// `Require` header
    Require,
    BytesStr,
    Name::REQUIRE
);

csv_header!(
    /// `Unsupported` header
    Unsupported,
    BytesStr,
    Name::UNSUPPORTED
);

number_header!(
    /// `Expires` header, in seconds
    Expires,
    Name::EXPIRES,
    u32
);

number_header!(
    /// `Min-Expires` header, sent by registrars with `423 Interval Too Brief`
    MinExpires,
    Name::MIN_EXPIRES,
    u32
);

number_header!(
    /// `Max-Forwards` header
    MaxForwards,
    Name::MAX_FORWARDS,
    u32
);

#[cfg(test)]
mod test {
    use super::*;
    use crate::Headers;

    #[test]
    fn allow_csv() {
        let mut headers = Headers::new();
        headers.insert_named(&vec![
            Allow(Method::INVITE),
            Allow(Method::ACK),
            Allow(Method::BYE),
        ]);

        assert_eq!(headers.to_string(), "Allow: INVITE, ACK, BYE\r\n");

        let allow: Vec<Allow> = headers.get_named().unwrap();
        assert_eq!(
            allow,
            vec![Allow(Method::INVITE), Allow(Method::ACK), Allow(Method::BYE)]
        );
    }

    #[test]
    fn supported_from_multiple_values() {
        let mut headers = Headers::new();
        headers.insert(Name::SUPPORTED, "100rel, path");
        headers.insert("k", "outbound");

        let supported: Vec<Supported> = headers.get_named().unwrap();
        assert_eq!(supported.len(), 3);
        assert!(supported.contains(&Supported("outbound".into())));
        assert_eq!(supported[0].0, "100rel");
    }

    #[test]
    fn expires_replaces_existing() {
        let mut headers = Headers::new();
        headers.insert_named(&Expires(600));
        headers.insert_named(&Expires(0));

        assert_eq!(headers.to_string(), "Expires: 0\r\n");
        assert_eq!(headers.get_named::<Expires>().unwrap(), Expires(0));
    }

    #[test]
    fn number_header_whitespace() {
        let mut headers = Headers::new();
        headers.insert(Name::MAX_FORWARDS, "  70 ");

        assert_eq!(headers.get_named::<MaxForwards>().unwrap(), MaxForwards(70));
    }

    #[test]
    fn number_header_rejects_text() {
        let mut headers = Headers::new();
        headers.insert(Name::MIN_EXPIRES, "soon");

        assert!(headers.get_named::<MinExpires>().is_err());
    }
}
