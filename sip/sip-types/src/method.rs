use crate::parse::{Parse, token};
use bytes::Bytes;
use bytesstr::BytesStr;
use internal::IResult;
use nom::bytes::complete::take_while1;
use nom::combinator::map;
use std::fmt;

/// SIP request method
///
/// Known methods are available as constants, everything else is kept verbatim.
///
/// ```
/// use sipline_sip_types::Method;
///
/// assert_eq!(Method::from("invite"), Method::INVITE);
/// assert_eq!(Method::from("HELLO").as_str(), "HELLO");
/// ```
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Method(Repr);

macro_rules! methods {
    ($($print:literal, $ident:ident;)+) => {
        #[derive(Debug, Clone, Eq, PartialEq, Hash)]
        #[allow(clippy::upper_case_acronyms)]
        enum Repr {
            $($ident,)+
            Other(BytesStr),
        }

        impl Method {
            $(pub const $ident: Self = Self(Repr::$ident);)+

            pub fn from_parse(src: &Bytes, slice: &str) -> Self {
                $(
                if slice.eq_ignore_ascii_case($print) {
                    return Self(Repr::$ident);
                }
                )+

                Self(Repr::Other(BytesStr::from_parse(src, slice)))
            }

            pub fn as_str(&self) -> &str {
                match &self.0 {
                    $(Repr::$ident => $print,)+
                    Repr::Other(other) => other.as_str(),
                }
            }
        }
    };
}

methods! {
    "INVITE",    INVITE;
    "ACK",       ACK;
    "CANCEL",    CANCEL;
    "BYE",       BYE;
    "REGISTER",  REGISTER;
    "MESSAGE",   MESSAGE;
    "UPDATE",    UPDATE;
    "PRACK",     PRACK;
    "OPTIONS",   OPTIONS;
    "SUBSCRIBE", SUBSCRIBE;
    "NOTIFY",    NOTIFY;
    "PUBLISH",   PUBLISH;
    "INFO",      INFO;
    "REFER",     REFER;
}

impl Method {
    /// Returns true for INVITE and ACK, which need special handling in the transaction layer
    pub fn is_invite_or_ack(&self) -> bool {
        matches!(self.0, Repr::INVITE | Repr::ACK)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Parse for Method {
    fn parse(src: &Bytes) -> impl Fn(&str) -> IResult<&str, Self> + '_ {
        move |i| map(take_while1(token), |slice| Self::from_parse(src, slice))(i)
    }
}
impl_from_str!(Method, "method");

impl From<&str> for Method {
    fn from(s: &str) -> Self {
        let s = BytesStr::from(s);

        Self::from_parse(s.as_ref(), s.as_str())
    }
}
