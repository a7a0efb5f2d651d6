use crate::Name;
use crate::header::{ConstNamed, ExtendValues, HeaderParse, OneOrMore};
use crate::parse::Parse;
use crate::uri::NameAddr;
use bytes::Bytes;
use internal::IResult;
use nom::combinator::map;
use std::fmt;

/// `Refer-To` header, see [RFC 3515](https://www.rfc-editor.org/rfc/rfc3515#section-2.1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferTo {
    pub addr: NameAddr,
}

impl ConstNamed for ReferTo {
    const NAME: Name = Name::REFER_TO;
}

impl HeaderParse for ReferTo {
    fn parse<'i>(src: &'i Bytes, i: &'i str) -> IResult<&'i str, Self> {
        map(NameAddr::parse(src), |addr| ReferTo { addr })(i)
    }
}

impl ExtendValues for ReferTo {
    fn extend_values(&self, values: &mut OneOrMore) {
        *values = self.create_values()
    }

    fn create_values(&self) -> OneOrMore {
        OneOrMore::One(self.to_string().into())
    }
}

impl fmt::Display for ReferTo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Refer-To may carry URI headers (e.g. Replaces), print everything
        fmt::Display::fmt(&self.addr, f)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Headers;

    #[test]
    fn refer_to_keeps_uri_headers() {
        let mut headers = Headers::new();
        headers.insert("r", "<sip:carol@chicago.example?Replaces=abc%40host>");

        let refer_to: ReferTo = headers.get_named().unwrap();

        assert_eq!(
            refer_to.addr.uri.get_header("replaces").unwrap(),
            vec!["abc@host"]
        );
        assert_eq!(
            refer_to.to_string(),
            "<sip:carol@chicago.example?Replaces=abc%40host>"
        );
    }
}
