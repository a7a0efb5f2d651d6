use crate::Name;
use crate::header::{ConstNamed, ExtendValues, HeaderParse, OneOrMore, extend_csv};
use crate::parse::Parse;
use crate::print::UriContext;
use crate::uri::NameAddr;
use bytes::Bytes;
use internal::IResult;
use nom::combinator::map;
use std::fmt;

/// `Contact` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub addr: NameAddr,
}

impl Contact {
    #[inline]
    pub fn new(addr: NameAddr) -> Contact {
        Contact { addr }
    }

    /// The `expires` parameter, when present and numeric
    pub fn expires(&self) -> Option<u32> {
        self.addr.get_param("expires")?.parse().ok()
    }

    pub fn with_expires(mut self, expires: u32) -> Self {
        self.addr.set_param("expires", Some(&expires.to_string()));
        self
    }
}

impl ConstNamed for Contact {
    const NAME: Name = Name::CONTACT;
}

impl HeaderParse for Contact {
    fn parse<'i>(src: &'i Bytes, i: &'i str) -> IResult<&'i str, Self> {
        map(NameAddr::parse(src), Contact::new)(i)
    }
}

impl ExtendValues for Contact {
    fn extend_values(&self, values: &mut OneOrMore) {
        extend_csv(values, self)
    }

    fn create_values(&self) -> OneOrMore {
        OneOrMore::One(self.to_string().into())
    }
}

impl fmt::Display for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr.in_context(UriContext::Contact))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Headers;
    use crate::uri::SipUri;

    fn contact() -> Contact {
        let uri: SipUri = "sip:alice@192.0.2.4;transport=ws".parse().unwrap();

        Contact::new(NameAddr::uri(uri))
    }

    #[test]
    fn print_contact_multiple_insert() {
        let mut headers = Headers::new();
        headers.insert_named(&contact());
        headers.insert_named(&contact().with_expires(60));

        assert_eq!(
            headers.to_string(),
            "Contact: <sip:alice@192.0.2.4;transport=ws>, <sip:alice@192.0.2.4;transport=ws>;expires=60\r\n"
        );
    }

    #[test]
    fn parse_multiple_with_expires() {
        let mut headers = Headers::new();
        headers.insert(
            Name::CONTACT,
            "<sip:alice@192.0.2.4;transport=ws>;expires=3600, <sip:alice@10.0.0.1>;expires=0",
        );

        let contacts: Vec<Contact> = headers.get_named().unwrap();

        assert_eq!(contacts.len(), 2);
        assert_eq!(contacts[0].addr.uri, contact().addr.uri);
        assert_eq!(contacts[0].expires(), Some(3600));
        assert_eq!(contacts[1].expires(), Some(0));
    }

    #[test]
    fn missing_expires() {
        assert_eq!(contact().expires(), None);
    }
}
