use crate::header::{ExtendValues, HeaderParse, OneOrMore, extend_csv};
use crate::parse::Parse;
use crate::print::UriContext;
use crate::uri::NameAddr;
use bytes::Bytes;
use internal::IResult;
use nom::combinator::map;
use std::fmt;

/// Value of the `Route` and `Record-Route` headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routing {
    pub addr: NameAddr,
}

impl Routing {
    #[inline]
    pub fn new(addr: NameAddr) -> Self {
        Self { addr }
    }

    /// Loose routing (`lr` URI parameter) is used by the proxy
    pub fn is_loose(&self) -> bool {
        self.addr.uri.has_param("lr")
    }
}

impl HeaderParse for Routing {
    fn parse<'i>(src: &'i Bytes, i: &'i str) -> IResult<&'i str, Self> {
        map(NameAddr::parse(src), Routing::new)(i)
    }
}

impl ExtendValues for Routing {
    fn extend_values(&self, values: &mut OneOrMore) {
        extend_csv(values, self)
    }

    fn create_values(&self) -> OneOrMore {
        OneOrMore::One(self.to_string().into())
    }
}

impl fmt::Display for Routing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr.in_context(UriContext::Routing))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::uri::SipUri;
    use crate::{Headers, Name};

    fn proxy(host: &str) -> Routing {
        let uri: SipUri = format!("sip:{host};lr").parse().unwrap();

        Routing::new(NameAddr::uri(uri))
    }

    #[test]
    fn print_routing_vec() {
        let mut headers = Headers::new();
        headers.insert_type(Name::ROUTE, &vec![proxy("p1.example"), proxy("p2.example")]);

        assert_eq!(
            headers.to_string(),
            "Route: <sip:p1.example;lr>, <sip:p2.example;lr>\r\n"
        );
    }

    #[test]
    fn parse_record_route_keeps_order() {
        let mut headers = Headers::new();
        headers.insert(Name::RECORD_ROUTE, "<sip:p1.example;lr>, <sip:p2.example;lr>");
        headers.insert(Name::RECORD_ROUTE, "<sip:p3.example;lr>");

        let routes: Vec<Routing> = headers.get(Name::RECORD_ROUTE).unwrap();

        assert_eq!(
            routes,
            vec![proxy("p1.example"), proxy("p2.example"), proxy("p3.example")]
        );
        assert!(routes.iter().all(Routing::is_loose));
    }
}
