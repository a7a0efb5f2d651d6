use crate::Name;
use crate::header::{ConstNamed, ExtendValues, HeaderParse, OneOrMore};
use crate::parse::token;
use crate::uri::params::{GPS, Params};
use bytes::Bytes;
use bytesstr::BytesStr;
use internal::{IResult, ws};
use nom::bytes::complete::take_while1;
use nom::combinator::map;
use nom::sequence::tuple;
use std::fmt;

/// `Event` header of SUBSCRIBE and NOTIFY requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub package: BytesStr,
    pub id: Option<BytesStr>,
    pub params: Params<GPS>,
}

impl Event {
    pub fn new<B>(package: B) -> Self
    where
        B: Into<BytesStr>,
    {
        Event {
            package: package.into(),
            id: None,
            params: Params::new(),
        }
    }

    pub fn with_id<B: Into<BytesStr>>(mut self, id: B) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Same event package and id, as used to match a NOTIFY to its subscription
    pub fn matches(&self, other: &Event) -> bool {
        self.package.eq_ignore_ascii_case(&other.package) && self.id == other.id
    }
}

impl ConstNamed for Event {
    const NAME: Name = Name::EVENT;
}

impl HeaderParse for Event {
    fn parse<'i>(src: &'i Bytes, i: &'i str) -> IResult<&'i str, Self> {
        map(
            tuple((ws((take_while1(token),)), Params::<GPS>::parse(src))),
            |((package,), mut params)| Event {
                package: BytesStr::from_parse(src, package),
                id: params.take("id"),
                params,
            },
        )(i)
    }
}

impl ExtendValues for Event {
    fn extend_values(&self, values: &mut OneOrMore) {
        *values = self.create_values()
    }

    fn create_values(&self) -> OneOrMore {
        OneOrMore::One(self.to_string().into())
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.package)?;

        if let Some(id) = &self.id {
            write!(f, ";id={id}")?;
        }

        write!(f, "{}", self.params)
    }
}

csv_header!(
    /// `Allow-Events` header
    AllowEvents,
    BytesStr,
    Name::ALLOW_EVENTS
);

#[cfg(test)]
mod test {
    use super::*;
    use crate::Headers;

    #[test]
    fn print_event_with_id() {
        let mut headers = Headers::new();
        headers.insert_named(&Event::new("presence").with_id("42"));

        assert_eq!(headers.to_string(), "Event: presence;id=42\r\n");
    }

    #[test]
    fn parse_compact_event() {
        let mut headers = Headers::new();
        headers.insert("o", "dialog ;id=a;call-id=xyz");

        let event: Event = headers.get_named().unwrap();

        assert_eq!(event.package, "dialog");
        assert_eq!(event.id.as_ref().unwrap(), "a");
        assert_eq!(event.params.get_val("call-id").unwrap(), "xyz");
        assert!(event.matches(&Event::new("Dialog").with_id("a")));
        assert!(!event.matches(&Event::new("dialog")));
    }

    #[test]
    fn allow_events() {
        let mut headers = Headers::new();
        headers.insert(Name::ALLOW_EVENTS, "presence, dialog");

        let events: Vec<AllowEvents> = headers.get_named().unwrap();
        assert_eq!(events[1].0, "dialog");
    }
}
