use crate::Name;
use crate::header::{ConstNamed, ExtendValues, HeaderParse, OneOrMore};
use bytes::Bytes;
use bytesstr::BytesStr;
use internal::{IResult, rest};
use nom::combinator::{map, verify};
use std::fmt;

/// `Call-ID` header
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CallID(pub BytesStr);

impl CallID {
    pub fn new<B>(id: B) -> Self
    where
        B: Into<BytesStr>,
    {
        CallID(id.into())
    }
}

impl ConstNamed for CallID {
    const NAME: Name = Name::CALL_ID;
}

impl HeaderParse for CallID {
    fn parse<'i>(src: &'i Bytes, i: &'i str) -> IResult<&'i str, Self> {
        map(verify(rest(), |i: &str| !i.trim().is_empty()), |i: &str| {
            Self(BytesStr::from_parse(src, i.trim()))
        })(i)
    }
}

impl ExtendValues for CallID {
    fn extend_values(&self, values: &mut OneOrMore) {
        *values = self.create_values()
    }

    fn create_values(&self) -> OneOrMore {
        OneOrMore::One(self.0.clone())
    }
}

impl fmt::Display for CallID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Headers;

    const CALL_ID: CallID = CallID(BytesStr::from_static("a84b4c76e66710"));

    #[test]
    fn print_call_id() {
        let mut headers = Headers::new();
        headers.insert_named(&CALL_ID);

        assert_eq!(headers.to_string(), "Call-ID: a84b4c76e66710\r\n");
    }

    #[test]
    fn parse_compact_call_id() {
        let mut headers = Headers::new();
        headers.insert("i", " a84b4c76e66710 ");

        let call_id: CallID = headers.get_named().unwrap();
        assert_eq!(call_id, CALL_ID);
    }

    #[test]
    fn empty_call_id_is_malformed() {
        let mut headers = Headers::new();
        headers.insert(Name::CALL_ID, "  ");

        assert!(headers.get_named::<CallID>().is_err());
    }
}
