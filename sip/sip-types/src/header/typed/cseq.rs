use crate::Name;
use crate::header::{ConstNamed, ExtendValues, HeaderParse, OneOrMore};
use crate::method::Method;
use crate::parse::Parse;
use bytes::Bytes;
use internal::{IResult, ws};
use nom::character::complete::digit1;
use nom::combinator::{map, map_res};
use std::fmt;
use std::str::FromStr;

/// `CSeq` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CSeq {
    pub cseq: u32,
    pub method: Method,
}

impl CSeq {
    #[inline]
    pub const fn new(cseq: u32, method: Method) -> CSeq {
        CSeq { cseq, method }
    }
}

impl ConstNamed for CSeq {
    const NAME: Name = Name::CSEQ;
}

impl HeaderParse for CSeq {
    fn parse<'i>(src: &'i Bytes, i: &'i str) -> IResult<&'i str, Self> {
        map(
            ws((map_res(digit1, u32::from_str), Method::parse(src))),
            |(cseq, method)| CSeq { cseq, method },
        )(i)
    }
}

impl ExtendValues for CSeq {
    fn extend_values(&self, values: &mut OneOrMore) {
        *values = self.create_values()
    }

    fn create_values(&self) -> OneOrMore {
        OneOrMore::One(self.to_string().into())
    }
}

impl fmt::Display for CSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.cseq, self.method)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Headers;

    const CSEQ: CSeq = CSeq::new(314159, Method::INVITE);

    #[test]
    fn print_cseq() {
        let mut headers = Headers::new();
        headers.insert_named(&CSEQ);

        assert_eq!(headers.to_string(), "CSeq: 314159 INVITE\r\n");
    }

    #[test]
    fn parse_cseq() {
        let mut headers = Headers::new();
        headers.insert(Name::CSEQ, "314159   invite");

        let cseq: CSeq = headers.get_named().unwrap();
        assert_eq!(cseq, CSEQ);
    }

    #[test]
    fn cseq_overflow_is_malformed() {
        let mut headers = Headers::new();
        headers.insert(Name::CSEQ, "99999999999 BYE");

        assert!(headers.get_named::<CSeq>().is_err());
    }
}
