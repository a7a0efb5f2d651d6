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

number_header!(
    /// `RSeq` header of a reliable provisional response
    RSeq,
    Name::RSEQ,
    u32
);

/// `RAck` header, acknowledges a reliable provisional response in a PRACK
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RAck {
    pub rack: u32,
    pub cseq: u32,
    pub method: Method,
}

impl RAck {
    #[inline]
    pub const fn new(rack: u32, cseq: u32, method: Method) -> RAck {
        RAck { rack, cseq, method }
    }
}

impl ConstNamed for RAck {
    const NAME: Name = Name::RACK;
}

impl HeaderParse for RAck {
    fn parse<'i>(src: &'i Bytes, i: &'i str) -> IResult<&'i str, Self> {
        map(
            ws((
                map_res(digit1, u32::from_str),
                map_res(digit1, u32::from_str),
                Method::parse(src),
            )),
            |(rack, cseq, method)| RAck { rack, cseq, method },
        )(i)
    }
}

impl ExtendValues for RAck {
    fn extend_values(&self, values: &mut OneOrMore) {
        *values = self.create_values()
    }

    fn create_values(&self) -> OneOrMore {
        OneOrMore::One(self.to_string().into())
    }
}

impl fmt::Display for RAck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.rack, self.cseq, self.method)
    }
}
