use crate::header::{ExtendValues, HeaderParse, OneOrMore};
use crate::parse::Parse;
use crate::print::UriContext;
use crate::uri::NameAddr;
use bytes::Bytes;
use bytesstr::BytesStr;
use internal::IResult;
use nom::combinator::map;
use std::fmt;

/// Value of the `From` and `To` headers
///
/// The `tag` parameter is pulled out of the name-addr's parameters since it identifies the dialog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FromTo {
    pub addr: NameAddr,
    pub tag: Option<BytesStr>,
}

impl FromTo {
    pub fn new(addr: NameAddr, tag: Option<BytesStr>) -> Self {
        Self { addr, tag }
    }
}

impl HeaderParse for FromTo {
    fn parse<'i>(src: &'i Bytes, i: &'i str) -> IResult<&'i str, Self> {
        map(NameAddr::parse(src), |mut addr| FromTo {
            tag: addr.params.take("tag"),
            addr,
        })(i)
    }
}

impl ExtendValues for FromTo {
    fn extend_values(&self, values: &mut OneOrMore) {
        *values = self.create_values()
    }

    fn create_values(&self) -> OneOrMore {
        OneOrMore::One(self.to_string().into())
    }
}

impl fmt::Display for FromTo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr.in_context(UriContext::FromTo))?;

        if let Some(tag) = &self.tag {
            write!(f, ";tag={tag}")?;
        }

        Ok(())
    }
}
