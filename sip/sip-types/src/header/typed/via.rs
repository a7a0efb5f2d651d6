use crate::Name;
use crate::header::{ConstNamed, ExtendValues, HeaderParse, OneOrMore};
use crate::host::HostPort;
use crate::parse::{Parse, token};
use crate::uri::params::{GPS, Param, Params};
use bytes::Bytes;
use bytesstr::BytesStr;
use internal::{IResult, ws};
use nom::bytes::complete::{tag, tag_no_case, take_while1};
use nom::combinator::map;
use nom::sequence::tuple;
use std::fmt;

/// `Via` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Via {
    pub transport: BytesStr,
    pub sent_by: HostPort,
    pub params: Params<GPS>,
}

impl Via {
    pub fn new<T, S, B>(transport: T, sent_by: S, branch: B) -> Via
    where
        T: Into<BytesStr>,
        S: Into<HostPort>,
        B: Into<BytesStr>,
    {
        Via {
            transport: transport.into(),
            sent_by: sent_by.into(),
            params: Params::new().with(Param::value("branch", branch)),
        }
    }

    pub fn branch(&self) -> Option<&BytesStr> {
        self.params.get_val("branch")
    }

    /// Set the `received` parameter added by the server transport
    pub fn set_received(&mut self, received: impl fmt::Display) {
        self.params
            .set("received", Some(BytesStr::from(received.to_string())));
    }

    pub fn with_rport(mut self) -> Self {
        self.params.set("rport", None::<BytesStr>);
        self
    }
}

impl ConstNamed for Via {
    const NAME: Name = Name::VIA;
}

impl HeaderParse for Via {
    fn parse<'i>(src: &'i Bytes, i: &'i str) -> IResult<&'i str, Self> {
        map(
            tuple((
                ws((
                    tag_no_case("SIP"),
                    tag("/"),
                    tag("2.0"),
                    tag("/"),
                    take_while1(token),
                    HostPort::parse(src),
                )),
                Params::<GPS>::parse(src),
            )),
            |((_, _, _, _, transport, sent_by), params)| Via {
                transport: BytesStr::from_parse(src, transport),
                sent_by,
                params,
            },
        )(i)
    }
}

impl ExtendValues for Via {
    fn extend_values(&self, values: &mut OneOrMore) {
        // Every Via gets its own header line
        values.push(self.to_string().into());
    }

    fn create_values(&self) -> OneOrMore {
        OneOrMore::One(self.to_string().into())
    }
}

impl fmt::Display for Via {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SIP/2.0/{} {}{}",
            self.transport, self.sent_by, self.params
        )
    }
}
