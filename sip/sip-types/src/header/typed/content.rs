use crate::Name;
use crate::header::{ConstNamed, ExtendValues, HeaderParse, OneOrMore};
use bytes::Bytes;
use bytesstr::BytesStr;
use internal::{IResult, rest};
use nom::combinator::{map, verify};
use std::fmt;

number_header!(
    /// `Content-Length` header
    ContentLength,
    Name::CONTENT_LENGTH,
    usize
);

/// `Content-Type` header, the media type is kept as written including its parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentType(pub BytesStr);

impl ContentType {
    pub const SDP: ContentType = ContentType(BytesStr::from_static("application/sdp"));
    pub const DTMF_RELAY: ContentType =
        ContentType(BytesStr::from_static("application/dtmf-relay"));
    pub const TEXT_PLAIN: ContentType = ContentType(BytesStr::from_static("text/plain"));

    /// Compare the media type, ignoring case and any parameters
    pub fn is(&self, media_type: &str) -> bool {
        let own = self.0.split(';').next().unwrap_or_default().trim();

        own.eq_ignore_ascii_case(media_type)
    }
}

impl ConstNamed for ContentType {
    const NAME: Name = Name::CONTENT_TYPE;
}

impl HeaderParse for ContentType {
    fn parse<'i>(src: &'i Bytes, i: &'i str) -> IResult<&'i str, Self> {
        map(verify(rest(), |i: &str| !i.trim().is_empty()), |i: &str| {
            ContentType(BytesStr::from_parse(src, i.trim()))
        })(i)
    }
}

impl ExtendValues for ContentType {
    fn extend_values(&self, values: &mut OneOrMore) {
        *values = self.create_values()
    }

    fn create_values(&self) -> OneOrMore {
        OneOrMore::One(self.0.clone())
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
