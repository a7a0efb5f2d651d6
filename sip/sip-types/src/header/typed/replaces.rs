use crate::Name;
use crate::header::{ConstNamed, ExtendValues, HeaderParse, OneOrMore};
use crate::uri::params::{GPS, Params};
use bytes::Bytes;
use bytesstr::BytesStr;
use internal::{IResult, ws};
use nom::bytes::complete::take_while1;
use nom::combinator::map;
use nom::sequence::tuple;
use std::fmt;

/// `Replaces` header, see [RFC 3891](https://www.rfc-editor.org/rfc/rfc3891#section-6.1)
///
/// Names a dialog by its Call-ID and tags as seen from the side receiving the header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replaces {
    pub call_id: BytesStr,
    pub to_tag: BytesStr,
    pub from_tag: BytesStr,
    /// Only replace the dialog while it is early
    pub early_only: bool,
}

impl ConstNamed for Replaces {
    const NAME: Name = Name::REPLACES;
}

impl HeaderParse for Replaces {
    fn parse<'i>(src: &'i Bytes, i: &'i str) -> IResult<&'i str, Self> {
        map(
            tuple((
                ws((take_while1(|c: char| c != ';' && !c.is_whitespace()),)),
                Params::<GPS>::parse(src),
            )),
            |((call_id,), mut params)| {
                let early_only = params.remove("early-only") > 0;

                Replaces {
                    call_id: BytesStr::from_parse(src, call_id),
                    to_tag: params.take("to-tag").unwrap_or_default(),
                    from_tag: params.take("from-tag").unwrap_or_default(),
                    early_only,
                }
            },
        )(i)
    }
}

impl ExtendValues for Replaces {
    fn extend_values(&self, values: &mut OneOrMore) {
        *values = self.create_values()
    }

    fn create_values(&self) -> OneOrMore {
        OneOrMore::One(self.to_string().into())
    }
}

impl fmt::Display for Replaces {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{};to-tag={};from-tag={}",
            self.call_id, self.to_tag, self.from_tag
        )?;

        if self.early_only {
            f.write_str(";early-only")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Headers;

    #[test]
    fn parse_replaces() {
        let mut headers = Headers::new();
        headers.insert(
            Name::REPLACES,
            "425928@bobster.example.org;to-tag=7743;from-tag=6472;early-only",
        );

        let replaces: Replaces = headers.get_named().unwrap();

        assert_eq!(replaces.call_id, "425928@bobster.example.org");
        assert_eq!(replaces.to_tag, "7743");
        assert_eq!(replaces.from_tag, "6472");
        assert!(replaces.early_only);
    }

    #[test]
    fn print_replaces() {
        let replaces = Replaces {
            call_id: "abc".into(),
            to_tag: "t1".into(),
            from_tag: "f1".into(),
            early_only: false,
        };

        assert_eq!(replaces.to_string(), "abc;to-tag=t1;from-tag=f1");
    }
}
