//! Parsing utilities for SIP message components

use bytes::Bytes;
use bytesstr::BytesStr;
use internal::IResult;
use nom::branch::alt;
use nom::bytes::complete::is_not;
use nom::character::complete::{anychar, char};
use nom::combinator::recognize;
use nom::multi::many0;
use nom::sequence::{delimited, pair};
use std::fmt;

/// Error returned when text could not be parsed into a SIP type
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind}: {input:?}")]
pub struct ParseError {
    kind: &'static str,
    input: String,
}

impl ParseError {
    pub fn new(kind: &'static str, input: impl Into<String>) -> Self {
        Self {
            kind,
            input: input.into(),
        }
    }

    /// Name of the type that failed to parse
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// The rejected input
    pub fn input(&self) -> &str {
        &self.input
    }
}

/// Types which can be parsed out of a shared source buffer.
///
/// Parsed values keep references into `src` instead of copying, which is why the
/// buffer must be passed in separately from the `&str` being parsed.
pub trait Parse: Sized {
    fn parse(src: &Bytes) -> impl Fn(&str) -> IResult<&str, Self> + '_;
}

/// `"quoted \"string\""` returning the raw content between the quotes
pub(crate) fn parse_quoted(i: &str) -> IResult<&str, &str> {
    delimited(
        char('"'),
        recognize(many0(alt((
            is_not("\"\\"),
            recognize(pair(char('\\'), anychar)),
        )))),
        char('"'),
    )(i)
}

/// Remove quoted-pair escapes from the content of a quoted string
pub(crate) fn unescape_quoted(src: &Bytes, quoted: &str) -> BytesStr {
    if !quoted.contains('\\') {
        return BytesStr::from_parse(src, quoted);
    }

    let mut out = String::with_capacity(quoted.len());
    let mut chars = quoted.chars();

    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(escaped) = chars.next() {
                out.push(escaped);
            }
        } else {
            out.push(c);
        }
    }

    BytesStr::from(out)
}

/// Print `s` as a quoted string, escaping `"` and `\`
pub(crate) fn write_quoted(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    f.write_str("\"")?;

    for c in s.chars() {
        if matches!(c, '"' | '\\') {
            write!(f, "\\{c}")?;
        } else {
            write!(f, "{c}")?;
        }
    }

    f.write_str("\"")
}

pub(crate) fn whitespace(c: char) -> bool {
    matches!(c, ' ' | '\t' | '\r' | '\n')
}

#[rustfmt::skip]
pub(crate) fn token(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '-' | '.' | '!' | '%' | '*' | '_' | '`' | '\'' | '~' | '+')
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn quoted_with_escapes() {
        let (rem, quoted) = parse_quoted(r#""Bob \"the\" builder" <sip"#).unwrap();

        assert_eq!(rem, " <sip");
        assert_eq!(quoted, r#"Bob \"the\" builder"#);

        let src = Bytes::from_static(br#"Bob \"the\" builder"#);
        assert_eq!(unescape_quoted(&src, quoted), r#"Bob "the" builder"#);
    }

    #[test]
    fn empty_quoted() {
        let (rem, quoted) = parse_quoted(r#""" rest"#).unwrap();

        assert_eq!(rem, " rest");
        assert!(quoted.is_empty());
    }
}
