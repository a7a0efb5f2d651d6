//! SIP message lines and a pull parser to split a message head into lines

use crate::Name;
use crate::code::Code;
use crate::method::Method;
use crate::parse::{Parse, token, whitespace};
use crate::print::UriContext;
use crate::uri::SipUri;
use bytes::Bytes;
use bytesstr::BytesStr;
use internal::{IResult, rest, ws};
use memchr::memchr2;
use nom::branch::alt;
use nom::bytes::complete::{tag, take_while, take_while_m_n};
use nom::character::complete::char;
use nom::combinator::{map, map_res};
use nom::sequence::{preceded, terminated, tuple};
use std::fmt;
use std::str::FromStr;

/// A `header-name: header-value` line inside a message head
///
/// ```rust
/// use bytes::Bytes;
/// use sipline_sip_types::msg::Line;
/// use sipline_sip_types::Name;
///
/// let src = Bytes::from_static(b"Max-Forwards:  70");
/// let (_, line) = Line::parse(&src, std::str::from_utf8(&src).unwrap()).unwrap();
///
/// assert_eq!(line.name, Name::MAX_FORWARDS);
/// assert_eq!(line.value, "70");
/// ```
#[derive(Debug)]
pub struct Line {
    pub name: Name,
    pub value: BytesStr,
}

impl Line {
    pub fn parse<'i>(src: &Bytes, i: &'i str) -> IResult<&'i str, Self> {
        map(
            ws((take_while(token), char(':'), rest())),
            |(name, _, value): (&str, _, &str)| Line {
                name: BytesStr::from_parse(src, name).into(),
                value: BytesStr::from_parse(src, value.trim()),
            },
        )(i)
    }
}

/// The first line of a SIP message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageLine {
    Request(RequestLine),
    Response(StatusLine),
}

impl MessageLine {
    pub fn is_request(&self) -> bool {
        matches!(self, Self::Request(..))
    }

    pub fn request_method(&self) -> Option<&Method> {
        match self {
            MessageLine::Request(line) => Some(&line.method),
            MessageLine::Response(_) => None,
        }
    }
}

impl Parse for MessageLine {
    fn parse(src: &Bytes) -> impl Fn(&str) -> IResult<&str, Self> + '_ {
        move |i| {
            alt((
                map(StatusLine::parse(src), MessageLine::Response),
                map(RequestLine::parse(src), MessageLine::Request),
            ))(i)
        }
    }
}

impl fmt::Display for MessageLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageLine::Request(line) => fmt::Display::fmt(line, f),
            MessageLine::Response(line) => fmt::Display::fmt(line, f),
        }
    }
}

/// `METHOD request-uri SIP/2.0`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: Method,
    pub uri: SipUri,
}

impl Parse for RequestLine {
    fn parse(src: &Bytes) -> impl Fn(&str) -> IResult<&str, Self> + '_ {
        move |i| {
            map(
                tuple((
                    terminated(Method::parse(src), take_while(whitespace)),
                    terminated(
                        SipUri::parse(src),
                        tuple((take_while(whitespace), tag("SIP/2.0"))),
                    ),
                )),
                |(method, uri)| RequestLine { method, uri },
            )(i)
        }
    }
}

impl fmt::Display for RequestLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} SIP/2.0",
            self.method,
            self.uri.in_context(UriContext::ReqUri)
        )
    }
}

/// `SIP/2.0 code reason`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub code: Code,
    pub reason: Option<BytesStr>,
}

impl StatusLine {
    /// Status line with the default reason phrase of `code`
    pub fn new(code: Code) -> Self {
        Self {
            code,
            reason: code.text().map(BytesStr::from_static),
        }
    }
}

impl Parse for StatusLine {
    fn parse(src: &Bytes) -> impl Fn(&str) -> IResult<&str, Self> + '_ {
        move |i| {
            map(
                preceded(
                    tuple((tag("SIP/2.0"), take_while(whitespace))),
                    tuple((
                        map_res(
                            take_while_m_n(3, 3, |c: char| c.is_ascii_digit()),
                            u16::from_str,
                        ),
                        rest(),
                    )),
                ),
                |(code, reason): (u16, &str)| StatusLine {
                    code: Code::from(code),
                    reason: match reason.trim() {
                        "" => None,
                        reason => Some(BytesStr::from_parse(src, reason)),
                    },
                },
            )(i)
        }
    }
}

impl fmt::Display for StatusLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/2.0 {}", self.code.into_u16())?;

        if let Some(reason) = &self.reason {
            write!(f, " {reason}")?;
        }

        Ok(())
    }
}

/// Pull parser returning every line of a SIP message head.
///
/// Lines end with `\n` or `\r\n` not followed by whitespace, folded header
/// lines are returned as a single line.
///
/// ```
/// use sipline_sip_types::msg::PullParser;
///
/// let msg = b"OPTIONS sip:user@example.com SIP/2.0\r\nAccept: application/sdp,\r\n  message/sipfrag\r\nl: 0\r\n\r\n";
///
/// let mut parser = PullParser::new(msg, 0);
///
/// assert_eq!(parser.next(), Some(Ok(&b"OPTIONS sip:user@example.com SIP/2.0"[..])));
/// assert_eq!(parser.next(), Some(Ok(&b"Accept: application/sdp,\r\n  message/sipfrag"[..])));
/// assert_eq!(parser.next(), Some(Ok(&b"l: 0"[..])));
/// assert_eq!(parser.next(), None);
/// assert_eq!(parser.head_end(), msg.len());
/// ```
#[derive(Clone)]
pub struct PullParser<'i> {
    input: &'i [u8],
    progress: usize,
}

/// The message head is not complete
#[derive(Debug, PartialEq, Eq)]
pub struct Incomplete(());

impl<'i> PullParser<'i> {
    pub fn new(input: &'i [u8], progress: usize) -> Self {
        Self { input, progress }
    }

    /// Index of the first byte after the message head, only valid after the parser returned `None`
    pub fn head_end(&self) -> usize {
        match self.input[self.progress..] {
            [b'\r', b'\n', b'\r', b'\n', ..] => self.progress + 4,
            [b'\n', b'\n', ..] => self.progress + 2,
            _ => self.progress,
        }
    }

    pub fn progress(&self) -> usize {
        self.progress
    }
}

impl<'i> Iterator for PullParser<'i> {
    type Item = Result<&'i [u8], Incomplete>;

    fn next(&mut self) -> Option<Self::Item> {
        let line_begin = self.progress;
        let mut skip = 0;

        loop {
            let Some(found) = memchr2(b'\n', b'\r', &self.input[line_begin + skip..]) else {
                return Some(Err(Incomplete(())));
            };

            let pos = line_begin + skip + found;

            match self.input[pos..] {
                // folded line
                [b'\n', b' ' | b'\t', ..] | [b'\r', b'\n', b' ' | b'\t', ..] => {
                    skip += found + 1;
                }
                [b'\n', next, ..] => {
                    let line = &self.input[line_begin..pos];

                    if line.is_empty() {
                        return None;
                    }

                    // stay on the empty line so head_end can find it
                    self.progress = if next == b'\n' { pos } else { pos + 1 };

                    return Some(Ok(line));
                }
                [b'\r', b'\n', b1, b2, ..] => {
                    let line = &self.input[line_begin..pos];

                    if line.is_empty() {
                        return None;
                    }

                    self.progress = if b1 == b'\r' && b2 == b'\n' {
                        pos
                    } else {
                        pos + 2
                    };

                    return Some(Ok(line));
                }
                _ => return Some(Err(Incomplete(()))),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse_line(s: &'static str) -> MessageLine {
        let src = Bytes::from_static(s.as_bytes());
        let (rem, line) = MessageLine::parse(&src)(s).unwrap();
        assert!(rem.is_empty());
        line
    }

    #[test]
    fn request_line() {
        let MessageLine::Request(line) = parse_line("INVITE sip:bob@biloxi.example;transport=ws SIP/2.0")
        else {
            panic!("expected request line")
        };

        assert_eq!(line.method, Method::INVITE);
        assert_eq!(line.uri.user.as_ref().unwrap(), "bob");
        assert_eq!(
            line.to_string(),
            "INVITE sip:bob@biloxi.example;transport=ws SIP/2.0"
        );
    }

    #[test]
    fn status_line() {
        let MessageLine::Response(line) = parse_line("SIP/2.0 180 Ringing") else {
            panic!("expected status line")
        };

        assert_eq!(line.code, Code::RINGING);
        assert_eq!(line.reason.as_ref().unwrap(), "Ringing");
    }

    #[test]
    fn status_line_without_reason() {
        let MessageLine::Response(line) = parse_line("SIP/2.0 486") else {
            panic!("expected status line")
        };

        assert_eq!(line.code, Code::BUSY_HERE);
        assert_eq!(line.reason, None);
        assert_eq!(line.to_string(), "SIP/2.0 486");
        assert_eq!(StatusLine::new(Code::BUSY_HERE).to_string(), "SIP/2.0 486 Busy Here");
    }

    #[test]
    fn lf_only_message() {
        let msg = b"SIP/2.0 200 OK\nCSeq: 1 BYE\n\nbody";

        let mut parser = PullParser::new(msg, 0);

        assert_eq!(parser.next(), Some(Ok(&b"SIP/2.0 200 OK"[..])));
        assert_eq!(parser.next(), Some(Ok(&b"CSeq: 1 BYE"[..])));
        assert_eq!(parser.next(), None);
        assert_eq!(&msg[parser.head_end()..], b"body");
    }

    #[test]
    fn incomplete_head() {
        let msg = b"OPTIONS sip:user@example.com SIP/2.0\r\nTo: <si";

        let mut parser = PullParser::new(msg, 0);

        assert!(parser.next().unwrap().is_ok());
        assert_eq!(parser.next(), Some(Err(Incomplete(()))));
    }
}
