use crate::Error;
use bytes::Bytes;
use internal::Finish;
use sip_types::Headers;
use sip_types::header::typed::ContentLength;
use sip_types::msg::{Line, MessageLine, PullParser};
use sip_types::parse::Parse;
use std::str::from_utf8;

/// A complete SIP message split into its parts
#[derive(Debug, Clone)]
pub struct ParsedMessage {
    pub line: MessageLine,
    pub headers: Headers,
    pub body: Bytes,

    /// The buffer the message was parsed from
    pub buffer: Bytes,
}

/// Parse a complete message received from a message oriented transport
pub fn parse_message(buffer: Bytes) -> Result<ParsedMessage, Error> {
    let mut parser = PullParser::new(&buffer, 0);

    let mut message_line = None;
    let mut headers = Headers::new();

    for item in &mut parser {
        let Ok(line) = item else {
            log::warn!("Incoming SIP message is incomplete");
            return Err(Error::ProtocolViolation("incomplete message"));
        };

        let line = from_utf8(line).map_err(|_| {
            log::warn!("Incoming SIP message contained invalid UTF8 in header line");
            Error::ProtocolViolation("invalid utf8")
        })?;

        if message_line.is_none() {
            match MessageLine::parse(&buffer)(line) {
                Ok((_, line)) => message_line = Some(line),
                Err(_) => {
                    log::warn!("Incoming SIP message has an invalid start line: {line:?}");
                    return Err(Error::ProtocolViolation("invalid start line"));
                }
            }
        } else {
            match Line::parse(&buffer, line).finish() {
                Ok((_, line)) => headers.insert(line.name, line.value),
                Err(e) => {
                    log::warn!("Incoming SIP message has malformed header line, {e}");
                    return Err(Error::ProtocolViolation("malformed header line"));
                }
            }
        }
    }

    let Some(line) = message_line else {
        return Err(Error::ProtocolViolation("empty message"));
    };

    let head_end = parser.head_end();

    // message oriented transports deliver complete messages, Content-Length is optional
    let body = match headers.get_named::<ContentLength>() {
        Ok(ContentLength(0)) => Bytes::new(),
        Ok(ContentLength(len)) if buffer.len() >= head_end + len => {
            buffer.slice(head_end..head_end + len)
        }
        Ok(_) => {
            log::warn!("Incoming SIP message has an incomplete body");
            return Err(Error::ProtocolViolation("incomplete body"));
        }
        Err(_) => buffer.slice(head_end..),
    };

    Ok(ParsedMessage {
        line,
        headers,
        body,
        buffer,
    })
}
