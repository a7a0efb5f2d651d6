use std::fmt;
use std::str::FromStr;

/// SIP response status code
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Code(u16);

impl fmt::Debug for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tuple = f.debug_tuple("Code");
        tuple.field(&self.0);
        if let Some(text) = self.text() {
            tuple.field(&text);
        }
        tuple.finish()
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Class of a [`Code`]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum CodeKind {
    /// 100..=199
    Provisional,
    /// 200..=299
    Success,
    /// 300..=399
    Redirection,
    /// 400..=499
    RequestFailure,
    /// 500..=599
    ServerFailure,
    /// 600..=699
    GlobalFailure,
    /// Anything outside of the defined classes
    Custom,
}

impl Code {
    /// Returns the [`CodeKind`] of the code
    ///
    /// ```
    /// use sipline_sip_types::{Code, CodeKind};
    ///
    /// assert_eq!(Code::from(183).kind(), CodeKind::Provisional);
    /// assert_eq!(Code::from(486).kind(), CodeKind::RequestFailure);
    /// ```
    #[inline]
    pub fn kind(self) -> CodeKind {
        match self.0 {
            100..=199 => CodeKind::Provisional,
            200..=299 => CodeKind::Success,
            300..=399 => CodeKind::Redirection,
            400..=499 => CodeKind::RequestFailure,
            500..=599 => CodeKind::ServerFailure,
            600..=699 => CodeKind::GlobalFailure,
            _ => CodeKind::Custom,
        }
    }

    /// Every code that is not provisional ends a transaction
    #[inline]
    pub fn is_final(self) -> bool {
        self.0 >= 200
    }

    #[inline]
    pub fn is_success(self) -> bool {
        self.kind() == CodeKind::Success
    }

    pub fn into_u16(self) -> u16 {
        self.0
    }
}

impl FromStr for Code {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Code(s.parse()?))
    }
}

impl From<u16> for Code {
    fn from(code: u16) -> Code {
        Code(code)
    }
}

macro_rules! codes {
    ($([$code:expr => $name:ident, $text:literal];)*) => {
        impl Code {
            /// Default reason phrase of a known code
            pub fn text(self) -> Option<&'static str> {
                match self.0 {
                    $($code => Some($text),)*
                    _ => None
                }
            }

            $(pub const $name: Code = Code($code);)*
        }
    };
}

codes! {
    [100 => TRYING, "Trying"];
    [180 => RINGING, "Ringing"];
    [181 => CALL_IS_BEING_FORWARDED, "Call Is Being Forwarded"];
    [182 => QUEUED, "Queued"];
    [183 => SESSION_PROGRESS, "Session Progress"];
    [199 => EARLY_DIALOG_TERMINATED, "Early Dialog Terminated"];

    [200 => OK, "OK"];
    [202 => ACCEPTED, "Accepted"];

    [300 => MULTIPLE_CHOICES, "Multiple Choices"];
    [301 => MOVED_PERMANENTLY, "Moved Permanently"];
    [302 => MOVED_TEMPORARILY, "Moved Temporarily"];
    [305 => USE_PROXY, "Use Proxy"];
    [380 => ALTERNATIVE_SERVICE, "Alternative Service"];

    [400 => BAD_REQUEST, "Bad Request"];
    [401 => UNAUTHORIZED, "Unauthorized"];
    [402 => PAYMENT_REQUIRED, "Payment Required"];
    [403 => FORBIDDEN, "Forbidden"];
    [404 => NOT_FOUND, "Not Found"];
    [405 => METHOD_NOT_ALLOWED, "Method Not Allowed"];
    [406 => NOT_ACCEPTABLE, "Not Acceptable"];
    [407 => PROXY_AUTHENTICATION_REQUIRED, "Proxy Authentication Required"];
    [408 => REQUEST_TIMEOUT, "Request Timeout"];
    [410 => GONE, "Gone"];
    [413 => REQUEST_ENTITY_TOO_LARGE, "Request Entity Too Large"];
    [414 => REQUEST_URI_TOO_LONG, "Request-URI Too Long"];
    [415 => UNSUPPORTED_MEDIA_TYPE, "Unsupported Media Type"];
    [416 => UNSUPPORTED_URI_SCHEME, "Unsupported URI Scheme"];
    [420 => BAD_EXTENSION, "Bad Extension"];
    [421 => EXTENSION_REQUIRED, "Extension Required"];
    [423 => INTERVAL_TOO_BRIEF, "Interval Too Brief"];
    [480 => TEMPORARILY_UNAVAILABLE, "Temporarily Unavailable"];
    [481 => CALL_OR_TRANSACTION_DOES_NOT_EXIST, "Call/Transaction Does Not Exist"];
    [482 => LOOP_DETECTED, "Loop Detected"];
    [483 => TOO_MANY_HOPS, "Too Many Hops"];
    [484 => ADDRESS_INCOMPLETE, "Address Incomplete"];
    [485 => AMBIGUOUS, "Ambiguous"];
    [486 => BUSY_HERE, "Busy Here"];
    [487 => REQUEST_TERMINATED, "Request Terminated"];
    [488 => NOT_ACCEPTABLE_HERE, "Not Acceptable Here"];
    [489 => BAD_EVENT, "Bad Event"];
    [491 => REQUEST_PENDING, "Request Pending"];
    [493 => UNDECIPHERABLE, "Undecipherable"];

    [500 => SERVER_INTERNAL_ERROR, "Server Internal Error"];
    [501 => NOT_IMPLEMENTED, "Not Implemented"];
    [502 => BAD_GATEWAY, "Bad Gateway"];
    [503 => SERVICE_UNAVAILABLE, "Service Unavailable"];
    [504 => SERVER_TIMEOUT, "Server Time-out"];
    [505 => VERSION_NOT_SUPPORTED, "Version Not Supported"];
    [513 => MESSAGE_TOO_LARGE, "Message Too Large"];
    [580 => PRECONDITION_FAILURE, "Precondition Failure"];

    [600 => BUSY_EVERYWHERE, "Busy Everywhere"];
    [603 => DECLINE, "Decline"];
    [604 => DOES_NOT_EXIST_ANYWHERE, "Does Not Exist Anywhere"];
    [606 => NOT_ACCEPTABLE_ANYWHERE, "Not Acceptable"];
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn text_lookup() {
        assert_eq!(Code::REQUEST_PENDING.text(), Some("Request Pending"));
        assert_eq!(Code::from(499).text(), None);
        assert_eq!(format!("{:?}", Code::OK), r#"Code(200, "OK")"#);
    }

    #[test]
    fn finality() {
        assert!(!Code::RINGING.is_final());
        assert!(Code::OK.is_final());
        assert!(Code::OK.is_success());
        assert!(!Code::DECLINE.is_success());
        assert_eq!(Code::from(99).kind(), CodeKind::Custom);
    }
}
