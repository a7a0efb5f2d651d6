use bytesstr::BytesStr;
use sip_types::Code;
use std::fmt;

/// Why a session, registration, subscription or request ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cause {
    Bye,
    Canceled,
    NoAnswer,
    NoAck,
    /// A reliable provisional response was never acknowledged
    NoPrack,
    Expires,
    RequestTimeout,
    ConnectionError,
    SipFailureCode {
        code: Code,
        reason: Option<BytesStr>,
    },
    InvalidTarget,
    DialogError,
    BadMediaDescription,
    AuthenticationError,
    Rejected,
    Busy,
    NotFound,
    Unavailable,
    Redirected,
    IncompatibleSdp,
    UserDeniedMediaAccess,
    InternalError,
}

impl Cause {
    pub fn as_str(&self) -> &'static str {
        match self {
            Cause::Bye => "Terminated",
            Cause::Canceled => "Canceled",
            Cause::NoAnswer => "No Answer",
            Cause::NoAck => "No ACK",
            Cause::NoPrack => "No PRACK",
            Cause::Expires => "Expires",
            Cause::RequestTimeout => "Request Timeout",
            Cause::ConnectionError => "Connection Error",
            Cause::SipFailureCode { .. } => "SIP Failure Code",
            Cause::InvalidTarget => "Invalid Target",
            Cause::DialogError => "Dialog Error",
            Cause::BadMediaDescription => "Bad Media Description",
            Cause::AuthenticationError => "Authentication Error",
            Cause::Rejected => "Rejected",
            Cause::Busy => "Busy",
            Cause::NotFound => "Not Found",
            Cause::Unavailable => "Unavailable",
            Cause::Redirected => "Redirected",
            Cause::IncompatibleSdp => "Incompatible SDP",
            Cause::UserDeniedMediaAccess => "User Denied Media Access",
            Cause::InternalError => "Internal Error",
        }
    }
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cause::SipFailureCode { code, reason } => {
                write!(f, "SIP Failure Code {}", code.into_u16())?;

                if let Some(reason) = reason {
                    write!(f, " {reason}")?;
                }

                Ok(())
            }
            cause => f.write_str(cause.as_str()),
        }
    }
}

/// Classify a final failure response
pub fn sip_error_cause(code: Code, reason: Option<&BytesStr>) -> Cause {
    match code.into_u16() {
        300 | 301 | 302 | 305 | 380 => Cause::Redirected,
        401 | 407 => Cause::AuthenticationError,
        403 | 603 => Cause::Rejected,
        404 | 604 => Cause::NotFound,
        408 | 410 | 430 | 480 => Cause::Unavailable,
        486 | 600 => Cause::Busy,
        488 | 606 => Cause::IncompatibleSdp,
        _ => Cause::SipFailureCode {
            code,
            reason: reason.cloned(),
        },
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn classification() {
        assert_eq!(sip_error_cause(Code::BUSY_HERE, None), Cause::Busy);
        assert_eq!(sip_error_cause(Code::DECLINE, None), Cause::Rejected);
        assert_eq!(
            sip_error_cause(Code::TEMPORARILY_UNAVAILABLE, None),
            Cause::Unavailable
        );
        assert_eq!(
            sip_error_cause(Code::PROXY_AUTHENTICATION_REQUIRED, None),
            Cause::AuthenticationError
        );

        let reason = BytesStr::from_static("Oops");
        let cause = sip_error_cause(Code::SERVER_INTERNAL_ERROR, Some(&reason));

        assert_eq!(cause.to_string(), "SIP Failure Code 500 Oops");
    }
}
