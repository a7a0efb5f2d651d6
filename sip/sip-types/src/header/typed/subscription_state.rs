use crate::Name;
use crate::header::{ConstNamed, ExtendValues, HeaderParse, OneOrMore};
use crate::parse::token;
use crate::uri::params::{GPS, Params};
use bytes::Bytes;
use bytesstr::BytesStr;
use internal::{IResult, ws};
use nom::bytes::complete::take_while1;
use nom::combinator::map;
use nom::sequence::tuple;
use std::fmt;

/// substate-value defined in [RFC 6665](https://datatracker.ietf.org/doc/html/rfc6665#section-8.4)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubState {
    Active,
    Pending,
    Terminated,
    /// Unknown states are treated like `Active` by subscribers
    Other(BytesStr),
}

impl fmt::Display for SubState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubState::Active => f.write_str("active"),
            SubState::Pending => f.write_str("pending"),
            SubState::Terminated => f.write_str("terminated"),
            SubState::Other(other) => f.write_str(other),
        }
    }
}

/// event-reason-value defined in [RFC 6665](https://datatracker.ietf.org/doc/html/rfc6665#section-8.4)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventReason {
    Deactivated,
    Probation,
    Rejected,
    Timeout,
    GiveUp,
    NoResource,
    Invariant,
    Other(BytesStr),
}

impl EventReason {
    fn from_value(value: BytesStr) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "deactivated" => Self::Deactivated,
            "probation" => Self::Probation,
            "rejected" => Self::Rejected,
            "timeout" => Self::Timeout,
            "giveup" => Self::GiveUp,
            "noresource" => Self::NoResource,
            "invariant" => Self::Invariant,
            _ => Self::Other(value),
        }
    }

    /// The subscriber may immediately try to subscribe again
    pub fn may_retry(&self) -> bool {
        matches!(self, Self::Deactivated | Self::Timeout)
    }
}

impl fmt::Display for EventReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deactivated => f.write_str("deactivated"),
            Self::Probation => f.write_str("probation"),
            Self::Rejected => f.write_str("rejected"),
            Self::Timeout => f.write_str("timeout"),
            Self::GiveUp => f.write_str("giveup"),
            Self::NoResource => f.write_str("noresource"),
            Self::Invariant => f.write_str("invariant"),
            Self::Other(other) => f.write_str(other),
        }
    }
}

/// `Subscription-State` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionState {
    pub state: SubState,
    pub expires: Option<u32>,
    pub reason: Option<EventReason>,
    pub retry_after: Option<u32>,
    pub params: Params<GPS>,
}

impl SubscriptionState {
    #[inline]
    pub fn new(state: SubState) -> SubscriptionState {
        SubscriptionState {
            state,
            expires: None,
            reason: None,
            retry_after: None,
            params: Params::new(),
        }
    }

    pub fn with_expires(mut self, expires: u32) -> Self {
        self.expires = Some(expires);
        self
    }

    pub fn with_reason(mut self, reason: EventReason) -> Self {
        self.reason = Some(reason);
        self
    }

    pub fn with_retry_after(mut self, retry_after: u32) -> Self {
        self.retry_after = Some(retry_after);
        self
    }
}

impl ConstNamed for SubscriptionState {
    const NAME: Name = Name::SUBSCRIPTION_STATE;
}

impl HeaderParse for SubscriptionState {
    fn parse<'i>(src: &'i Bytes, i: &'i str) -> IResult<&'i str, Self> {
        map(
            tuple((ws((take_while1(token),)), Params::<GPS>::parse(src))),
            |((state,), mut params)| {
                let state = match state.to_ascii_lowercase().as_str() {
                    "active" => SubState::Active,
                    "pending" => SubState::Pending,
                    "terminated" => SubState::Terminated,
                    _ => SubState::Other(BytesStr::from_parse(src, state)),
                };

                SubscriptionState {
                    state,
                    expires: params.take("expires").and_then(|e| e.parse().ok()),
                    reason: params.take("reason").map(EventReason::from_value),
                    retry_after: params.take("retry-after").and_then(|r| r.parse().ok()),
                    params,
                }
            },
        )(i)
    }
}

impl ExtendValues for SubscriptionState {
    fn extend_values(&self, values: &mut OneOrMore) {
        *values = self.create_values()
    }

    fn create_values(&self) -> OneOrMore {
        OneOrMore::One(self.to_string().into())
    }
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.state)?;

        if let Some(reason) = &self.reason {
            write!(f, ";reason={reason}")?;
        }

        if let Some(expires) = self.expires {
            write!(f, ";expires={expires}")?;
        }

        if let Some(after) = self.retry_after {
            write!(f, ";retry-after={after}")?;
        }

        write!(f, "{}", self.params)
    }
}
