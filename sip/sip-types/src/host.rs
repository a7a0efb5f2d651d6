//! [`HostPort`] and [`Host`] found in URIs and the Via header

use crate::parse::Parse;
use bytes::Bytes;
use bytesstr::BytesStr;
use internal::IResult;
use nom::AsChar;
use nom::branch::alt;
use nom::bytes::complete::{tag, take_while1};
use nom::character::complete::{char, u8};
use nom::combinator::{map, map_res, opt, recognize, verify};
use nom::multi::many0;
use nom::sequence::{delimited, preceded, tuple};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Either IP address or FQDN
#[derive(Debug, Clone, PartialEq, Hash, Eq)]
pub enum Host {
    IP6(Ipv6Addr),
    IP4(Ipv4Addr),
    Name(BytesStr),
}

impl Parse for Host {
    fn parse(src: &Bytes) -> impl Fn(&str) -> IResult<&str, Self> + '_ {
        move |i| {
            alt((
                map_res(ip6_reference, |ip6| ip6.parse().map(Self::IP6)),
                map_res(ip4_address, |ip4| ip4.parse().map(Self::IP4)),
                map(hostname, |hostname| {
                    Self::Name(BytesStr::from_parse(src, hostname))
                }),
            ))(i)
        }
    }
}
impl_from_str!(Host, "host");

/// IPv4address =  1*3DIGIT "." 1*3DIGIT "." 1*3DIGIT "." 1*3DIGIT
fn ip4_address(i: &str) -> IResult<&str, &str> {
    recognize(tuple((u8, char('.'), u8, char('.'), u8, char('.'), u8)))(i)
}

/// IPv6reference  =  "[" IPv6address "]"
fn ip6_reference(i: &str) -> IResult<&str, &str> {
    delimited(
        char('['),
        take_while1(|c: char| c.is_hex_digit() || matches!(c, ':' | '.')),
        char(']'),
    )(i)
}

/// Relaxed hostname, the SIP ABNF is stricter than what DNS allows today
fn hostname(i: &str) -> IResult<&str, &str> {
    recognize(tuple((
        label,
        many0(tuple((char('.'), label))),
        opt(char('.')),
    )))(i)
}

fn label(i: &str) -> IResult<&str, &str> {
    verify(
        take_while1(|c: char| c.is_alphanum() || c == '-'),
        |label: &str| !(label.starts_with('-') || label.ends_with('-')),
    )(i)
}

impl From<IpAddr> for Host {
    fn from(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(addr) => Host::IP4(addr),
            IpAddr::V6(addr) => Host::IP6(addr),
        }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Host::IP6(addr) => write!(f, "[{addr}]"),
            Host::IP4(addr) => write!(f, "{addr}"),
            Host::Name(name) => f.write_str(name),
        }
    }
}

/// [`Host`] paired with an optional port
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct HostPort {
    pub host: Host,
    pub port: Option<u16>,
}

impl HostPort {
    pub fn new(host: Host, port: Option<u16>) -> Self {
        Self { host, port }
    }

    /// Host-port with a hostname and no port
    pub fn host_name<S: Into<BytesStr>>(name: S) -> HostPort {
        HostPort {
            host: Host::Name(name.into()),
            port: None,
        }
    }

    /// Returns `Some` ip-address if the host part is an ip-address
    pub fn ip(&self) -> Option<IpAddr> {
        match self.host {
            Host::IP4(ip) => Some(IpAddr::V4(ip)),
            Host::IP6(ip) => Some(IpAddr::V6(ip)),
            Host::Name(_) => None,
        }
    }
}

impl Parse for HostPort {
    fn parse(src: &Bytes) -> impl Fn(&str) -> IResult<&str, Self> + '_ {
        move |i| {
            map(
                tuple((
                    Host::parse(src),
                    opt(preceded(tag(":"), nom::character::complete::u16)),
                )),
                |(host, port)| HostPort { host, port },
            )(i)
        }
    }
}
impl_from_str!(HostPort, "host-port");

impl From<SocketAddr> for HostPort {
    fn from(addr: SocketAddr) -> Self {
        HostPort {
            host: addr.ip().into(),
            port: Some(addr.port()),
        }
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.host)?;

        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::str::FromStr;

    #[track_caller]
    fn expect_hostname(i: &'static str) {
        let got = HostPort::from_str(i).unwrap();
        assert_eq!(got, HostPort::host_name(i));
    }

    #[track_caller]
    fn expect_ip4(i: &'static str) {
        let got = HostPort::from_str(i).unwrap();
        assert_eq!(got, HostPort::new(Host::IP4(i.parse().unwrap()), None));
    }

    #[track_caller]
    fn expect_ip6(i: &'static str) {
        let got = HostPort::from_str(i).unwrap();
        let ip = i[1..i.len() - 1].parse().unwrap();
        assert_eq!(got, HostPort::new(Host::IP6(ip), None));
    }

    #[test]
    fn host() {
        expect_ip4("192.0.2.1");
        expect_ip4("1.100.1.100");
        expect_hostname("123.123.123.321");
        expect_hostname("example.org");
        expect_hostname("example.org.");
        expect_hostname("edge.sip.example.invalid");
        expect_ip6("[::1]");
        expect_ip6("[2001:db8::1:2]");
    }

    #[test]
    fn host_port() {
        let hp = HostPort::from_str("example.com:5060").unwrap();

        assert_eq!(hp.host, Host::Name("example.com".into()));
        assert_eq!(hp.port, Some(5060));
        assert_eq!(hp.to_string(), "example.com:5060");

        let hp = HostPort::from_str("[2001:db8::1]:5061").unwrap();
        assert_eq!(hp.to_string(), "[2001:db8::1]:5061");
    }

    #[test]
    fn invalid_host() {
        assert!(HostPort::from_str("-bad-.example").is_err());
        assert!(HostPort::from_str("example.com:99999").is_err());
    }
}
