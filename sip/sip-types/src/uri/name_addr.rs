use super::params::{GPS, Param, Params};
use super::sip::SipUri;
use crate::parse::{Parse, parse_quoted, token, unescape_quoted, write_quoted};
use crate::print::UriContext;
use bytes::Bytes;
use bytesstr::BytesStr;
use internal::{IResult, skip_ws};
use nom::branch::alt;
use nom::bytes::complete::{tag, take_while1};
use nom::combinator::{map, opt};
use nom::sequence::{delimited, tuple};
use std::fmt;

/// `"display name" <uri>;params`, the value of From, To, Contact and similar headers
///
/// Unlike URI parameters, header parameters keep their order and may repeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameAddr {
    pub display_name: Option<BytesStr>,
    pub uri: SipUri,
    pub params: Params<GPS>,
}

impl NameAddr {
    pub fn new<N>(display_name: Option<N>, uri: SipUri) -> Self
    where
        N: Into<BytesStr>,
    {
        Self {
            display_name: display_name.map(Into::into),
            uri,
            params: Params::new(),
        }
    }

    #[inline]
    pub fn uri(uri: SipUri) -> Self {
        Self {
            display_name: None,
            uri,
            params: Params::new(),
        }
    }

    pub fn with_param(mut self, name: &str, value: Option<&str>) -> Self {
        self.set_param(name, value);
        self
    }

    /// Edit the first occurrence of `name` or append it
    pub fn set_param(&mut self, name: &str, value: Option<&str>) {
        self.params
            .set(BytesStr::from(name), value.map(BytesStr::from));
    }

    /// Append `name` even when it already exists
    pub fn push_param(&mut self, name: &str, value: Option<&str>) {
        self.params.push(Param {
            name: name.into(),
            value: value.map(BytesStr::from),
        });
    }

    /// Value of the first occurrence of `name`
    pub fn get_param(&self, name: &str) -> Option<&BytesStr> {
        self.params.get_val(name)
    }

    pub fn has_param(&self, name: &str) -> bool {
        self.params.contains(name)
    }

    /// Remove every occurrence of `name`, returns if any existed
    pub fn delete_param(&mut self, name: &str) -> bool {
        self.params.remove(name) > 0
    }

    pub fn clear_params(&mut self) {
        self.params.clear();
    }

    /// Print with the URI filtered for `ctx`
    pub fn in_context(&self, ctx: UriContext) -> NameAddrInContext<'_> {
        NameAddrInContext {
            name_addr: self,
            ctx,
        }
    }

    fn fmt_ctx(&self, f: &mut fmt::Formatter<'_>, ctx: Option<UriContext>) -> fmt::Result {
        if let Some(display_name) = &self.display_name {
            write_quoted(f, display_name)?;
            f.write_str(" ")?;
        }

        match ctx {
            Some(ctx) => write!(f, "<{}>", self.uri.in_context(ctx))?,
            None => write!(f, "<{}>", self.uri)?,
        }

        write!(f, "{}", self.params)
    }
}

fn display_token(c: char) -> bool {
    token(c) || matches!(c, ' ' | '\t')
}

impl Parse for NameAddr {
    fn parse(src: &Bytes) -> impl Fn(&str) -> IResult<&str, Self> + '_ {
        move |i| {
            map(
                tuple((
                    alt((
                        tuple((
                            opt(alt((
                                map(parse_quoted, |quoted| unescape_quoted(src, quoted)),
                                map(take_while1(display_token), |name: &str| {
                                    BytesStr::from_parse(src, name.trim())
                                }),
                            ))),
                            delimited(
                                tuple((skip_ws, tag("<"))),
                                SipUri::parse(src),
                                tag(">"),
                            ),
                        )),
                        // Without angle brackets any ;params belong to the header
                        map(SipUri::parse_no_params(src), |uri| (None, uri)),
                    )),
                    Params::<GPS>::parse(src),
                )),
                |((display_name, uri), params)| NameAddr {
                    display_name,
                    uri,
                    params,
                },
            )(i)
        }
    }
}
impl_from_str!(NameAddr, "name-addr");

/// Display adapter created by [`NameAddr::in_context`]
pub struct NameAddrInContext<'n> {
    name_addr: &'n NameAddr,
    ctx: UriContext,
}

impl fmt::Display for NameAddrInContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.name_addr.fmt_ctx(f, Some(self.ctx))
    }
}

impl fmt::Display for NameAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_ctx(f, None)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::host::Host;

    #[test]
    fn quoted_display_name() {
        let addr: NameAddr = r#""Bob \"B\" Smith" <sip:bob@example.com>;tag=1928"#
            .parse()
            .unwrap();

        assert_eq!(addr.display_name.as_ref().unwrap(), r#"Bob "B" Smith"#);
        assert_eq!(addr.uri.user.as_ref().unwrap(), "bob");
        assert_eq!(addr.get_param("tag").unwrap(), "1928");
        assert_eq!(
            addr.to_string(),
            r#""Bob \"B\" Smith" <sip:bob@example.com>;tag=1928"#
        );
    }

    #[test]
    fn token_display_name() {
        let addr: NameAddr = "Bob  Smith <sip:bob@example.com>".parse().unwrap();

        assert_eq!(addr.display_name.as_ref().unwrap(), "Bob  Smith");
        assert_eq!(addr.to_string(), r#""Bob  Smith" <sip:bob@example.com>"#);
    }

    #[test]
    fn bare_uri_params_belong_to_header() {
        let addr: NameAddr = "sip:alice@atlanta.example;tag=88sja8x".parse().unwrap();

        assert_eq!(addr.display_name, None);
        assert!(addr.uri.params.is_empty());
        assert_eq!(addr.get_param("tag").unwrap(), "88sja8x");
        assert_eq!(addr.uri.host_port.host, Host::Name("atlanta.example".into()));
    }

    #[test]
    fn uri_params_inside_brackets() {
        let addr: NameAddr = "<sip:alice@atlanta.example;transport=ws>;expires=60"
            .parse()
            .unwrap();

        assert_eq!(addr.uri.get_param("transport").unwrap(), "ws");
        assert_eq!(addr.get_param("expires").unwrap(), "60");
    }

    #[test]
    fn duplicate_params_keep_order() {
        let mut addr: NameAddr = "<sip:a@b>;x=1;y;x=2".parse().unwrap();

        assert_eq!(addr.to_string(), "<sip:a@b>;x=1;y;x=2");

        addr.set_param("x", Some("3"));
        addr.push_param("x", Some("4"));
        assert_eq!(addr.to_string(), "<sip:a@b>;x=3;y;x=2;x=4");
        assert_eq!(addr.get_param("x").unwrap(), "3");

        assert!(addr.delete_param("x"));
        assert_eq!(addr.to_string(), "<sip:a@b>;y");

        addr.clear_params();
        assert!(!addr.has_param("y"));
    }

    #[test]
    fn missing_uri_is_error() {
        assert!("Bob".parse::<NameAddr>().is_err());
        assert!("\"Bob\" <>".parse::<NameAddr>().is_err());
        assert!("<tel:+1234>".parse::<NameAddr>().is_err());
    }
}
