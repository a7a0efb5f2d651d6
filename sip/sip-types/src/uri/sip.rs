use crate::host::{Host, HostPort};
use crate::parse::{Parse, ParseError};
use crate::print::UriContext;
use crate::uri::params::{CPS, HPS, Param, Params};
use bytes::Bytes;
use bytesstr::BytesStr;
use internal::IResult;
use nom::branch::alt;
use nom::bytes::complete::{tag, tag_no_case, take_while, take_while1};
use nom::combinator::{map, map_res, opt};
use nom::error::context;
use nom::sequence::{preceded, terminated, tuple};
use percent_encoding::{AsciiSet, percent_decode_str, percent_encode};
use std::borrow::Cow;
use std::fmt;
use std::str::{FromStr, Utf8Error};

/// URI scheme, only `sip` and `sips` are supported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Sip,
    Sips,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Sip => "sip",
            Scheme::Sips => "sips",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scheme {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("sip") {
            Ok(Scheme::Sip)
        } else if s.eq_ignore_ascii_case("sips") {
            Ok(Scheme::Sips)
        } else {
            Err(ParseError::new("scheme", s))
        }
    }
}

/// `sip:user:password@host:port;params?headers`
///
/// URI parameters are unique and stored with lowercase names, setting an existing
/// parameter replaces it. URI headers may carry several values per name.
#[derive(Clone, PartialEq, Eq)]
pub struct SipUri {
    pub scheme: Scheme,
    pub user: Option<BytesStr>,
    pub password: Option<BytesStr>,
    pub host_port: HostPort,
    pub params: Params<CPS>,
    pub headers: Params<HPS>,
}

impl SipUri {
    pub fn new(host_port: HostPort) -> Self {
        SipUri {
            scheme: Scheme::Sip,
            user: None,
            password: None,
            host_port,
            params: Params::new(),
            headers: Params::new(),
        }
    }

    /// Build an URI from its components
    ///
    /// ```
    /// use sipline_sip_types::uri::SipUri;
    ///
    /// let uri = SipUri::from_parts("sip", Some("alice"), "example.com", Some(5060)).unwrap();
    /// assert_eq!(uri.to_string(), "sip:alice@example.com:5060");
    /// ```
    pub fn from_parts(
        scheme: &str,
        user: Option<&str>,
        host: &str,
        port: Option<u16>,
    ) -> Result<Self, ParseError> {
        let scheme = scheme.parse()?;
        let host = Host::from_str(host)?;

        if user.is_some_and(str::is_empty) {
            return Err(ParseError::new("user", ""));
        }

        Ok(SipUri {
            scheme,
            user: user.map(BytesStr::from),
            password: None,
            host_port: HostPort::new(host, port),
            params: Params::new(),
            headers: Params::new(),
        })
    }

    pub fn with_user<U: Into<BytesStr>>(mut self, user: U) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_scheme(mut self, scheme: Scheme) -> Self {
        self.scheme = scheme;
        self
    }

    pub fn with_param(mut self, name: &str, value: Option<&str>) -> Self {
        self.set_param(name, value);
        self
    }

    pub fn is_sips(&self) -> bool {
        self.scheme == Scheme::Sips
    }

    /// Set or replace a parameter, `None` sets a valueless flag (e.g. `lr`)
    pub fn set_param(&mut self, name: &str, value: Option<&str>) {
        self.params.set_unique(name, value.map(BytesStr::from));
    }

    /// Value of the parameter, `None` if it is missing or a valueless flag
    pub fn get_param(&self, name: &str) -> Option<&BytesStr> {
        self.params.get_val(name)
    }

    pub fn has_param(&self, name: &str) -> bool {
        self.params.contains(name)
    }

    /// Returns if the parameter existed
    pub fn delete_param(&mut self, name: &str) -> bool {
        self.params.remove(name) > 0
    }

    pub fn clear_params(&mut self) {
        self.params.clear();
    }

    /// Replace all values of the URI header `name`
    pub fn set_header<I, V>(&mut self, name: &str, values: I)
    where
        I: IntoIterator<Item = V>,
        V: Into<BytesStr>,
    {
        self.headers.remove(name);

        for value in values {
            self.headers.push(Param::value(name, value));
        }
    }

    /// All values of the URI header `name` in order, `None` if it is not present
    pub fn get_header(&self, name: &str) -> Option<Vec<&BytesStr>> {
        let values: Vec<&BytesStr> = self
            .headers
            .iter()
            .filter(|param| param.name.eq_ignore_ascii_case(name))
            .filter_map(|param| param.value.as_ref())
            .collect();

        if values.is_empty() && !self.headers.contains(name) {
            None
        } else {
            Some(values)
        }
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.headers.contains(name)
    }

    pub fn delete_header(&mut self, name: &str) -> bool {
        self.headers.remove(name) > 0
    }

    pub fn clear_headers(&mut self) {
        self.headers.clear();
    }

    /// Compare only scheme, user and host-port, ignoring parameters and headers
    pub fn same_address(&self, other: &Self) -> bool {
        self.scheme == other.scheme
            && self.user == other.user
            && self.host_port == other.host_port
    }

    /// Print the URI with only the components allowed in `ctx`
    pub fn in_context(&self, ctx: UriContext) -> InContext<'_> {
        InContext { uri: self, ctx }
    }

    fn fmt_ctx(&self, f: &mut fmt::Formatter<'_>, ctx: Option<UriContext>) -> fmt::Result {
        write!(f, "{}:", self.scheme)?;

        if let Some(user) = &self.user {
            write!(f, "{}", percent_encode(user.as_bytes(), &USER_SET))?;

            if let Some(password) = &self.password {
                write!(f, ":{}", percent_encode(password.as_bytes(), &PASSWORD_SET))?;
            }

            f.write_str("@")?;
        }

        write!(f, "{}", self.host_port)?;

        match ctx {
            None => write!(f, "{}{}", self.params, self.headers),
            Some(ctx) => {
                write!(
                    f,
                    "{}",
                    self.params.filtered_print(|name| ctx.allows_param(name))
                )?;

                if ctx.allows_headers() {
                    write!(f, "{}", self.headers)?;
                }

                Ok(())
            }
        }
    }

    pub(crate) fn parse_no_params(src: &Bytes) -> impl Fn(&str) -> IResult<&str, Self> + '_ {
        move |i| {
            map_res(
                tuple((parse_scheme, parse_user_pw, HostPort::parse(src))),
                |(scheme, user_pw, host_port)| -> Result<SipUri, Utf8Error> {
                    let (user, password) = user_part(src, user_pw)?;

                    Ok(SipUri {
                        scheme,
                        user,
                        password,
                        host_port,
                        params: Params::new(),
                        headers: Params::new(),
                    })
                },
            )(i)
        }
    }
}

/// Display adapter created by [`SipUri::in_context`]
pub struct InContext<'u> {
    uri: &'u SipUri,
    ctx: UriContext,
}

impl fmt::Display for InContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.uri.fmt_ctx(f, Some(self.ctx))
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_ctx(f, None)
    }
}

impl fmt::Debug for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SipUri({self})")
    }
}

encode_set!(user, USER_SET);
encode_set!(password, PASSWORD_SET);

#[rustfmt::skip]
fn user(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '!' | '~' | '*' | '\'' | '(' | ')' | '%' | '&' | '=' | '+' | '$' | ',' | ';' | '?' | '/')
}

#[rustfmt::skip]
fn password(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '!' | '~' | '*' | '\'' | '(' | ')' | '%' | '&' | '=' | '+' | '$' | ',')
}

impl Parse for SipUri {
    fn parse(src: &Bytes) -> impl Fn(&str) -> IResult<&str, Self> + '_ {
        move |i| {
            context(
                "sip uri",
                map(
                    tuple((
                        SipUri::parse_no_params(src),
                        Params::<CPS>::parse(src),
                        Params::<HPS>::parse(src),
                    )),
                    |(mut uri, params, headers)| {
                        // Parameters are unique, the last occurrence wins
                        for param in params.iter() {
                            uri.params.set_unique(&param.name, param.value.clone());
                        }

                        uri.headers = headers;
                        uri
                    },
                ),
            )(i)
        }
    }
}
impl_from_str!(SipUri, "sip uri");

fn user_part(
    src: &Bytes,
    user_pw: Option<(&str, Option<&str>)>,
) -> Result<(Option<BytesStr>, Option<BytesStr>), Utf8Error> {
    let Some((user, password)) = user_pw else {
        return Ok((None, None));
    };

    let user = decode(src, user)?;
    let password = password.map(|password| decode(src, password)).transpose()?;

    Ok((Some(user), password))
}

fn decode(src: &Bytes, encoded: &str) -> Result<BytesStr, Utf8Error> {
    Ok(match percent_decode_str(encoded).decode_utf8()? {
        Cow::Borrowed(slice) => BytesStr::from_parse(src, slice),
        Cow::Owned(owned) => BytesStr::from(owned),
    })
}

fn parse_scheme(i: &str) -> IResult<&str, Scheme> {
    alt((
        map(tag_no_case("sips:"), |_| Scheme::Sips),
        map(tag_no_case("sip:"), |_| Scheme::Sip),
    ))(i)
}

fn parse_user_pw(i: &str) -> IResult<&str, Option<(&str, Option<&str>)>> {
    opt(terminated(
        tuple((
            take_while1(user),
            opt(preceded(tag(":"), take_while(password))),
        )),
        tag("@"),
    ))(i)
}
