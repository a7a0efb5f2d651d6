//! `WWW-Authenticate`, `Proxy-Authenticate`, `Authorization` and `Proxy-Authorization`
//! headers carrying HTTP digest credentials ([RFC 2617](https://datatracker.ietf.org/doc/html/rfc2617))

use crate::header::{ExtendValues, HeaderParse, OneOrMore};
use crate::parse::{parse_quoted, token, unescape_quoted, write_quoted};
use anyhow::Context;
use bytes::Bytes;
use bytesstr::BytesStr;
use internal::{IResult, ws};
use nom::branch::alt;
use nom::bytes::complete::{tag, take_while1};
use nom::combinator::{map, map_res};
use nom::multi::many0;
use nom::sequence::tuple;
use std::fmt;

/// `name=value` pair of an auth header, the value is unquoted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthParam {
    pub name: BytesStr,
    pub value: BytesStr,
}

impl AuthParam {
    fn parse(src: &Bytes) -> impl Fn(&str) -> IResult<&str, Self> + '_ {
        move |i| {
            map(
                ws((
                    take_while1(token),
                    tag("="),
                    alt((
                        map(parse_quoted, |quoted| unescape_quoted(src, quoted)),
                        map(take_while1(token), |value| BytesStr::from_parse(src, value)),
                    )),
                )),
                |(name, _, value)| AuthParam {
                    name: BytesStr::from_parse(src, name),
                    value,
                },
            )(i)
        }
    }
}

impl fmt::Display for AuthParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}=", self.name)?;
        write_quoted(f, &self.value)
    }
}

/// `scheme param, param, ...`
fn parse_scheme_and_params(
    src: &Bytes,
) -> impl Fn(&str) -> IResult<&str, (&str, Vec<AuthParam>)> + '_ {
    move |i| {
        map(
            tuple((
                ws((take_while1(token), AuthParam::parse(src))),
                many0(map(ws((tag(","), AuthParam::parse(src))), |(_, param)| {
                    param
                })),
            )),
            |((scheme, first), mut params)| {
                params.insert(0, first);
                (scheme, params)
            },
        )(i)
    }
}

fn write_params(f: &mut fmt::Formatter<'_>, params: &[AuthParam]) -> fmt::Result {
    for param in params {
        write!(f, ", {param}")?;
    }

    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Algorithm {
    MD5,
    MD5Sess,
    Other(BytesStr),
}

impl From<BytesStr> for Algorithm {
    fn from(value: BytesStr) -> Self {
        if value.eq_ignore_ascii_case("MD5") {
            Self::MD5
        } else if value.eq_ignore_ascii_case("MD5-sess") {
            Self::MD5Sess
        } else {
            Self::Other(value)
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Algorithm::MD5 => f.write_str("MD5"),
            Algorithm::MD5Sess => f.write_str("MD5-sess"),
            Algorithm::Other(other) => f.write_str(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QopOption {
    Auth,
    AuthInt,
    Other(BytesStr),
}

impl From<BytesStr> for QopOption {
    fn from(value: BytesStr) -> Self {
        match value.as_str() {
            "auth" => Self::Auth,
            "auth-int" => Self::AuthInt,
            _ => Self::Other(value),
        }
    }
}

impl fmt::Display for QopOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QopOption::Auth => f.write_str("auth"),
            QopOption::AuthInt => f.write_str("auth-int"),
            QopOption::Other(other) => f.write_str(other),
        }
    }
}

/// Challenge found in `WWW-Authenticate` and `Proxy-Authenticate`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthChallenge {
    Digest(DigestChallenge),
    Other {
        scheme: BytesStr,
        params: Vec<AuthParam>,
    },
}

impl HeaderParse for AuthChallenge {
    fn parse<'i>(src: &'i Bytes, i: &'i str) -> IResult<&'i str, Self> {
        map_res(
            parse_scheme_and_params(src),
            |(scheme, params)| -> anyhow::Result<Self> {
                if scheme.eq_ignore_ascii_case("Digest") {
                    DigestChallenge::from_params(params).map(Self::Digest)
                } else {
                    Ok(Self::Other {
                        scheme: BytesStr::from_parse(src, scheme),
                        params,
                    })
                }
            },
        )(i)
    }
}

impl ExtendValues for AuthChallenge {
    fn extend_values(&self, values: &mut OneOrMore) {
        values.push(self.to_string().into());
    }

    fn create_values(&self) -> OneOrMore {
        OneOrMore::One(self.to_string().into())
    }
}

impl fmt::Display for AuthChallenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthChallenge::Digest(digest) => fmt::Display::fmt(digest, f),
            AuthChallenge::Other { scheme, params } => {
                write!(f, "{scheme} ")?;

                let (first, rest) = params.split_first().ok_or(fmt::Error)?;
                write!(f, "{first}")?;
                write_params(f, rest)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: BytesStr,
    pub domain: Option<BytesStr>,
    pub nonce: BytesStr,
    pub opaque: Option<BytesStr>,
    /// The previous request used an outdated nonce but valid credentials
    pub stale: bool,
    pub algorithm: Algorithm,
    pub qop: Vec<QopOption>,
    pub other: Vec<AuthParam>,
}

impl DigestChallenge {
    fn from_params(params: Vec<AuthParam>) -> anyhow::Result<Self> {
        let mut realm = None;
        let mut domain = None;
        let mut nonce = None;
        let mut opaque = None;
        let mut stale = false;
        let mut algorithm = Algorithm::MD5;
        let mut qop = vec![];
        let mut other = vec![];

        for param in params {
            match param.name.to_ascii_lowercase().as_str() {
                "realm" => realm = Some(param.value),
                "domain" => domain = Some(param.value),
                "nonce" => nonce = Some(param.value),
                "opaque" => opaque = Some(param.value),
                "stale" => stale = param.value.eq_ignore_ascii_case("true"),
                "algorithm" => algorithm = Algorithm::from(param.value),
                "qop" => qop.extend(
                    param
                        .value
                        .split(',')
                        .map(str::trim)
                        .filter(|v| !v.is_empty())
                        .map(|v| QopOption::from(param.value.slice_ref(v))),
                ),
                _ => other.push(param),
            }
        }

        Ok(Self {
            realm: realm.context("missing realm in digest challenge")?,
            domain,
            nonce: nonce.context("missing nonce in digest challenge")?,
            opaque,
            stale,
            algorithm,
            qop,
            other,
        })
    }
}

impl fmt::Display for DigestChallenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Digest realm=")?;
        write_quoted(f, &self.realm)?;
        f.write_str(", nonce=")?;
        write_quoted(f, &self.nonce)?;

        if let Some(domain) = &self.domain {
            f.write_str(", domain=")?;
            write_quoted(f, domain)?;
        }

        if let Some(opaque) = &self.opaque {
            f.write_str(", opaque=")?;
            write_quoted(f, opaque)?;
        }

        if self.stale {
            f.write_str(", stale=true")?;
        }

        if self.algorithm != Algorithm::MD5 {
            write!(f, ", algorithm={}", self.algorithm)?;
        }

        if let Some((first, rest)) = self.qop.split_first() {
            write!(f, ", qop=\"{first}")?;

            for qop in rest {
                write!(f, ",{qop}")?;
            }

            f.write_str("\"")?;
        }

        write_params(f, &self.other)
    }
}

/// Credentials found in `Authorization` and `Proxy-Authorization`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResponse {
    Digest(DigestResponse),
    Other {
        scheme: BytesStr,
        params: Vec<AuthParam>,
    },
}

impl AuthResponse {
    pub fn realm(&self) -> Option<&BytesStr> {
        match self {
            AuthResponse::Digest(digest) => Some(&digest.realm),
            AuthResponse::Other { params, .. } => params
                .iter()
                .find(|p| p.name.eq_ignore_ascii_case("realm"))
                .map(|p| &p.value),
        }
    }
}

impl HeaderParse for AuthResponse {
    fn parse<'i>(src: &'i Bytes, i: &'i str) -> IResult<&'i str, Self> {
        map_res(
            parse_scheme_and_params(src),
            |(scheme, params)| -> anyhow::Result<Self> {
                if scheme.eq_ignore_ascii_case("Digest") {
                    DigestResponse::from_params(params).map(Self::Digest)
                } else {
                    Ok(Self::Other {
                        scheme: BytesStr::from_parse(src, scheme),
                        params,
                    })
                }
            },
        )(i)
    }
}

impl ExtendValues for AuthResponse {
    fn extend_values(&self, values: &mut OneOrMore) {
        values.push(self.to_string().into());
    }

    fn create_values(&self) -> OneOrMore {
        OneOrMore::One(self.to_string().into())
    }
}

impl fmt::Display for AuthResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthResponse::Digest(digest) => fmt::Display::fmt(digest, f),
            AuthResponse::Other { scheme, params } => {
                write!(f, "{scheme} ")?;

                let (first, rest) = params.split_first().ok_or(fmt::Error)?;
                write!(f, "{first}")?;
                write_params(f, rest)
            }
        }
    }
}

/// `qop`, `cnonce` and `nc` of a digest response, only present if the challenge offered a qop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QopResponse {
    pub qop: QopOption,
    pub cnonce: BytesStr,
    pub nc: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestResponse {
    pub username: BytesStr,
    pub realm: BytesStr,
    pub nonce: BytesStr,
    pub uri: BytesStr,
    pub response: BytesStr,
    pub algorithm: Algorithm,
    pub opaque: Option<BytesStr>,
    pub qop_response: Option<QopResponse>,
    pub other: Vec<AuthParam>,
}

impl DigestResponse {
    fn from_params(params: Vec<AuthParam>) -> anyhow::Result<Self> {
        let mut username = None;
        let mut realm = None;
        let mut nonce = None;
        let mut uri = None;
        let mut response = None;
        let mut algorithm = Algorithm::MD5;
        let mut opaque = None;
        let mut qop = None;
        let mut cnonce = None;
        let mut nc = None;
        let mut other = vec![];

        for param in params {
            match param.name.to_ascii_lowercase().as_str() {
                "username" => username = Some(param.value),
                "realm" => realm = Some(param.value),
                "nonce" => nonce = Some(param.value),
                "uri" => uri = Some(param.value),
                "response" => response = Some(param.value),
                "algorithm" => algorithm = Algorithm::from(param.value),
                "opaque" => opaque = Some(param.value),
                "qop" => qop = Some(QopOption::from(param.value)),
                "cnonce" => cnonce = Some(param.value),
                "nc" => nc = Some(param.value),
                _ => other.push(param),
            }
        }

        let qop_response = match qop {
            Some(qop) => Some(QopResponse {
                qop,
                cnonce: cnonce.context("missing cnonce in digest response")?,
                nc: u32::from_str_radix(&nc.context("missing nc in digest response")?, 16)
                    .context("invalid nc in digest response")?,
            }),
            None => None,
        };

        Ok(Self {
            username: username.context("missing username in digest response")?,
            realm: realm.context("missing realm in digest response")?,
            nonce: nonce.context("missing nonce in digest response")?,
            uri: uri.context("missing uri in digest response")?,
            response: response.context("missing response in digest response")?,
            algorithm,
            opaque,
            qop_response,
            other,
        })
    }
}

impl fmt::Display for DigestResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Digest username=")?;
        write_quoted(f, &self.username)?;
        f.write_str(", realm=")?;
        write_quoted(f, &self.realm)?;
        f.write_str(", nonce=")?;
        write_quoted(f, &self.nonce)?;
        write!(f, ", uri=\"{}\", response=\"{}\"", self.uri, self.response)?;

        if self.algorithm != Algorithm::MD5 {
            write!(f, ", algorithm={}", self.algorithm)?;
        }

        if let Some(opaque) = &self.opaque {
            f.write_str(", opaque=")?;
            write_quoted(f, opaque)?;
        }

        if let Some(QopResponse { qop, cnonce, nc }) = &self.qop_response {
            write!(f, ", qop={qop}, cnonce=\"{cnonce}\", nc={nc:08x}")?;
        }

        write_params(f, &self.other)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{Headers, Name};

    #[test]
    fn parse_digest_challenge() {
        let mut headers = Headers::new();
        headers.insert(
            Name::WWW_AUTHENTICATE,
            r#"Digest realm="atlanta.example", qop="auth, auth-int", nonce="ea9c8e88df84f1cec4341ae6cbe5a359", opaque="", stale=FALSE, algorithm=MD5"#,
        );

        let challenge: AuthChallenge = headers.get(Name::WWW_AUTHENTICATE).unwrap();

        let AuthChallenge::Digest(digest) = challenge else {
            panic!("expected digest challenge")
        };

        assert_eq!(digest.realm, "atlanta.example");
        assert_eq!(digest.nonce, "ea9c8e88df84f1cec4341ae6cbe5a359");
        assert_eq!(digest.opaque.as_ref().unwrap(), "");
        assert!(!digest.stale);
        assert_eq!(digest.algorithm, Algorithm::MD5);
        assert_eq!(digest.qop, vec![QopOption::Auth, QopOption::AuthInt]);
        assert!(digest.other.is_empty());
    }

    #[test]
    fn print_digest_challenge() {
        let challenge = AuthChallenge::Digest(DigestChallenge {
            realm: "atlanta.example".into(),
            domain: None,
            nonce: "abc".into(),
            opaque: None,
            stale: true,
            algorithm: Algorithm::MD5Sess,
            qop: vec![QopOption::Auth],
            other: vec![],
        });

        assert_eq!(
            challenge.to_string(),
            r#"Digest realm="atlanta.example", nonce="abc", stale=true, algorithm=MD5-sess, qop="auth""#
        );
    }

    #[test]
    fn challenge_without_nonce_is_malformed() {
        let mut headers = Headers::new();
        headers.insert(Name::PROXY_AUTHENTICATE, r#"Digest realm="atlanta.example""#);

        assert!(headers.get::<AuthChallenge>(Name::PROXY_AUTHENTICATE).is_err());
    }

    #[test]
    fn multiple_schemes_in_one_value() {
        let mut headers = Headers::new();
        headers.insert(
            Name::WWW_AUTHENTICATE,
            r#"Basic realm="x", Digest realm="y", nonce="n""#,
        );

        let challenges: Vec<AuthChallenge> = headers.get(Name::WWW_AUTHENTICATE).unwrap();

        assert_eq!(challenges.len(), 2);
        assert!(matches!(&challenges[0], AuthChallenge::Other { scheme, .. } if scheme == "Basic"));
        assert!(matches!(&challenges[1], AuthChallenge::Digest(d) if d.realm == "y"));
    }

    #[test]
    fn digest_response_roundtrip() {
        let response = DigestResponse {
            username: "bob".into(),
            realm: "biloxi.example".into(),
            nonce: "dcd98b7102dd2f0e8b11d0f600bfb0c093".into(),
            uri: "sip:bob@biloxi.example".into(),
            response: "245f23415f11432b3434341c022".into(),
            algorithm: Algorithm::MD5,
            opaque: Some("5ccc069c403ebaf9f0171e9517f40e41".into()),
            qop_response: Some(QopResponse {
                qop: QopOption::Auth,
                cnonce: "0a4f113b".into(),
                nc: 1,
            }),
            other: vec![],
        };

        let mut headers = Headers::new();
        headers.insert_type(Name::AUTHORIZATION, &AuthResponse::Digest(response.clone()));

        assert_eq!(
            headers.to_string(),
            "Authorization: Digest username=\"bob\", realm=\"biloxi.example\", nonce=\"dcd98b7102dd2f0e8b11d0f600bfb0c093\", uri=\"sip:bob@biloxi.example\", response=\"245f23415f11432b3434341c022\", opaque=\"5ccc069c403ebaf9f0171e9517f40e41\", qop=auth, cnonce=\"0a4f113b\", nc=00000001\r\n"
        );

        let parsed: AuthResponse = headers.get(Name::AUTHORIZATION).unwrap();
        assert_eq!(parsed, AuthResponse::Digest(response));
        assert_eq!(parsed.realm().unwrap(), "biloxi.example");
    }
}
