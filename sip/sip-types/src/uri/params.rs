use crate::parse::{parse_quoted, token, unescape_quoted, write_quoted};
use bytes::Bytes;
use bytesstr::BytesStr;
use internal::IResult;
use internal::ws;
use nom::branch::alt;
use nom::bytes::complete::{tag, take_while, take_while1};
use nom::combinator::{map, map_res, opt};
use nom::multi::many0;
use nom::sequence::preceded;
use percent_encoding::{AsciiSet, percent_decode, percent_encode};
use std::borrow::Cow;
use std::fmt;
use std::marker::PhantomData;
use std::str::Utf8Error;

/// Ordered list of parameters, printed and parsed according to `S`
pub struct Params<S> {
    params: Vec<Param>,
    marker: PhantomData<S>,
}

impl<S> Clone for Params<S> {
    fn clone(&self) -> Self {
        Self {
            params: self.params.clone(),
            marker: self.marker,
        }
    }
}

impl<S> PartialEq for Params<S> {
    fn eq(&self, other: &Self) -> bool {
        self.params == other.params
    }
}

impl<S> Eq for Params<S> {}

impl<S: ParamsSpec> Params<S> {
    pub fn new() -> Params<S> {
        Params {
            params: Vec::new(),
            marker: PhantomData,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Param> + '_ {
        self.params.iter()
    }

    #[inline]
    pub fn with(mut self, param: Param) -> Self {
        self.push(param);
        self
    }

    /// Append `param`, even if a parameter with the same name exists
    #[inline]
    pub fn push(&mut self, param: Param) {
        self.params.push(param);
    }

    /// Returns the first parameter named `name`
    pub fn get<N: AsRef<str>>(&self, name: N) -> Option<&Param> {
        let name = name.as_ref();
        self.params.iter().find(|p| p.name.eq_ignore_ascii_case(name))
    }

    pub fn get_mut<N: AsRef<str>>(&mut self, name: N) -> Option<&mut Param> {
        let name = name.as_ref();
        self.params
            .iter_mut()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }

    /// Value of the first parameter named `name`, `None` if missing or valueless
    pub fn get_val<N: AsRef<str>>(&self, name: N) -> Option<&BytesStr> {
        self.get(name).and_then(|p| p.value.as_ref())
    }

    pub fn contains<N: AsRef<str>>(&self, name: N) -> bool {
        self.get(name).is_some()
    }

    /// Edit the value of the first parameter named `name` or append a new one
    pub fn set<N, V>(&mut self, name: N, value: Option<V>)
    where
        N: Into<BytesStr> + AsRef<str>,
        V: Into<BytesStr>,
    {
        let value = value.map(Into::into);

        if let Some(param) = self.get_mut(name.as_ref()) {
            param.value = value;
        } else {
            self.push(Param {
                name: name.into(),
                value,
            });
        }
    }

    /// Set a parameter that may only exist once, removing every other occurrence.
    /// The name is stored lowercase.
    pub fn set_unique<V>(&mut self, name: &str, value: Option<V>)
    where
        V: Into<BytesStr>,
    {
        let value = value.map(Into::into);
        let mut found = false;

        self.params.retain_mut(|param| {
            if !param.name.eq_ignore_ascii_case(name) {
                return true;
            }

            if found {
                return false;
            }

            found = true;
            param.value = value.clone();
            true
        });

        if !found {
            self.push(Param {
                name: name.to_ascii_lowercase().into(),
                value,
            });
        }
    }

    /// Remove every parameter named `name`, returns how many were removed
    pub fn remove<N: AsRef<str>>(&mut self, name: N) -> usize {
        let name = name.as_ref();
        let len = self.params.len();

        self.params.retain(|p| !p.name.eq_ignore_ascii_case(name));

        len - self.params.len()
    }

    /// Remove the first parameter named `name` and return its value
    pub fn take<N: AsRef<str>>(&mut self, name: N) -> Option<BytesStr> {
        let name = name.as_ref();
        let pos = self
            .params
            .iter()
            .position(|p| p.name.eq_ignore_ascii_case(name))?;

        self.params.remove(pos).value
    }

    pub fn clear(&mut self) {
        self.params.clear();
    }

    pub fn filtered_print<F>(&self, filter: F) -> FilteredPrint<'_, S, F>
    where
        F: Fn(&str) -> bool,
    {
        FilteredPrint {
            params: self,
            filter,
        }
    }

    pub(crate) fn parse(src: &Bytes) -> impl Fn(&str) -> IResult<&str, Self> + '_ {
        move |i| {
            map(
                opt(map(
                    ws((
                        tag(S::FIRST_DELIMITER),
                        Param::parse::<S>(src),
                        many0(map(
                            ws((tag(S::DELIMITER), Param::parse::<S>(src))),
                            |(_, param)| param,
                        )),
                    )),
                    |(_, first, mut params)| {
                        params.insert(0, first);
                        Params {
                            params,
                            marker: PhantomData,
                        }
                    },
                )),
                Option::unwrap_or_default,
            )(i)
        }
    }
}

impl<S: ParamsSpec> fmt::Debug for Params<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(&self.params).finish()
    }
}

impl<S: ParamsSpec> fmt::Display for Params<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.filtered_print(|_| true).fmt(f)
    }
}

/// Prints [`Params`] while skipping every parameter rejected by the filter
pub struct FilteredPrint<'p, S, F>
where
    S: ParamsSpec,
    F: Fn(&str) -> bool,
{
    params: &'p Params<S>,
    filter: F,
}

impl<S, F> fmt::Display for FilteredPrint<'_, S, F>
where
    S: ParamsSpec,
    F: Fn(&str) -> bool,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;

        for param in &self.params.params {
            if !(self.filter)(&param.name) {
                continue;
            }

            if first {
                first = false;
                f.write_str(S::FIRST_DELIMITER)?;
            } else {
                f.write_str(S::DELIMITER)?;
            }

            param.write::<S>(f)?;
        }

        Ok(())
    }
}

impl<S> Default for Params<S> {
    fn default() -> Self {
        Params {
            params: Vec::new(),
            marker: PhantomData,
        }
    }
}

/// How names and values outside of [`ParamsSpec::CHAR_SPEC`] are represented
pub enum Coding {
    /// `%XX` escapes, decoded when parsing
    Percent(fn() -> &'static AsciiSet),
    /// Values are written as quoted-strings when needed
    Quoted,
}

/// Specification how the parameters in [`Params`] are parsed and printed
pub trait ParamsSpec {
    const FIRST_DELIMITER: &'static str;
    const DELIMITER: &'static str;
    const CHAR_SPEC: fn(char) -> bool;
    const CODING: Coding;
}

/// URI header parameters (`?Subject=hello&Priority=urgent`)
pub enum HPS {}

#[rustfmt::skip]
fn header_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '%' | '[' | ']' | '/' | '?' | ':' | '+' | '$' | '-' | '_' | '.' | '!' | '~' | '*' | '\'' | '(' | ')')
}

encode_set!(header_char, HPS_SET);

impl ParamsSpec for HPS {
    const FIRST_DELIMITER: &'static str = "?";
    const DELIMITER: &'static str = "&";
    const CHAR_SPEC: fn(char) -> bool = header_char;
    const CODING: Coding = Coding::Percent(|| &HPS_SET);
}

/// URI parameters (`;transport=ws;lr`)
pub enum CPS {}

#[rustfmt::skip]
fn param_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '%' | '-' | '_' | '.' | '!' | '~' | '*' | '\'' | '(' | ')' | '[' | ']' | '/' | ':' | '&' | '+' | '$')
}

encode_set!(param_char, CPS_SET);

impl ParamsSpec for CPS {
    const FIRST_DELIMITER: &'static str = ";";
    const DELIMITER: &'static str = ";";
    const CHAR_SPEC: fn(char) -> bool = param_char;
    const CODING: Coding = Coding::Percent(|| &CPS_SET);
}

/// Generic header parameters (`;tag=a6c85cf;+sip.instance="<urn:uuid:..>"`)
pub enum GPS {}

fn generic_char(c: char) -> bool {
    token(c) || matches!(c, ':' | '[' | ']')
}

impl ParamsSpec for GPS {
    const FIRST_DELIMITER: &'static str = ";";
    const DELIMITER: &'static str = ";";
    const CHAR_SPEC: fn(char) -> bool = generic_char;
    const CODING: Coding = Coding::Quoted;
}

/// A single parameter `name[=value]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    pub name: BytesStr,
    pub value: Option<BytesStr>,
}

impl Param {
    #[inline]
    pub fn name<N>(name: N) -> Param
    where
        N: Into<BytesStr>,
    {
        Param {
            name: name.into(),
            value: None,
        }
    }

    #[inline]
    pub fn value<N, V>(name: N, value: V) -> Param
    where
        N: Into<BytesStr>,
        V: Into<BytesStr>,
    {
        Param {
            name: name.into(),
            value: Some(value.into()),
        }
    }

    fn write<S: ParamsSpec>(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match S::CODING {
            Coding::Percent(set) => {
                write!(f, "{}", percent_encode(self.name.as_bytes(), set()))?;

                if let Some(value) = &self.value {
                    write!(f, "={}", percent_encode(value.as_bytes(), set()))?;
                }
            }
            Coding::Quoted => {
                f.write_str(&self.name)?;

                if let Some(value) = &self.value {
                    f.write_str("=")?;

                    if !value.is_empty() && value.chars().all(S::CHAR_SPEC) {
                        f.write_str(value)?;
                    } else {
                        write_quoted(f, value)?;
                    }
                }
            }
        }

        Ok(())
    }

    fn parse<S: ParamsSpec>(src: &Bytes) -> impl Fn(&str) -> IResult<&str, Self> + '_ {
        move |i| match S::CODING {
            Coding::Percent(_) => map_res(
                ws((
                    take_while1(S::CHAR_SPEC),
                    opt(preceded(ws((tag("="),)), take_while(S::CHAR_SPEC))),
                )),
                move |(name, value)| -> Result<_, Utf8Error> {
                    Ok(Param {
                        name: decode(src, name)?,
                        value: value.map(|value| decode(src, value)).transpose()?,
                    })
                },
            )(i),
            Coding::Quoted => map(
                ws((
                    take_while1(S::CHAR_SPEC),
                    opt(preceded(
                        ws((tag("="),)),
                        alt((
                            map(parse_quoted, |quoted| unescape_quoted(src, quoted)),
                            map(take_while(S::CHAR_SPEC), |value| {
                                BytesStr::from_parse(src, value)
                            }),
                        )),
                    )),
                )),
                |(name, value)| Param {
                    name: BytesStr::from_parse(src, name),
                    value,
                },
            )(i),
        }
    }
}

fn decode(src: &Bytes, encoded: &str) -> Result<BytesStr, Utf8Error> {
    Ok(match percent_decode(encoded.as_bytes()).decode_utf8()? {
        Cow::Borrowed(slice) => BytesStr::from_parse(src, slice),
        Cow::Owned(owned) => BytesStr::from(owned),
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn uri_params_parse() {
        let input = BytesStr::from_static(";lr;transport=ws");

        let (rem, params) = Params::<CPS>::parse(input.as_ref())(&input).unwrap();

        assert!(rem.is_empty());
        assert!(params.contains("lr"));
        assert_eq!(params.get_val("lr"), None);
        assert_eq!(params.get_val("TRANSPORT").unwrap(), "ws");
    }

    #[test]
    fn uri_params_encode_roundtrip() {
        let params = Params::<CPS>::new().with(Param::value("note", "50% off;now"));

        let printed = params.to_string();
        assert_eq!(printed, ";note=50%25%20off%3Bnow");

        let src = BytesStr::from(printed);
        let (_, parsed) = Params::<CPS>::parse(src.as_ref())(&src).unwrap();
        assert_eq!(parsed, params);
    }

    #[test]
    fn uri_header_params() {
        let src = BytesStr::from_static("?subject=project%20x&priority=urgent");
        let (rem, params) = Params::<HPS>::parse(src.as_ref())(&src).unwrap();

        assert!(rem.is_empty());
        assert_eq!(params.get_val("subject").unwrap(), "project x");
        assert_eq!(params.to_string(), "?subject=project%20x&priority=urgent");
    }

    #[test]
    fn generic_params_quoted() {
        let src = BytesStr::from_static(r#";tag=abc;+sip.instance="<urn:uuid:f81d>";lr"#);
        let (rem, params) = Params::<GPS>::parse(src.as_ref())(&src).unwrap();

        assert!(rem.is_empty());
        assert_eq!(params.get_val("+sip.instance").unwrap(), "<urn:uuid:f81d>");
        assert_eq!(params.to_string(), src.as_str());
    }

    #[test]
    fn set_edits_first_occurrence() {
        let mut params = Params::<GPS>::new()
            .with(Param::value("x", "1"))
            .with(Param::value("x", "2"));

        params.set("x", Some("3"));
        assert_eq!(params.to_string(), ";x=3;x=2");

        params.set_unique("X", Some("4"));
        assert_eq!(params.to_string(), ";x=4");

        assert_eq!(params.remove("x"), 1);
        assert!(params.is_empty());
    }
}
