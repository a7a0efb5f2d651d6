//! Header map, header names and typed headers

use anyhow::{Context, Result};
use bytes::Bytes;
use bytesstr::BytesStr;
use internal::IResult;
use name::Name;

mod error;
pub(crate) mod headers;
pub(crate) mod name;

pub use error::HeaderError;
pub use headers::OneOrMore;

// ==== PARSE TRAITS ====

/// Assign a constant header name to a type.
///
/// Used by the `*_named` functions of [`Headers`](crate::Headers) so the caller
/// does not have to provide one.
pub trait ConstNamed {
    const NAME: Name;
}

/// Decode a header from one or more values
pub trait DecodeValues: Sized {
    /// `values` always yields at least one value
    fn decode<'i, I>(values: &mut I) -> Result<Self>
    where
        I: Iterator<Item = &'i BytesStr>;
}

/// Parse a single header value, implemented by every header that does not need to
/// look at more than one value
pub trait HeaderParse: Sized {
    fn parse<'i>(src: &'i Bytes, i: &'i str) -> IResult<&'i str, Self>;
}

// ==== PRINT TRAITS ====

/// Dynamic header name, used by [`Headers::insert_named`](crate::Headers::insert_named)
pub trait DynNamed {
    fn name(&self) -> Name;
}

impl<T: ConstNamed> DynNamed for T {
    fn name(&self) -> Name {
        T::NAME
    }
}

/// Insert a typed header into [`Headers`](crate::Headers)
pub trait ExtendValues {
    /// Called when there are existing values, implementations either replace or extend them
    fn extend_values(&self, values: &mut OneOrMore);

    /// Called when there are no existing values
    fn create_values(&self) -> OneOrMore;
}

// ==== BLANKET IMPL ====

impl<H: HeaderParse> DecodeValues for H {
    fn decode<'i, I>(values: &mut I) -> Result<Self>
    where
        I: Iterator<Item = &'i BytesStr>,
    {
        let value = values.next().context("no items in values")?;

        let (_, header) = H::parse(value.as_ref(), value.as_str())
            .map_err(|err| anyhow::anyhow!("{err}"))?;

        Ok(header)
    }
}

impl<H: ConstNamed> ConstNamed for Vec<H> {
    const NAME: Name = H::NAME;
}

/// Every value may contain multiple comma separated headers
impl<H: HeaderParse> DecodeValues for Vec<H> {
    fn decode<'i, I>(values: &mut I) -> Result<Self>
    where
        I: Iterator<Item = &'i BytesStr>,
    {
        let mut items = Vec::new();

        for value in values {
            let src: &Bytes = value.as_ref();
            let mut i = value.as_str();

            loop {
                let (remaining, header) =
                    H::parse(src, i).map_err(|err| anyhow::anyhow!("{err}"))?;

                items.push(header);

                let remaining = remaining.trim_start();

                match remaining.strip_prefix(',') {
                    Some(next) => i = next.trim_start(),
                    None => break,
                }
            }
        }

        Ok(items)
    }
}

impl<H: ExtendValues> ExtendValues for Vec<H> {
    fn extend_values(&self, values: &mut OneOrMore) {
        for item in self {
            item.extend_values(values);
        }
    }

    fn create_values(&self) -> OneOrMore {
        let mut iter = self.iter();

        let Some(first) = iter.next() else {
            return OneOrMore::More(Vec::new());
        };

        let mut values = first.create_values();

        for item in iter {
            item.extend_values(&mut values);
        }

        values
    }
}

/// Append `value` to the last value as comma separated list
pub(crate) fn extend_csv(values: &mut OneOrMore, value: impl std::fmt::Display) {
    match values.last_mut() {
        Some(last) => *last = format!("{last}, {value}").into(),
        None => values.push(value.to_string().into()),
    }
}

macro_rules! csv_header {
    ($(#[$meta:meta])* $struct_name:ident, $wrapping:ty, $header_name:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        pub struct $struct_name(pub $wrapping);

        impl $crate::header::ConstNamed for $struct_name {
            const NAME: $crate::Name = $header_name;
        }

        impl $crate::header::HeaderParse for $struct_name {
            fn parse<'i>(src: &'i bytes::Bytes, i: &'i str) -> internal::IResult<&'i str, Self> {
                let (value, rem) = match i.find(',') {
                    Some(comma_idx) => (&i[..comma_idx], &i[comma_idx..]),
                    None => (i, ""),
                };

                Ok((rem, Self(<$wrapping>::from_parse(src, value.trim()))))
            }
        }

        impl $crate::header::ExtendValues for $struct_name {
            fn extend_values(&self, values: &mut $crate::header::OneOrMore) {
                $crate::header::extend_csv(values, &self.0)
            }

            fn create_values(&self) -> $crate::header::OneOrMore {
                $crate::header::OneOrMore::One(self.0.to_string().into())
            }
        }
    };
}

macro_rules! number_header {
    ($(#[$meta:meta])* $struct_name:ident, $header_name:expr, $from_str_ty:ty) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $struct_name(pub $from_str_ty);

        impl $crate::header::ConstNamed for $struct_name {
            const NAME: $crate::Name = $header_name;
        }

        impl $crate::header::HeaderParse for $struct_name {
            fn parse<'i>(_: &'i bytes::Bytes, i: &'i str) -> internal::IResult<&'i str, Self> {
                nom::combinator::map_res(
                    internal::ws((nom::character::complete::digit1,)),
                    |(digits,): (&str,)| digits.parse().map(Self),
                )(i)
            }
        }

        impl $crate::header::ExtendValues for $struct_name {
            fn extend_values(&self, values: &mut $crate::header::OneOrMore) {
                *values = self.create_values()
            }

            fn create_values(&self) -> $crate::header::OneOrMore {
                $crate::header::OneOrMore::One(self.0.to_string().into())
            }
        }
    };
}

pub mod typed;
