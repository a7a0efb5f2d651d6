macro_rules! encode_set {
    ($fn:ident, $name:ident) => {
        lazy_static::lazy_static! {
            static ref $name: AsciiSet = {
                // '%' is accepted by parsers but must always be escaped when printing
                let mut set = percent_encoding::CONTROLS.add(b'%');

                for b in 0..=127u8 {
                    if !$fn(b as char) {
                        set = set.add(b);
                    }
                }

                set
            };
        }
    };
}

/// Implement [`FromStr`](std::str::FromStr) for a type implementing [`Parse`](crate::parse::Parse).
///
/// The whole input must be consumed by the parser.
macro_rules! impl_from_str {
    ($ty:ty, $kind:literal) => {
        impl std::str::FromStr for $ty {
            type Err = $crate::parse::ParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let src = bytesstr::BytesStr::from(s);

                let parsed = nom::combinator::all_consuming(
                    <$ty as $crate::parse::Parse>::parse(src.as_ref()),
                )(src.as_str());

                match parsed {
                    Ok((_, value)) => Ok(value),
                    Err(_) => Err($crate::parse::ParseError::new($kind, s)),
                }
            }
        }
    };
}
