//! Parser helpers shared between the sipline crates.

mod ws;

pub type IResult<I, O> = nom::IResult<I, O, nom::error::VerboseError<I>>;
pub use nom::Finish;
pub use ws::{skip_ws, ws};

/// Parser which consumes the complete input and returns it.
///
/// Used to take the rest of a header value after a fixed prefix was parsed.
pub fn rest<E>() -> impl Fn(&str) -> nom::IResult<&str, &str, E> {
    move |i| Ok(("", i))
}

/// Returns a parse error for `input` without any context, for parsers which
/// verify their output by hand.
pub fn fail<I, O>(input: I) -> IResult<I, O> {
    use nom::error::{ErrorKind, ParseError, VerboseError};

    Err(nom::Err::Error(VerboseError::from_error_kind(
        input,
        ErrorKind::Verify,
    )))
}

#[cfg(test)]
mod test {
    use super::*;
    use nom::bytes::complete::tag;

    #[test]
    fn ws_skips_leading_whitespace() {
        let (rem, (a, b)) = ws((tag::<_, _, nom::error::Error<&str>>("a"), tag("b")))(
            "  a \t b rest",
        )
        .unwrap();

        assert_eq!(a, "a");
        assert_eq!(b, "b");
        assert_eq!(rem, " rest");
    }

    #[test]
    fn rest_takes_everything() {
        let (rem, taken) = rest::<()>()("value;param").unwrap();

        assert!(rem.is_empty());
        assert_eq!(taken, "value;param");
    }
}
