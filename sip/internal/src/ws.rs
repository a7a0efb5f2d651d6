use nom::bytes::complete::take_while;
use nom::error::ParseError;
use nom::{IResult, InputIter, InputLength, InputTakeAtPosition};

/// Tuple of parsers that can be run by [`ws`]
pub trait WsTuple<I, O, E> {
    fn parse_ws(&mut self, i: I) -> IResult<I, O, E>;
}

/// Run a tuple of parsers in sequence, skipping whitespace in front of every one of them
#[inline]
pub fn ws<I, O, E, L>(mut l: L) -> impl FnMut(I) -> IResult<I, O, E>
where
    I: InputLength + InputIter + InputTakeAtPosition,
    <I as InputTakeAtPosition>::Item: Into<char>,
    E: ParseError<I>,
    L: WsTuple<I, O, E>,
{
    move |i: I| l.parse_ws(i)
}

/// Consume any leading whitespace (including line breaks of folded header lines)
pub fn skip_ws<I, E>(i: I) -> IResult<I, I, E>
where
    I: InputTakeAtPosition,
    <I as InputTakeAtPosition>::Item: Into<char>,
    E: ParseError<I>,
{
    take_while(is_ws)(i)
}

fn is_ws(c: impl Into<char>) -> bool {
    c.into().is_ascii_whitespace()
}

macro_rules! impl_ws_tuple {
    ($($out:ident $parser:ident),+) => {
        impl<Input, Error, $($out, $parser,)+> WsTuple<Input, ($($out,)+), Error> for ($($parser,)+)
        where
            Input: InputLength + InputIter + InputTakeAtPosition,
            <Input as InputTakeAtPosition>::Item: Into<char>,
            Error: ParseError<Input>,
            $($parser: FnMut(Input) -> IResult<Input, $out, Error>,)+
        {
            #[allow(non_snake_case)]
            fn parse_ws(&mut self, input: Input) -> IResult<Input, ($($out,)+), Error> {
                let ($($parser,)+) = self;

                $(
                let (input, _) = take_while(is_ws)(input)?;
                let (input, $out) = ($parser)(input)?;
                )+

                Ok((input, ($($out,)+)))
            }
        }
    };
}

impl_ws_tuple!(A FnA);
impl_ws_tuple!(A FnA, B FnB);
impl_ws_tuple!(A FnA, B FnB, C FnC);
impl_ws_tuple!(A FnA, B FnB, C FnC, D FnD);
impl_ws_tuple!(A FnA, B FnB, C FnC, D FnD, E FnE);
impl_ws_tuple!(A FnA, B FnB, C FnC, D FnD, E FnE, F FnF);
