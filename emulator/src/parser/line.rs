//! Line-level parsers for the image format.
//!
//! These only recognize the shape of a line: integers, the optional comma
//! between operands, and the `index MNEMONIC operands` layout. Mnemonic
//! lookup and operand-count checks happen in the parent module, where the
//! errors can carry line numbers.

use nom::branch::alt;
use nom::bytes::complete::{take_while, take_while1};
use nom::character::complete::{char, digit1, space0, space1};
use nom::combinator::{map, map_res, opt, recognize};
use nom::multi::many0;
use nom::sequence::{delimited, pair, preceded};
use nom::IResult;

use crate::constants::Word;

/// Raw shape of an instruction line, before mnemonic lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RawInstruction<'a> {
    pub index: Word,
    pub mnemonic: &'a str,
    pub subtype: Option<&'a str>,
    pub operands: Vec<Word>,
}

/// Parse a signed decimal integer
pub(crate) fn integer(input: &str) -> IResult<&str, Word> {
    map_res(recognize(pair(opt(char('-')), digit1)), str::parse)(input)
}

/// Operand separator: a comma with optional spaces around it, or spaces
fn separator(input: &str) -> IResult<&str, ()> {
    alt((
        map(delimited(space0, char(','), space0), |_| ()),
        map(space1, |_| ()),
    ))(input)
}

// letters with an optional digit tail, so CPYI2 reads as one token while
// integer operands never do
fn mnemonic(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        take_while1(|c: char| c.is_ascii_alphabetic()),
        take_while(|c: char| c.is_ascii_digit()),
    ))(input)
}

/// One data-section entry: an address and a value
pub(crate) fn data_entry(input: &str) -> IResult<&str, (Word, Word)> {
    let (input, address) = preceded(space0, integer)(input)?;
    let (input, value) = preceded(separator, integer)(input)?;
    let (input, _) = space0(input)?;
    Ok((input, (address, value)))
}

/// One instruction-section entry: `index MNEMONIC [subtype] [operands]`
pub(crate) fn instruction_entry(input: &str) -> IResult<&str, RawInstruction<'_>> {
    let (input, index) = preceded(space0, integer)(input)?;
    let (input, mnemonic) = preceded(space1, mnemonic)(input)?;
    let (input, subtype) = opt(preceded(space1, self::mnemonic))(input)?;
    let (input, operands) = many0(preceded(separator, integer))(input)?;
    let (input, _) = space0(input)?;
    Ok((
        input,
        RawInstruction {
            index,
            mnemonic,
            subtype,
            operands,
        },
    ))
}
