//! Program image parsing.
//!
//! An image is a text file with two optional sections, each wrapped in
//! literal marker lines:
//!
//! ```text
//! Begin Data Section
//! 0 0                 # address value, comma optional
//! End Data Section
//! Begin Instruction Section
//! 0 SET 10, 50        # index MNEMONIC operands
//! End Instruction Section
//! ```
//!
//! `#` starts a comment running to the end of the line. Markers are matched
//! case-sensitively; mnemonics are not. Line-level tokenizing is handled by
//! `nom` parsers in the [`line`] submodule.

use nom::combinator::all_consuming;
use thiserror::Error;
use tracing::warn;

use crate::constants::Word;
use crate::runtime::{Instruction, Program};

mod line;

use self::line::RawInstruction;

const BEGIN_DATA: &str = "Begin Data Section";
const END_DATA: &str = "End Data Section";
const BEGIN_INSTRUCTION: &str = "Begin Instruction Section";
const END_INSTRUCTION: &str = "End Instruction Section";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("line {line}: '{marker}' without a matching section start")]
    UnexpectedMarker { line: usize, marker: &'static str },

    #[error("line {line}: '{marker}' is never closed")]
    UnclosedSection { line: usize, marker: &'static str },

    #[error("line {line}: '{marker}' appears twice")]
    DuplicateSection { line: usize, marker: &'static str },

    #[error("line {line}: malformed data entry (expected 'address value')")]
    MalformedData { line: usize },

    #[error("line {line}: malformed instruction (expected 'index MNEMONIC operands')")]
    MalformedInstruction { line: usize },

    #[error("line {line}: instruction index must not be negative")]
    NegativeIndex { line: usize },

    #[error("line {line}: unknown mnemonic '{mnemonic}'")]
    UnknownMnemonic { line: usize, mnemonic: String },

    #[error("line {line}: unknown syscall type '{kind}'")]
    UnknownSyscall { line: usize, kind: String },

    #[error("line {line}: SYSCALL is missing its type")]
    MissingSyscallType { line: usize },

    #[error("line {line}: {mnemonic} expects {expected} operand(s), got {got}")]
    OperandCount {
        line: usize,
        mnemonic: String,
        expected: usize,
        got: usize,
    },
}

/// A parsed program image: the initial memory snapshot and the instruction
/// table
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Image {
    /// Data-section entries, in file order
    pub data: Vec<(Word, Word)>,

    /// Decoded instruction table; unlisted indices are holes
    pub program: Program,
}

#[derive(Clone, Copy)]
enum Section {
    Data,
    Instructions,
}

impl Section {
    const fn begin_marker(self) -> &'static str {
        match self {
            Section::Data => BEGIN_DATA,
            Section::Instructions => BEGIN_INSTRUCTION,
        }
    }
}

/// Parse a whole program image
pub fn parse(source: &str) -> Result<Image, ParseError> {
    let mut data = Vec::new();
    let mut slots: Vec<Option<Instruction>> = Vec::new();
    let mut section: Option<(Section, usize)> = None;
    let mut seen_data = false;
    let mut seen_instructions = false;

    for (index, raw_line) in source.lines().enumerate() {
        let line = index + 1;
        let content = strip_comment(raw_line).trim();

        match content {
            BEGIN_DATA | BEGIN_INSTRUCTION => {
                if let Some((open, at)) = section {
                    return Err(ParseError::UnclosedSection {
                        line: at,
                        marker: open.begin_marker(),
                    });
                }
                let (opened, seen) = if content == BEGIN_DATA {
                    (Section::Data, &mut seen_data)
                } else {
                    (Section::Instructions, &mut seen_instructions)
                };
                if *seen {
                    return Err(ParseError::DuplicateSection {
                        line,
                        marker: opened.begin_marker(),
                    });
                }
                *seen = true;
                section = Some((opened, line));
            }

            END_DATA => match section {
                Some((Section::Data, _)) => section = None,
                _ => {
                    return Err(ParseError::UnexpectedMarker {
                        line,
                        marker: END_DATA,
                    })
                }
            },

            END_INSTRUCTION => match section {
                Some((Section::Instructions, _)) => section = None,
                _ => {
                    return Err(ParseError::UnexpectedMarker {
                        line,
                        marker: END_INSTRUCTION,
                    })
                }
            },

            "" => {}

            _ => match section {
                Some((Section::Data, _)) => {
                    let (_, entry) = all_consuming(line::data_entry)(content)
                        .map_err(|_| ParseError::MalformedData { line })?;
                    data.push(entry);
                }
                Some((Section::Instructions, _)) => {
                    let (_, raw) = all_consuming(line::instruction_entry)(content)
                        .map_err(|_| ParseError::MalformedInstruction { line })?;
                    let instruction = decode(&raw, line)?;
                    insert(&mut slots, &raw, instruction, line)?;
                }
                None => {
                    warn!(line, "ignoring content outside any section");
                }
            },
        }
    }

    if let Some((open, at)) = section {
        return Err(ParseError::UnclosedSection {
            line: at,
            marker: open.begin_marker(),
        });
    }

    Ok(Image {
        data,
        program: Program::new(slots),
    })
}

fn strip_comment(line: &str) -> &str {
    line.find('#').map_or(line, |at| &line[..at])
}

/// Turn a raw line into an instruction, checking mnemonic and operand count
fn decode(raw: &RawInstruction<'_>, line: usize) -> Result<Instruction, ParseError> {
    use Instruction::*;

    let mnemonic = raw.mnemonic.to_ascii_uppercase();
    let operands = raw.operands.as_slice();

    if mnemonic == "SYSCALL" {
        let Some(subtype) = raw.subtype else {
            return Err(ParseError::MissingSyscallType { line });
        };
        let kind = subtype.to_ascii_uppercase();
        return match (kind.as_str(), operands) {
            ("PRN", &[address]) => Ok(SyscallPrn(address)),
            ("HLT", &[]) => Ok(SyscallHlt),
            ("YIELD", &[]) => Ok(SyscallYield),
            ("PRN", _) => Err(operand_count(line, "SYSCALL PRN", 1, operands.len())),
            ("HLT" | "YIELD", _) => {
                Err(operand_count(line, &format!("SYSCALL {kind}"), 0, operands.len()))
            }
            _ => Err(ParseError::UnknownSyscall {
                line,
                kind: kind.clone(),
            }),
        };
    }

    if raw.subtype.is_some() {
        // only SYSCALL carries a word token after the mnemonic
        return Err(ParseError::MalformedInstruction { line });
    }

    match (mnemonic.as_str(), operands) {
        ("SET", &[value, target]) => Ok(Set(value, target)),
        ("CPY", &[source, target]) => Ok(Cpy(source, target)),
        ("CPYI", &[pointer, target]) => Ok(Cpyi(pointer, target)),
        ("CPYI2", &[source, target]) => Ok(Cpyi2(source, target)),
        ("ADD", &[target, value]) => Ok(Add(target, value)),
        ("ADDI", &[target, source]) => Ok(Addi(target, source)),
        ("SUBI", &[left, right]) => Ok(Subi(left, right)),
        ("JIF", &[condition, target]) => Ok(Jif(condition, target)),
        ("LOADI", &[pointer, target]) => Ok(Loadi(pointer, target)),
        ("STOREI", &[source, pointer]) => Ok(Storei(source, pointer)),
        ("PUSH", &[address]) => Ok(Push(address)),
        ("POP", &[address]) => Ok(Pop(address)),
        ("CALL", &[target]) => Ok(Call(target)),
        ("USER", &[pointer]) => Ok(User(pointer)),
        ("RET", &[]) => Ok(Ret),
        ("HLT", &[]) => Ok(Hlt),

        (
            "SET" | "CPY" | "CPYI" | "CPYI2" | "ADD" | "ADDI" | "SUBI" | "JIF" | "LOADI"
            | "STOREI",
            _,
        ) => Err(operand_count(line, &mnemonic, 2, operands.len())),
        ("PUSH" | "POP" | "CALL" | "USER", _) => {
            Err(operand_count(line, &mnemonic, 1, operands.len()))
        }
        ("RET" | "HLT", _) => Err(operand_count(line, &mnemonic, 0, operands.len())),

        _ => Err(ParseError::UnknownMnemonic {
            line,
            mnemonic: raw.mnemonic.to_string(),
        }),
    }
}

fn operand_count(line: usize, mnemonic: &str, expected: usize, got: usize) -> ParseError {
    ParseError::OperandCount {
        line,
        mnemonic: mnemonic.to_string(),
        expected,
        got,
    }
}

/// Place an instruction into the table, growing it with holes as needed.
/// Sequential indices are expected; anything else warns but still loads.
fn insert(
    slots: &mut Vec<Option<Instruction>>,
    raw: &RawInstruction<'_>,
    instruction: Instruction,
    line: usize,
) -> Result<(), ParseError> {
    let index =
        usize::try_from(raw.index).map_err(|_| ParseError::NegativeIndex { line })?;

    if index != slots.len() {
        warn!(
            line,
            index,
            expected = slots.len(),
            "non-sequential instruction index"
        );
    }
    if index >= slots.len() {
        slots.resize(index + 1, None);
    }
    if slots[index].is_some() {
        warn!(line, index, "duplicate instruction index, keeping the later one");
    }
    slots[index] = Some(instruction);
    Ok(())
}
