use parse_display::Display;
use thiserror::Error;

use crate::constants as C;

use super::memory::MemoryError;

/// Event codes written to the EVENT cell when a trap is delivered.
///
/// The supervisor is expected to clear the cell back to `None` once it has
/// handled the event; the CPU never clears it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[display(style = "snake_case")]
pub enum Event {
    None,
    SyscallPrn,
    SyscallHlt,
    SyscallYield,
    MemoryFault,
    UnknownInstruction,
    ArithmeticFault,
}

impl Event {
    pub const fn code(self) -> C::Word {
        match self {
            Event::None => 0,
            Event::SyscallPrn => 1,
            Event::SyscallHlt => 2,
            Event::SyscallYield => 3,
            Event::MemoryFault => 4,
            Event::UnknownInstruction => 5,
            Event::ArithmeticFault => 6,
        }
    }

    pub fn from_code(code: C::Word) -> Option<Self> {
        match code {
            0 => Some(Event::None),
            1 => Some(Event::SyscallPrn),
            2 => Some(Event::SyscallHlt),
            3 => Some(Event::SyscallYield),
            4 => Some(Event::MemoryFault),
            5 => Some(Event::UnknownInstruction),
            6 => Some(Event::ArithmeticFault),
            _ => None,
        }
    }
}

/// Faults raised while executing one step.
///
/// In user mode these become traps into the supervisor; in kernel mode they
/// halt the machine.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Exception {
    /// Protection violation, out-of-range access in user mode, or a stack
    /// fault (they share an event code)
    #[error("memory access violation at address {0}")]
    MemoryFault(C::Word),

    /// Out-of-range access in kernel mode, always fatal
    #[error("addressing fault: {0}")]
    AddressingFault(MemoryError),

    /// The PC does not name an instruction
    #[error("no instruction at index {0}")]
    UnknownInstruction(C::Word),

    /// Overflow in ADD, ADDI or SUBI
    #[error("arithmetic overflow writing address {0}")]
    ArithmeticFault(C::Word),
}

impl Exception {
    /// Event code delivered to the supervisor for this fault
    pub(crate) const fn event(&self) -> Event {
        match self {
            Exception::MemoryFault(_) | Exception::AddressingFault(_) => Event::MemoryFault,
            Exception::UnknownInstruction(_) => Event::UnknownInstruction,
            Exception::ArithmeticFault(_) => Event::ArithmeticFault,
        }
    }

    /// Fixed handler PC for this fault's event class
    pub(crate) const fn handler_pc(&self) -> C::Word {
        match self {
            Exception::MemoryFault(_) | Exception::AddressingFault(_) => {
                C::MEMORY_FAULT_HANDLER_PC
            }
            Exception::UnknownInstruction(_) => C::UNKNOWN_INSTRUCTION_HANDLER_PC,
            Exception::ArithmeticFault(_) => C::ARITHMETIC_FAULT_HANDLER_PC,
        }
    }

    /// Value stored in the ARG1 cell when the trap is delivered
    pub(crate) const fn argument(&self) -> C::Word {
        match self {
            Exception::MemoryFault(address) => *address,
            Exception::AddressingFault(MemoryError::OutOfRange { address, .. }) => *address,
            Exception::UnknownInstruction(pc) => *pc,
            Exception::ArithmeticFault(address) => *address,
        }
    }
}
