use bitflags::bitflags;
use parse_display::Display;

use crate::constants as C;

bitflags! {
    /// CPU-internal state bits. Everything else the machine knows is held in
    /// memory cells.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CpuFlags: u8 {
        /// Set by HLT, an instruction hole, or a fatal kernel-mode fault
        const HALTED = 0b01;
        /// Unprivileged execution; supervisor-private accesses trap
        const USER = 0b10;
    }
}

/// The memory-mapped registers at the bottom of the address space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[display(style = "SNAKE_CASE")]
pub enum Reg {
    /// Program counter
    Pc,

    /// Stack pointer
    Sp,

    /// Last event code handed to the supervisor
    Event,

    /// Count of executed instructions
    Icount,

    /// PC saved when a trap was delivered
    SavedPc,

    /// First trap argument
    Arg1,
}

impl Reg {
    /// Address of the register's memory cell
    pub const fn addr(self) -> C::Word {
        match self {
            Reg::Pc => C::PC_ADDR,
            Reg::Sp => C::SP_ADDR,
            Reg::Event => C::EVENT_ADDR,
            Reg::Icount => C::ICOUNT_ADDR,
            Reg::SavedPc => C::SAVED_PC_ADDR,
            Reg::Arg1 => C::ARG1_ADDR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_test() {
        assert_eq!(Reg::Pc.to_string(), "PC");
        assert_eq!(Reg::SavedPc.to_string(), "SAVED_PC");
    }

    #[test]
    fn addr_test() {
        assert_eq!(Reg::Pc.addr(), 0);
        assert_eq!(Reg::Arg1.addr(), 5);
    }
}
