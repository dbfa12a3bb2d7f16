use parse_display::Display;
use tracing::debug;

use crate::constants as C;

use super::exception::{Event, Exception};
use super::{Flow, Machine};

/// One decoded instruction.
///
/// Operands are plain words; whether a word is an address or an immediate is
/// fixed by the opcode. Operand order matches the assembly listing, so
/// `SET B A` decodes to `Set(B, A)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Instruction {
    /// mem[A] <- B
    #[display("SET {0} {1}")]
    Set(C::Word, C::Word),

    /// mem[A2] <- mem[A1]
    #[display("CPY {0} {1}")]
    Cpy(C::Word, C::Word),

    /// mem[A2] <- mem[mem[A1]]
    #[display("CPYI {0} {1}")]
    Cpyi(C::Word, C::Word),

    /// mem[mem[A2]] <- mem[mem[A1]]
    #[display("CPYI2 {0} {1}")]
    Cpyi2(C::Word, C::Word),

    /// mem[A] <- mem[A] + B
    #[display("ADD {0} {1}")]
    Add(C::Word, C::Word),

    /// mem[A1] <- mem[A1] + mem[A2]
    #[display("ADDI {0} {1}")]
    Addi(C::Word, C::Word),

    /// mem[A2] <- mem[A1] - mem[A2]
    #[display("SUBI {0} {1}")]
    Subi(C::Word, C::Word),

    /// Jump to C when mem[A] <= 0
    #[display("JIF {0} {1}")]
    Jif(C::Word, C::Word),

    /// Push mem[A]; the stack grows downward
    #[display("PUSH {0}")]
    Push(C::Word),

    /// Pop the top of the stack into mem[A]
    #[display("POP {0}")]
    Pop(C::Word),

    /// Push the return address and jump to C
    #[display("CALL {0}")]
    Call(C::Word),

    /// Pop the return address and jump to it
    #[display("RET")]
    Ret,

    /// Stop the machine; the PC stays on this instruction
    #[display("HLT")]
    Hlt,

    /// Enter user mode and jump to the PC held in mem[A]
    #[display("USER {0}")]
    User(C::Word),

    /// mem[Dst] <- mem[mem[Ptr]]
    #[display("LOADI {0} {1}")]
    Loadi(C::Word, C::Word),

    /// mem[mem[Ptr]] <- mem[Src]
    #[display("STOREI {0} {1}")]
    Storei(C::Word, C::Word),

    /// Print mem[A], then trap into the syscall dispatcher
    #[display("SYSCALL PRN {0}")]
    SyscallPrn(C::Word),

    /// Trap: the running thread is done
    #[display("SYSCALL HLT")]
    SyscallHlt,

    /// Trap: the running thread offers the CPU back
    #[display("SYSCALL YIELD")]
    SyscallYield,
}

impl Instruction {
    /// Execute the instruction.
    ///
    /// `pc` is the index this instruction was fetched from; it feeds the
    /// return address of CALL and the saved PC of the syscall traps.
    pub(crate) fn execute(&self, m: &mut Machine, pc: C::Word) -> Result<Flow, Exception> {
        use Instruction::*;

        match *self {
            Set(value, target) => {
                m.checked_write(target, value)?;
            }

            Cpy(source, target) => {
                let value = m.checked_read(source)?;
                m.checked_write(target, value)?;
            }

            Cpyi(pointer, target) | Loadi(pointer, target) => {
                let address = m.checked_read(pointer)?;
                let value = m.checked_read(address)?;
                m.checked_write(target, value)?;
            }

            Cpyi2(source_pointer, target_pointer) => {
                let source = m.checked_read(source_pointer)?;
                let target = m.checked_read(target_pointer)?;
                let value = m.checked_read(source)?;
                m.checked_write(target, value)?;
            }

            Add(target, value) => {
                let current = m.checked_read(target)?;
                let sum = current
                    .checked_add(value)
                    .ok_or(Exception::ArithmeticFault(target))?;
                debug!("{current} + {value} = {sum}");
                m.checked_write(target, sum)?;
            }

            Addi(target, source) => {
                let a = m.checked_read(target)?;
                let b = m.checked_read(source)?;
                let sum = a.checked_add(b).ok_or(Exception::ArithmeticFault(target))?;
                debug!("{a} + {b} = {sum}");
                m.checked_write(target, sum)?;
            }

            Subi(left, right) => {
                let a = m.checked_read(left)?;
                let b = m.checked_read(right)?;
                let difference = a.checked_sub(b).ok_or(Exception::ArithmeticFault(right))?;
                debug!("{a} - {b} = {difference}");
                // the result lands in the second operand
                m.checked_write(right, difference)?;
            }

            Jif(condition, target) => {
                let value = m.checked_read(condition)?;
                if value <= 0 {
                    debug!(value, target, "conditional jump taken");
                    return Ok(Flow::Jump(target));
                }
            }

            Push(source) => {
                let slot = m.stack_reserve()?;
                // the source is read after SP moved, so PUSH 1 stores the
                // decremented stack pointer
                let value = m.checked_read(source)?;
                m.checked_write(slot, value)?;
            }

            Pop(target) => {
                let value = m.pop()?;
                m.checked_write(target, value)?;
            }

            Call(target) => {
                let slot = m.stack_reserve()?;
                m.checked_write(slot, pc + 1)?;
                return Ok(Flow::Jump(target));
            }

            Ret => {
                let target = m.pop()?;
                debug!(target, "returning");
                return Ok(Flow::Jump(target));
            }

            Hlt => return Ok(Flow::Halt),

            User(pointer) => {
                if m.in_user_mode() {
                    // already unprivileged; fall through
                    return Ok(Flow::Sequential);
                }
                let target = m.checked_read(pointer)?;
                debug!(target, "entering user mode");
                m.enter_user_mode();
                return Ok(Flow::Jump(target));
            }

            Storei(source, pointer) => {
                let value = m.checked_read(source)?;
                let target = m.checked_read(pointer)?;
                m.checked_write(target, value)?;
            }

            SyscallPrn(source) => {
                // the read goes through the protection wrapper before the
                // mode switch, so a bad address becomes a memory fault
                let value = m.checked_read(source)?;
                m.emit(value);
                return m.trap(Event::SyscallPrn, pc + 1, Some(source));
            }

            SyscallHlt => return m.trap(Event::SyscallHlt, pc + 1, None),

            SyscallYield => return m.trap(Event::SyscallYield, pc + 1, None),
        }

        Ok(Flow::Sequential)
    }
}

/// Immutable instruction table, indexed by the PC cell.
///
/// Slots the loader never filled are holes; fetching one halts the machine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Program {
    slots: Vec<Option<Instruction>>,
}

impl Program {
    pub fn new(slots: Vec<Option<Instruction>>) -> Self {
        Self { slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Look up the slot for a PC value.
    ///
    /// `Ok(None)` is a hole; an index outside the table is an
    /// unknown-instruction fault.
    pub(crate) fn fetch(&self, pc: C::Word) -> Result<Option<Instruction>, Exception> {
        usize::try_from(pc)
            .ok()
            .filter(|&index| index < self.slots.len())
            .map(|index| self.slots[index])
            .ok_or(Exception::UnknownInstruction(pc))
    }
}

// Dense listing without holes, mostly useful in tests
impl From<Vec<Instruction>> for Program {
    fn from(instructions: Vec<Instruction>) -> Self {
        Self {
            slots: instructions.into_iter().map(Some).collect(),
        }
    }
}
