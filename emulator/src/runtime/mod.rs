use thiserror::Error;
use tracing::debug;

use crate::constants as C;

mod exception;
mod instructions;
mod memory;
mod registers;

pub use self::exception::{Event, Exception};
pub use self::instructions::{Instruction, Program};
pub use self::memory::{Memory, MemoryError};
pub use self::registers::{CpuFlags, Reg};

#[derive(Error, Debug)]
pub enum ProcessorError {
    /// A fault hit while the CPU was already in kernel mode
    #[error("fatal fault at PC {pc}: {exception}")]
    KernelFault { pc: C::Word, exception: Exception },

    /// The register window does not fit
    #[error("memory size {size} is below the {min}-cell minimum")]
    MemoryTooSmall { size: usize, min: usize },

    #[error("memory error: {0}")]
    Memory(#[from] MemoryError),
}

type Result<T> = std::result::Result<T, ProcessorError>;

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// HLT executed, or an instruction hole was reached
    Halted { cycles: u64 },

    /// The cycle ceiling stopped a runaway program
    CycleLimit { cycles: u64 },
}

/// Where control goes after an instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    /// Fall through to PC+1, unless the instruction wrote the PC cell itself
    Sequential,

    /// Control transfer; wins over any memory write to the PC cell
    Jump(C::Word),

    /// Stop; the PC stays on this instruction
    Halt,
}

/// The machine: memory, the instruction table and the CPU state bits.
///
/// The program counter and stack pointer are not fields here; they live in
/// memory cells 0 and 1 and every access to them goes through the same
/// memory path instructions use for their operands.
pub struct Machine {
    pub memory: Memory,
    program: Program,
    flags: CpuFlags,
    printer: Box<dyn FnMut(C::Word)>,
    pc_dirty: bool,
}

impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Machine {{ flags: {:?}, program: {} slots, memory: [...] }}",
            self.flags,
            self.program.len()
        )
    }
}

impl Machine {
    /// Build a machine around a loaded memory and instruction table.
    ///
    /// The memory must at least fit the register window.
    pub fn new(memory: Memory, program: Program) -> Result<Self> {
        if memory.size() < C::MIN_MEMORY_SIZE {
            return Err(ProcessorError::MemoryTooSmall {
                size: memory.size(),
                min: C::MIN_MEMORY_SIZE,
            });
        }
        Ok(Self {
            memory,
            program,
            flags: CpuFlags::empty(),
            printer: Box::new(|value| println!("{value}")),
            pc_dirty: false,
        })
    }

    /// Replace the sink the PRN syscall prints through
    #[must_use]
    pub fn with_printer(mut self, printer: impl FnMut(C::Word) + 'static) -> Self {
        self.printer = Box::new(printer);
        self
    }

    pub fn is_halted(&self) -> bool {
        self.flags.contains(CpuFlags::HALTED)
    }

    pub fn in_user_mode(&self) -> bool {
        self.flags.contains(CpuFlags::USER)
    }

    pub(crate) fn enter_user_mode(&mut self) {
        self.flags.insert(CpuFlags::USER);
    }

    pub(crate) fn emit(&mut self, value: C::Word) {
        (self.printer)(value);
    }

    /// Instruction-initiated memory read, with the protection check
    pub(crate) fn checked_read(&self, address: C::Word) -> std::result::Result<C::Word, Exception> {
        self.check_region(address)?;
        self.memory
            .read(address)
            .map_err(|inner| self.addressing_fault(address, inner))
    }

    /// Instruction-initiated memory write, with the protection check
    pub(crate) fn checked_write(
        &mut self,
        address: C::Word,
        value: C::Word,
    ) -> std::result::Result<(), Exception> {
        self.check_region(address)?;
        self.memory
            .write(address, value)
            .map_err(|inner| self.addressing_fault(address, inner))?;
        if address == C::PC_ADDR {
            // remembered so the commit skips the implicit PC+1
            self.pc_dirty = true;
        }
        Ok(())
    }

    fn check_region(&self, address: C::Word) -> std::result::Result<(), Exception> {
        if self.in_user_mode() && (C::PROTECTED_START..=C::PROTECTED_END).contains(&address) {
            return Err(Exception::MemoryFault(address));
        }
        Ok(())
    }

    fn addressing_fault(&self, address: C::Word, inner: MemoryError) -> Exception {
        if self.in_user_mode() {
            Exception::MemoryFault(address)
        } else {
            Exception::AddressingFault(inner)
        }
    }

    /// SP <- SP - 1 with the overflow check; returns the new top slot
    pub(crate) fn stack_reserve(&mut self) -> std::result::Result<C::Word, Exception> {
        let sp = self.checked_read(C::SP_ADDR)?;
        let slot = sp.checked_sub(1).ok_or(Exception::MemoryFault(sp))?;
        if slot < 0 {
            return Err(Exception::MemoryFault(slot));
        }
        self.checked_write(C::SP_ADDR, slot)?;
        Ok(slot)
    }

    /// Pop the top of the stack; underflow surfaces as a memory fault
    pub(crate) fn pop(&mut self) -> std::result::Result<C::Word, Exception> {
        let sp = self.checked_read(C::SP_ADDR)?;
        let value = self.checked_read(sp)?;
        self.checked_write(C::SP_ADDR, sp + 1)?;
        Ok(value)
    }

    /// Deliver a syscall trap and redirect to the dispatcher
    pub(crate) fn trap(
        &mut self,
        event: Event,
        saved_pc: C::Word,
        arg: Option<C::Word>,
    ) -> std::result::Result<Flow, Exception> {
        self.deliver(event, saved_pc, arg)
            .map_err(Exception::AddressingFault)?;
        Ok(Flow::Jump(C::SYSCALL_HANDLER_PC))
    }

    /// Switch to kernel mode and fill the trap cells
    fn deliver(
        &mut self,
        event: Event,
        saved_pc: C::Word,
        arg: Option<C::Word>,
    ) -> std::result::Result<(), MemoryError> {
        debug!(%event, saved_pc, "delivering trap");
        self.flags.remove(CpuFlags::USER);
        self.memory.write(C::SAVED_PC_ADDR, saved_pc)?;
        self.memory.write(C::EVENT_ADDR, event.code())?;
        if let Some(arg) = arg {
            self.memory.write(C::ARG1_ADDR, arg)?;
        }
        Ok(())
    }

    fn bump_icount(&mut self) -> std::result::Result<(), MemoryError> {
        // read-modify-write, so a supervisor store to the cell this cycle
        // still gets the increment on top
        let count = self.memory.read(C::ICOUNT_ADDR)?;
        self.memory.write(C::ICOUNT_ADDR, count.wrapping_add(1))
    }

    /// Run one fetch-execute-commit cycle.
    ///
    /// User-mode faults are delivered to the supervisor and the step still
    /// succeeds; kernel-mode faults halt the machine and come back as
    /// [`ProcessorError::KernelFault`].
    #[tracing::instrument(skip(self), level = "debug")]
    pub fn step(&mut self) -> Result<()> {
        if self.is_halted() {
            return Ok(());
        }

        let pc = self.memory.read(C::PC_ADDR)?;
        self.pc_dirty = false;

        let flow = match self.program.fetch(pc) {
            Ok(Some(instruction)) => {
                debug!(pc, %instruction, "executing");
                instruction.execute(self, pc)
            }
            Ok(None) => {
                debug!(pc, "hole in the instruction table, halting");
                Ok(Flow::Halt)
            }
            Err(exception) => Err(exception),
        };

        let flow = match flow {
            Ok(flow) => flow,
            Err(exception) if self.in_user_mode() => {
                debug!(%exception, pc, "fault, trapping to supervisor");
                // faults save the faulting PC so the supervisor can re-run
                // the instruction
                self.deliver(exception.event(), pc, Some(exception.argument()))?;
                Flow::Jump(exception.handler_pc())
            }
            Err(exception) => {
                self.flags.insert(CpuFlags::HALTED);
                self.bump_icount()?;
                return Err(ProcessorError::KernelFault { pc, exception });
            }
        };

        self.bump_icount()?;

        match flow {
            Flow::Sequential if self.pc_dirty => {}
            Flow::Sequential => self.memory.write(C::PC_ADDR, pc + 1)?,
            Flow::Jump(target) => self.memory.write(C::PC_ADDR, target)?,
            Flow::Halt => {
                self.flags.insert(CpuFlags::HALTED);
            }
        }

        Ok(())
    }

    /// Step until the machine halts or the cycle ceiling is hit
    #[tracing::instrument(skip(self))]
    pub fn run(&mut self, max_cycles: u64) -> Result<RunOutcome> {
        let mut cycles = 0;
        while !self.is_halted() {
            if cycles >= max_cycles {
                return Ok(RunOutcome::CycleLimit { cycles });
            }
            self.step()?;
            cycles += 1;
        }
        Ok(RunOutcome::Halted { cycles })
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use Instruction::*;

    const TEST_MEMORY: usize = 2000;

    fn machine(program: Program, data: &[(C::Word, C::Word)]) -> Machine {
        let mut memory = Memory::new(TEST_MEMORY);
        memory.load(data).unwrap();
        Machine::new(memory, program).unwrap()
    }

    fn cell(m: &Machine, address: C::Word) -> C::Word {
        m.memory.read(address).unwrap()
    }

    #[test]
    fn minimal_halt() {
        let mut m = machine(vec![Hlt].into(), &[]);
        m.step().unwrap();
        assert!(m.is_halted());
        assert_eq!(cell(&m, C::ICOUNT_ADDR), 1);
        // the PC stays on the HLT
        assert_eq!(cell(&m, C::PC_ADDR), 0);
    }

    #[test]
    fn hole_is_implicit_halt() {
        let program = Program::new(vec![Some(Set(1, 100)), None]);
        let mut m = machine(program, &[]);
        m.step().unwrap();
        m.step().unwrap();
        assert!(m.is_halted());
        assert_eq!(cell(&m, C::ICOUNT_ADDR), 2);
    }

    #[test]
    fn set_and_copy() {
        let mut m = machine(
            vec![Set(42, 100), Cpy(100, 101), Cpyi(102, 103), Hlt].into(),
            &[(102, 100)],
        );
        let outcome = m.run(10).unwrap();
        assert_eq!(outcome, RunOutcome::Halted { cycles: 4 });
        assert_eq!(cell(&m, 100), 42);
        assert_eq!(cell(&m, 101), 42);
        // CPYI 102 103 copies mem[mem[102]] = mem[100]
        assert_eq!(cell(&m, 103), 42);
    }

    #[test]
    fn double_indirect_copy() {
        let mut m = machine(
            vec![Cpyi2(100, 101), Hlt].into(),
            &[(100, 150), (101, 151), (150, 7), (151, 0)],
        );
        m.run(10).unwrap();
        assert_eq!(cell(&m, 151), 7);
    }

    #[test]
    fn indirect_load_store() {
        // STOREI 151 150 with mem[151] = 77 and mem[150] = 200
        let mut m = machine(
            vec![Storei(151, 150), Loadi(150, 160), Hlt].into(),
            &[(150, 200), (151, 77)],
        );
        m.run(10).unwrap();
        assert_eq!(cell(&m, 200), 77);
        // LOADI reads back through the same pointer
        assert_eq!(cell(&m, 160), 77);
    }

    #[test]
    fn arithmetic() {
        let mut m = machine(
            vec![Add(100, -3), Addi(100, 101), Subi(100, 102), Hlt].into(),
            &[(100, 10), (101, 5), (102, 2)],
        );
        m.run(10).unwrap();
        assert_eq!(cell(&m, 100), 12);
        // SUBI stores mem[100] - mem[102] into the second operand
        assert_eq!(cell(&m, 102), 10);
    }

    #[test]
    fn jif_boundaries() {
        for (value, taken) in [(0, true), (-5, true), (1, false)] {
            let mut m = machine(vec![Jif(100, 5), Hlt].into(), &[(100, value)]);
            m.step().unwrap();
            let expected = if taken { 5 } else { 1 };
            assert_eq!(cell(&m, C::PC_ADDR), expected, "JIF with mem[A] = {value}");
        }
    }

    #[test]
    fn countdown_loop() {
        // decrement mem[10] until it hits zero; mem[20] = 0 closes the loop
        let mut m = machine(
            vec![Add(10, -1), Jif(10, 3), Jif(20, 0), Hlt].into(),
            &[(10, 3), (20, 0)],
        );
        let outcome = m.run(50).unwrap();
        // three decrements, the exit branch fires on the third one
        assert_eq!(outcome, RunOutcome::Halted { cycles: 9 });
        assert_eq!(cell(&m, 10), 0);
    }

    #[test]
    fn push_pop_round_trip() {
        let mut m = machine(
            vec![Push(100), Pop(101), Hlt].into(),
            &[(C::SP_ADDR, 1500), (100, 42)],
        );
        m.run(10).unwrap();
        assert_eq!(cell(&m, 101), 42);
        assert_eq!(cell(&m, C::SP_ADDR), 1500);
        assert_eq!(cell(&m, 1499), 42);
    }

    #[test]
    fn call_and_ret() {
        let program = Program::new(vec![
            Some(Call(5)),
            Some(Hlt),
            None,
            None,
            None,
            Some(Set(99, 200)),
            Some(Ret),
        ]);
        let mut m = machine(program, &[(C::SP_ADDR, 1500)]);
        let outcome = m.run(10).unwrap();
        assert_eq!(outcome, RunOutcome::Halted { cycles: 4 });
        assert_eq!(cell(&m, 200), 99);
        // back at the instruction after the CALL with the stack balanced
        assert_eq!(cell(&m, C::PC_ADDR), 1);
        assert_eq!(cell(&m, C::SP_ADDR), 1500);
    }

    #[test]
    fn direct_pc_write_skips_increment() {
        let program = Program::new(vec![
            Some(Set(5, C::PC_ADDR)),
            None,
            None,
            None,
            None,
            Some(Hlt),
        ]);
        let mut m = machine(program, &[]);
        m.step().unwrap();
        // no implicit +1 on top of the written value
        assert_eq!(cell(&m, C::PC_ADDR), 5);
        m.step().unwrap();
        assert!(m.is_halted());
        assert_eq!(cell(&m, C::ICOUNT_ADDR), 2);
    }

    #[test]
    fn icount_survives_supervisor_write() {
        let mut m = machine(vec![Set(100, C::ICOUNT_ADDR), Hlt].into(), &[]);
        m.step().unwrap();
        // the CPU's own increment lands on top of the stored value
        assert_eq!(cell(&m, C::ICOUNT_ADDR), 101);
    }

    #[test]
    fn print_syscall_traps() {
        let printed = Rc::new(RefCell::new(Vec::new()));
        let sink = printed.clone();
        let mut m = machine(vec![SyscallPrn(100), Hlt].into(), &[(100, 42)])
            .with_printer(move |value| sink.borrow_mut().push(value));

        m.step().unwrap();
        assert_eq!(*printed.borrow(), vec![42]);
        assert_eq!(cell(&m, C::EVENT_ADDR), Event::SyscallPrn.code());
        assert_eq!(cell(&m, C::ARG1_ADDR), 100);
        // syscalls save a return address, not the trapping PC
        assert_eq!(cell(&m, C::SAVED_PC_ADDR), 1);
        assert_eq!(cell(&m, C::PC_ADDR), C::SYSCALL_HANDLER_PC);
        assert!(!m.in_user_mode());
    }

    #[test]
    fn yield_and_thread_halt_trap() {
        for (instruction, event) in [
            (SyscallYield, Event::SyscallYield),
            (SyscallHlt, Event::SyscallHlt),
        ] {
            let mut m = machine(vec![instruction].into(), &[]);
            m.flags.insert(CpuFlags::USER);
            m.step().unwrap();
            assert!(!m.in_user_mode());
            assert_eq!(cell(&m, C::EVENT_ADDR), event.code());
            assert_eq!(cell(&m, C::SAVED_PC_ADDR), 1);
            assert_eq!(cell(&m, C::PC_ADDR), C::SYSCALL_HANDLER_PC);
        }
    }

    #[test]
    fn user_mode_protection_trap() {
        // the supervisor enters a thread whose first instruction writes a
        // supervisor-private cell
        let program = Program::new(vec![
            Some(User(30)),
            None,
            Some(Set(7, 50)),
        ]);
        let mut m = machine(program, &[(30, 2)]);

        m.step().unwrap();
        assert!(m.in_user_mode());
        assert_eq!(cell(&m, C::PC_ADDR), 2);

        m.step().unwrap();
        assert!(!m.in_user_mode());
        assert_eq!(cell(&m, C::EVENT_ADDR), Event::MemoryFault.code());
        assert_eq!(cell(&m, C::ARG1_ADDR), 50);
        // faults save the faulting PC for re-execution
        assert_eq!(cell(&m, C::SAVED_PC_ADDR), 2);
        assert_eq!(cell(&m, C::PC_ADDR), C::MEMORY_FAULT_HANDLER_PC);
        assert_eq!(cell(&m, 50), 0, "the protected cell must not change");
    }

    #[test]
    fn register_window_boundary() {
        // reads at 20 stay legal in user mode, 21 is the first trap
        let mut m = machine(vec![Cpy(20, 1100), Cpy(21, 1101)].into(), &[]);
        m.flags.insert(CpuFlags::USER);

        m.step().unwrap();
        assert!(m.in_user_mode());

        m.step().unwrap();
        assert!(!m.in_user_mode());
        assert_eq!(cell(&m, C::EVENT_ADDR), Event::MemoryFault.code());
        assert_eq!(cell(&m, C::ARG1_ADDR), 21);
    }

    #[test]
    fn user_out_of_range_traps() {
        let mut m = machine(vec![Cpy(5000, 1100)].into(), &[]);
        m.flags.insert(CpuFlags::USER);
        m.step().unwrap();
        assert!(!m.in_user_mode());
        assert_eq!(cell(&m, C::EVENT_ADDR), Event::MemoryFault.code());
        assert_eq!(cell(&m, C::ARG1_ADDR), 5000);
    }

    #[test]
    fn kernel_out_of_range_is_fatal() {
        let mut m = machine(vec![Cpy(5000, 100)].into(), &[]);
        let err = m.step().unwrap_err();
        assert!(matches!(
            err,
            ProcessorError::KernelFault {
                pc: 0,
                exception: Exception::AddressingFault(_)
            }
        ));
        assert!(m.is_halted());
        // the PC is preserved at the faulting instruction
        assert_eq!(cell(&m, C::PC_ADDR), 0);
        assert_eq!(cell(&m, C::ICOUNT_ADDR), 1);
    }

    #[test]
    fn kernel_pc_out_of_bounds_is_fatal() {
        let mut m = machine(vec![Hlt].into(), &[(C::PC_ADDR, 99)]);
        let err = m.step().unwrap_err();
        assert!(matches!(
            err,
            ProcessorError::KernelFault {
                pc: 99,
                exception: Exception::UnknownInstruction(99)
            }
        ));
    }

    #[test]
    fn user_jump_out_of_bounds_traps_on_next_step() {
        // USER reads a bogus target; the fault fires on the following fetch
        let mut m = machine(vec![User(30)].into(), &[(30, 1234)]);
        m.step().unwrap();
        assert!(m.in_user_mode());
        assert_eq!(cell(&m, C::PC_ADDR), 1234);

        m.step().unwrap();
        assert!(!m.in_user_mode());
        assert_eq!(cell(&m, C::EVENT_ADDR), Event::UnknownInstruction.code());
        assert_eq!(cell(&m, C::ARG1_ADDR), 1234);
        assert_eq!(cell(&m, C::SAVED_PC_ADDR), 1234);
        assert_eq!(cell(&m, C::PC_ADDR), C::UNKNOWN_INSTRUCTION_HANDLER_PC);
    }

    #[test]
    fn user_instruction_in_user_mode_falls_through() {
        let mut m = machine(vec![User(30), Hlt].into(), &[(30, 0)]);
        m.flags.insert(CpuFlags::USER);
        m.step().unwrap();
        assert!(m.in_user_mode());
        assert_eq!(cell(&m, C::PC_ADDR), 1);
    }

    #[test]
    fn stack_overflow_traps_in_user_mode() {
        let mut m = machine(vec![Push(1100)].into(), &[(C::SP_ADDR, 0)]);
        m.flags.insert(CpuFlags::USER);
        m.step().unwrap();
        assert!(!m.in_user_mode());
        assert_eq!(cell(&m, C::EVENT_ADDR), Event::MemoryFault.code());
        // SP is untouched by the failed push
        assert_eq!(cell(&m, C::SP_ADDR), 0);
    }

    #[test]
    fn stack_underflow_traps_in_user_mode() {
        let mut m = machine(vec![Pop(1100)].into(), &[(C::SP_ADDR, TEST_MEMORY as C::Word)]);
        m.flags.insert(CpuFlags::USER);
        m.step().unwrap();
        assert!(!m.in_user_mode());
        assert_eq!(cell(&m, C::EVENT_ADDR), Event::MemoryFault.code());
    }

    #[test]
    fn arithmetic_overflow_traps_in_user_mode() {
        let mut m = machine(vec![Add(1100, 1)].into(), &[(1100, C::Word::MAX)]);
        m.flags.insert(CpuFlags::USER);
        m.step().unwrap();
        assert!(!m.in_user_mode());
        assert_eq!(cell(&m, C::EVENT_ADDR), Event::ArithmeticFault.code());
        assert_eq!(cell(&m, C::ARG1_ADDR), 1100);
        assert_eq!(cell(&m, C::PC_ADDR), C::ARITHMETIC_FAULT_HANDLER_PC);
        assert_eq!(cell(&m, 1100), C::Word::MAX, "operand is left untouched");
    }

    #[test]
    fn arithmetic_overflow_is_fatal_in_kernel_mode() {
        let mut m = machine(vec![Add(100, 1)].into(), &[(100, C::Word::MAX)]);
        let err = m.step().unwrap_err();
        assert!(matches!(
            err,
            ProcessorError::KernelFault {
                exception: Exception::ArithmeticFault(100),
                ..
            }
        ));
        assert!(m.is_halted());
    }

    #[test]
    fn prn_with_protected_argument_faults_instead() {
        let printed = Rc::new(RefCell::new(Vec::new()));
        let sink = printed.clone();
        let mut m = machine(vec![SyscallPrn(500)].into(), &[])
            .with_printer(move |value| sink.borrow_mut().push(value));
        m.flags.insert(CpuFlags::USER);
        m.step().unwrap();
        assert!(printed.borrow().is_empty(), "nothing may be printed");
        assert_eq!(cell(&m, C::EVENT_ADDR), Event::MemoryFault.code());
        assert_eq!(cell(&m, C::ARG1_ADDR), 500);
        assert_eq!(cell(&m, C::PC_ADDR), C::MEMORY_FAULT_HANDLER_PC);
    }

    #[test]
    fn cycle_limit_stops_runaway_loop() {
        let mut m = machine(vec![Jif(100, 0)].into(), &[(100, 0)]);
        let outcome = m.run(10).unwrap();
        assert_eq!(outcome, RunOutcome::CycleLimit { cycles: 10 });
        assert!(!m.is_halted());
        assert_eq!(cell(&m, C::ICOUNT_ADDR), 10);
    }

    #[test]
    fn memory_too_small_is_rejected() {
        let result = Machine::new(Memory::new(20), Program::default());
        assert!(matches!(
            result,
            Err(ProcessorError::MemoryTooSmall { size: 20, min: 21 })
        ));
    }

    #[test]
    fn print_program_image_end_to_end() {
        let source = "\
Begin Data Section
0 0        # boot PC
100 42
End Data Section
Begin Instruction Section
0 SYSCALL PRN 100
1 HLT
50 HLT     # trivial syscall dispatcher
End Instruction Section
";
        let image = crate::parser::parse(source).unwrap();
        let mut memory = Memory::new(TEST_MEMORY);
        memory.load(&image.data).unwrap();

        let printed = Rc::new(RefCell::new(Vec::new()));
        let sink = printed.clone();
        let mut m = Machine::new(memory, image.program)
            .unwrap()
            .with_printer(move |value| sink.borrow_mut().push(value));

        let outcome = m.run(100).unwrap();
        // PRN traps to the dispatcher, which halts
        assert_eq!(outcome, RunOutcome::Halted { cycles: 2 });
        assert_eq!(*printed.borrow(), vec![42]);
        assert_eq!(cell(&m, C::PC_ADDR), C::SYSCALL_HANDLER_PC);
    }
}
