/// Machine word. Every memory cell, memory-mapped register and instruction
/// operand is one of these.
pub type Word = i64;

/// Total number of memory cells unless overridden on the command line
pub const DEFAULT_MEMORY_SIZE: usize = 11_000;

/// Smallest memory that still fits the register window
pub const MIN_MEMORY_SIZE: usize = 21;

/// Program counter (an index into the instruction table)
pub const PC_ADDR: Word = 0;

/// Stack pointer
pub const SP_ADDR: Word = 1;

/// Last CPU-to-supervisor event code
pub const EVENT_ADDR: Word = 2;

/// Count of executed instructions
pub const ICOUNT_ADDR: Word = 3;

/// Where the CPU saves the PC when delivering a trap
pub const SAVED_PC_ADDR: Word = 4;

/// First trap argument (PRN address, faulting address)
pub const ARG1_ADDR: Word = 5;

/// Second trap argument, reserved for the supervisor protocol
pub const ARG2_ADDR: Word = 6;

// Thread-table publication cells. The supervisor fills these so the debug
// dumper can decode its TCB table; the CPU itself never reads them.
pub const TCB_BASE_ADDR: Word = 7;
pub const TCB_COUNT_ADDR: Word = 8;
pub const TCB_SIZE_ADDR: Word = 9;
pub const CURRENT_THREAD_ADDR: Word = 10;

/// Last cell of the register window; the window is accessible in every mode
pub const REGISTER_WINDOW_END: Word = 20;

/// First cell of the supervisor-private region
pub const PROTECTED_START: Word = 21;

/// Last cell of the supervisor-private region
pub const PROTECTED_END: Word = 999;

/// First cell user threads may touch freely
pub const USER_SPACE_START: Word = 1000;

/// Entry point of the supervisor's syscall dispatcher
pub const SYSCALL_HANDLER_PC: Word = 50;

/// Entry point of the memory-fault handler
pub const MEMORY_FAULT_HANDLER_PC: Word = 60;

/// Entry point of the unknown-instruction handler
pub const UNKNOWN_INSTRUCTION_HANDLER_PC: Word = 70;

/// Entry point of the arithmetic-fault handler
pub const ARITHMETIC_FAULT_HANDLER_PC: Word = 80;

// Thread states as stored in TCB records
pub const THREAD_STATE_READY: Word = 1;
pub const THREAD_STATE_RUNNING: Word = 2;
pub const THREAD_STATE_BLOCKED: Word = 3;
pub const THREAD_STATE_TERMINATED: Word = 4;

/// Ceiling on executed steps unless overridden on the command line
pub const DEFAULT_MAX_CYCLES: u64 = 200_000;
