//! Memory dumpers behind the debug modes.
//!
//! Everything here observes the machine without touching it; in particular
//! the thread-table dump never clears the EVENT cell, that is the
//! supervisor's job.

use std::io::{self, Write};

use k11_emulator::constants as C;
use k11_emulator::runtime::{Memory, Reg};

/// `addr:value` lines for the whole memory (modes 1 and 2)
pub fn full(memory: &Memory, out: &mut impl Write) -> io::Result<()> {
    memory.dump_range(out, 0, memory.size() as C::Word - 1)
}

/// The register window, a slice of the supervisor area and the start of the
/// user space (mode 0 after halt, and after fatal faults)
pub fn important_regions(memory: &Memory, out: &mut impl Write) -> io::Result<()> {
    writeln!(out, "--- registers (0-{}) ---", C::REGISTER_WINDOW_END)?;
    memory.dump_range(out, 0, C::REGISTER_WINDOW_END)?;

    writeln!(out, "--- supervisor area ({}-99) ---", C::PROTECTED_START)?;
    memory.dump_range(out, C::PROTECTED_START, 99)?;

    if memory.size() > C::USER_SPACE_START as usize {
        let end = C::USER_SPACE_START + 19;
        writeln!(out, "--- user space ({}-{end}) ---", C::USER_SPACE_START)?;
        memory.dump_range(out, C::USER_SPACE_START, end)?;
    }
    Ok(())
}

/// The thread table the supervisor publishes through the protocol cells
/// (mode 3)
pub fn thread_table(memory: &Memory, out: &mut impl Write) -> io::Result<()> {
    let base = cell(memory, C::TCB_BASE_ADDR);
    let count = cell(memory, C::TCB_COUNT_ADDR);
    let size = cell(memory, C::TCB_SIZE_ADDR);

    writeln!(out, "--- thread table ---")?;
    if count <= 0 || size <= 0 {
        writeln!(out, "(not published: TCB count/size cells are zero)")?;
    } else {
        writeln!(out, "TID |   PC |   SP | state | start | execs | block")?;
        for tid in 0..count {
            let record = tid.checked_mul(size).and_then(|o| base.checked_add(o));
            let Some(record) = record.filter(|&r| {
                r.checked_add(size - 1)
                    .is_some_and(|end| memory.read(end).is_ok())
            }) else {
                writeln!(out, "(TCB {} is out of memory bounds)", tid + 1)?;
                break;
            };
            writeln!(
                out,
                "{:3} | {:4} | {:4} | {:5} | {:5} | {:5} | {:5}",
                tid + 1,
                cell(memory, record),
                cell(memory, record + 1),
                state_name(cell(memory, record + 2)),
                cell(memory, record + 3),
                cell(memory, record + 4),
                cell(memory, record + 5),
            )?;
        }
        writeln!(out, "current thread: {}", cell(memory, C::CURRENT_THREAD_ADDR))?;
    }

    for reg in [Reg::Icount, Reg::Event, Reg::SavedPc, Reg::Arg1] {
        writeln!(out, "{:>8}: {}", reg.to_string(), cell(memory, reg.addr()))?;
    }
    Ok(())
}

fn state_name(state: C::Word) -> &'static str {
    match state {
        C::THREAD_STATE_READY => "READY",
        C::THREAD_STATE_RUNNING => "RUNNG",
        C::THREAD_STATE_BLOCKED => "BLOCK",
        C::THREAD_STATE_TERMINATED => "TERMD",
        _ => "?",
    }
}

fn cell(memory: &Memory, address: C::Word) -> C::Word {
    memory.read(address).unwrap_or(0)
}
