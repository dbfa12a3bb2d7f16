use std::fs;
use std::io::{self, BufRead, Write};

use anyhow::Context;
use tracing::{debug, info, warn};

use k11_emulator::constants as C;
use k11_emulator::parse;
use k11_emulator::runtime::{Machine, Memory};

use crate::dump;
use crate::Opt;

pub fn run(opt: &Opt) -> anyhow::Result<()> {
    if opt.memory_size < C::MIN_MEMORY_SIZE {
        anyhow::bail!(
            "memory size {} is below the {}-cell minimum",
            opt.memory_size,
            C::MIN_MEMORY_SIZE
        );
    }
    if opt.memory_size < C::USER_SPACE_START as usize {
        warn!(
            size = opt.memory_size,
            "memory ends before the user space; supervisor threads will not fit"
        );
    }

    info!(path = %opt.image, "reading program image");
    let source = fs::read_to_string(&opt.image)
        .with_context(|| format!("could not read '{}'", opt.image))?;

    debug!("parsing image");
    let image = parse(&source)?;
    if image.program.is_empty() {
        warn!("no instructions loaded; the machine will halt on the first fetch");
    }

    let mut memory = Memory::new(opt.memory_size);
    memory.load(&image.data).context("loading data section")?;

    let mut machine = Machine::new(memory, image.program)?;

    info!("running program");
    let mut cycles: u64 = 0;
    let mut was_user = machine.in_user_mode();

    while !machine.is_halted() {
        if cycles >= opt.max_cycles {
            warn!(limit = opt.max_cycles, "cycle ceiling reached, stopping");
            break;
        }

        if let Err(fault) = machine.step() {
            let mut err = io::stderr().lock();
            dump::important_regions(&machine.memory, &mut err)?;
            return Err(fault).context("fatal CPU fault");
        }
        cycles += 1;

        match opt.debug {
            1 => dump::full(&machine.memory, &mut io::stderr().lock())?,
            2 => {
                dump::full(&machine.memory, &mut io::stderr().lock())?;
                wait_for_enter()?;
            }
            3 => {
                let event = machine.memory.read(C::EVENT_ADDR)?;
                let is_user = machine.in_user_mode();
                if event != 0 || is_user != was_user {
                    let mut err = io::stderr().lock();
                    writeln!(err, "--- event trigger (cycle {cycles}) ---")?;
                    dump::thread_table(&machine.memory, &mut err)?;
                }
                was_user = is_user;
            }
            _ => {}
        }
    }

    if machine.is_halted() {
        info!(cycles, "program halted");
    }
    // the mode-0 dump happens however the loop ended
    if opt.debug == 0 {
        dump::important_regions(&machine.memory, &mut io::stderr().lock())?;
    }
    Ok(())
}

fn wait_for_enter() -> io::Result<()> {
    let mut err = io::stderr().lock();
    write!(err, "-- ENTER to continue --")?;
    err.flush()?;
    drop(err);

    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(())
}
