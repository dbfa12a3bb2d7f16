#![forbid(unsafe_code)]

use std::process::exit;

use camino::Utf8PathBuf;
use clap::Parser;
use tracing::error;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::prelude::*;

use k11_emulator::constants as C;

mod dump;
mod run;

#[derive(Parser)]
#[command(version, author, about)]
struct Opt {
    /// Program image to run
    image: Utf8PathBuf,

    /// Debug mode: 0 dumps memory on halt, 1 after each step, 2 after each
    /// step waiting for ENTER, 3 dumps the thread table on traps and mode
    /// changes
    #[arg(
        short = 'D',
        long = "debug",
        value_name = "MODE",
        default_value_t = 0,
        value_parser = clap::value_parser!(u8).range(0..=3)
    )]
    debug: u8,

    /// Memory size in words
    #[arg(
        short = 'm',
        long = "memory-size",
        value_name = "N",
        default_value_t = C::DEFAULT_MEMORY_SIZE
    )]
    memory_size: usize,

    /// Stop the simulation after this many executed steps
    #[arg(long, value_name = "N", default_value_t = C::DEFAULT_MAX_CYCLES)]
    max_cycles: u64,

    /// Increase the level of verbosity. Can be used multiple times.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Force colored output. Default is to check if stderr is a tty
    #[arg(short = 'c', long, group = "format")]
    color: bool,

    /// Force non-colored output
    #[arg(short = 'C', long, group = "format")]
    no_color: bool,

    /// Use JSON output for log messages
    #[arg(short, long, group = "format")]
    json: bool,
}

impl Opt {
    const fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "k11_emulator=debug,k11_cli=debug,info",
            2 => "k11_emulator=trace,k11_cli=trace,info",
            3..=u8::MAX => "trace",
        }
    }

    fn should_use_colors(&self) -> bool {
        if self.color {
            true
        } else if self.no_color {
            false
        } else {
            atty::is(atty::Stream::Stderr)
        }
    }

    fn filter_layer(&self) -> EnvFilter {
        // Parse log level from env
        EnvFilter::try_from_default_env()
            // or infer from args
            .or_else(|_| EnvFilter::try_new(self.log_filter()))
            .unwrap_or_default()
    }
}

fn main() {
    // First, parse the arguments. Help and version requests exit cleanly;
    // everything else is an argument error.
    let opt = match Opt::try_parse() {
        Ok(opt) => opt,
        Err(e) => {
            let code = i32::from(e.use_stderr());
            let _ = e.print();
            exit(code);
        }
    };

    // Then, setup the tracing formatter for logging and instrumentation
    let registry = tracing_subscriber::Registry::default().with(opt.filter_layer());

    if opt.json {
        let json_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr);
        registry.with(json_layer).init();
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .without_time()
            .with_ansi(opt.should_use_colors())
            .with_target(false)
            .with_writer(std::io::stderr);
        registry.with(fmt_layer).init();
    }

    if let Err(e) = run::run(&opt) {
        error!("{e:#}");
        exit(1);
    }
}
