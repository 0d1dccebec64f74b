//! A ticker daemon driven by the `rebirth` lifecycle commands.
//!
//! ```text
//! tickd --pid-file ./tickd.pid --log-file ./tickd.log start
//! tickd --pid-file ./tickd.pid status
//! tickd --pid-file ./tickd.pid stop
//! ```

use std::io::{self, IsTerminal};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand};
use rebirth::Context;
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook::flag;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const TICK: Duration = Duration::from_secs(1);
const POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Parser)]
#[command(name = "tickd", about = "Example daemon built on rebirth")]
struct Cli {
    /// Pid file guarding the single running instance.
    #[arg(long)]
    pid_file: PathBuf,
    /// Log file receiving the daemon's stdout and stderr.
    #[arg(long)]
    log_file: Option<PathBuf>,
    /// Working directory of the daemon.
    #[arg(long)]
    work_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Action,
}

#[derive(Debug, Subcommand)]
enum Action {
    /// Detach and start ticking.
    Start,
    /// Terminate the daemon and wait for it.
    Stop,
    /// Kill the daemon and wait for it.
    Kill,
    /// Print running, stopped or crashed.
    Status,
}

fn main() {
    let cli = Cli::parse();

    let mut context = Context::new().pid_file(&cli.pid_file);
    if let Some(log) = &cli.log_file {
        context = context.log_file(log);
    }
    if let Some(dir) = &cli.work_dir {
        context = context.work_dir(dir);
    }

    match cli.command {
        Action::Start => {
            // Returns only inside the daemon.
            context.start();
            init_tracing();
            if let Err(err) = serve(&mut context) {
                error!(error = %err, "ticker failed");
                std::process::exit(1);
            }
        }
        Action::Stop => context.stop(),
        Action::Kill => context.kill(),
        Action::Status => context.status(),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(io::stderr)
        .with_ansi(io::stderr().is_terminal())
        .init();
}

fn serve(context: &mut Context) -> Result<(), Box<dyn std::error::Error>> {
    let term = Arc::new(AtomicBool::new(false));
    flag::register(SIGTERM, Arc::clone(&term))?;
    flag::register(SIGINT, Arc::clone(&term))?;

    info!(pid = std::process::id(), "ticker started");
    let mut ticks: u64 = 0;
    let mut since_tick = Duration::ZERO;
    while !term.load(Ordering::Relaxed) {
        if since_tick >= TICK {
            ticks += 1;
            info!(ticks, "tick");
            since_tick = Duration::ZERO;
        }
        thread::sleep(POLL);
        since_tick += POLL;
    }

    info!(ticks, "termination requested, releasing pid file");
    context.release()?;
    Ok(())
}
