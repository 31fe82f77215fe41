use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::{env, panic};

use anyhow::Result;
use clap::Parser;
use colored::Colorize;
use log::info;

mod command;
mod trace;

use command::Command;

#[derive(Debug, Parser)]
#[command(name = "beadscli", version)]
#[command(author, about = "A distributed, git-friendly issue tracker")]
pub struct Args {
    #[clap(short, long, help = "debug model")]
    debug: bool,

    /// Working directory; the workspace is discovered upward from here.
    #[clap(short = 'C', long = "workdir")]
    workdir: Option<PathBuf>,

    #[clap(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Actor recorded on mutations; defaults to $USER.
    #[clap(long)]
    actor: Option<String>,

    /// The subcommand to run.
    #[clap(subcommand)]
    cmd: Command,
}

pub fn main() {
    setup_panic_hooks();

    let args = Args::parse();
    if args.debug {
        println!("{:?}", args);
    }

    let log_dir = format!(
        "{}/.beadscli",
        std::env::var("HOME").unwrap_or_else(|_| ".".to_string())
    );
    let _guard = match trace::init_logging(Path::new(&log_dir), &args.log_level, args.debug) {
        Ok(guard) => Some(guard),
        Err(err) => {
            eprintln!("file logging disabled: {:#}", err);
            None
        }
    };
    info!("beadscli start args: {:?}", &args);

    let running = Arc::new(AtomicBool::new(false));
    let cancel = running.clone();
    if let Err(err) = ctrlc::set_handler(move || {
        eprintln!("interrupted, finishing the in-flight flush");
        cancel.store(true, Ordering::SeqCst);
    }) {
        log::warn!("could not install ctrl-c handler: {}", err);
    }

    if let Err(err) = run(args, running) {
        report_error(&err);
        std::process::exit(1);
    }
}

fn run(args: Args, cancel: Arc<AtomicBool>) -> Result<()> {
    let workdir = match args.workdir {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    let actor = args
        .actor
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "unknown".to_string());

    command::run_pack(args.cmd, &workdir, &actor, cancel)
}

/// One-line summary, the error kind, and a remediation hint when the failure
/// came out of the sync core.
fn report_error(err: &anyhow::Error) {
    match err.downcast_ref::<beads::error::Error>() {
        Some(core) => {
            eprintln!("{} {}", "error:".red().bold(), core);
            eprintln!("  kind: {}", core.kind());
            if let Some(hint) = core.remediation() {
                eprintln!("  hint: {}", hint);
            }
        }
        None => eprintln!("{} {}", "error:".red().bold(), err),
    }
}

fn setup_panic_hooks() {
    let meta = human_panic::Metadata {
        version: env!("CARGO_PKG_VERSION").into(),
        name: env!("CARGO_PKG_NAME").into(),
        authors: env!("CARGO_PKG_AUTHORS").replace(':', ", ").into(),
        homepage: env!("CARGO_PKG_HOMEPAGE").into(),
    };

    let default_hook = panic::take_hook();

    if env::var("RUST_BACKTRACE").is_err() {
        panic::set_hook(Box::new(move |info: &panic::PanicInfo| {
            // First call the default hook that prints to standard error.
            default_hook(info);

            // Then call human_panic.
            let file_path = human_panic::handle_dump(&meta, info);
            human_panic::print_msg(file_path, &meta)
                .expect("human-panic: printing error message to console failed");
        }));
    }
}
