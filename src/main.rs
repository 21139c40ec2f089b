use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use apafix::action::{self, Action, Completion, Operator};
use apafix::backend::HostBackend;
use clap::{ArgAction, Parser};
use tracing::{debug, Level};

/// Repair PS2 APA partition headers and share the disk with an exFAT partition.
#[derive(Parser)]
#[command(name = "apafix", version, about)]
struct Cli {
    /// Raw device holding the APA partition table, e.g. /dev/sdX
    device: PathBuf,
    /// Show more details (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

/// Questions on stdout, answers on stdin.
struct Terminal {
    stdin: io::Stdin,
}

impl Operator for Terminal {
    fn ask(&mut self, question: &str) -> io::Result<String> {
        print!("{}", question);
        io::stdout().flush()?;

        let mut answer = String::new();
        self.stdin.lock().read_line(&mut answer)?;

        Ok(answer.trim_end_matches(['\r', '\n']).to_string())
    }

    fn tell(&mut self, message: &str) {
        println!("{}", message);
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn run(cli: &Cli) -> Result<Completion> {
    let backend = HostBackend::detect();
    debug!("disk backend: {:?}", backend);

    let mut terminal = Terminal { stdin: io::stdin() };
    let selection = terminal.ask(Action::MENU)?;
    let selected: Action = selection.parse()?;

    action::run(selected, &cli.device, &backend, &mut terminal)
        .with_context(|| format!("{} on {}", selected, cli.device.display()))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(&cli) {
        Ok(_) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::FAILURE
        }
    }
}
