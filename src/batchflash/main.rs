use std::process::ExitCode;

use clap::{ArgAction, Parser, Subcommand};
use flash::{FlashOptions, handle_flashing};
use list::{ListOptions, handle_listing};
use tracing::error;

mod flash;
mod list;

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
struct Cli {
    /// More output; repeat for trace level
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Flash every board that gets plugged in, one after another
    #[command(name = "flash", alias = "f")]
    Flash(FlashOptions),

    /// List attached boards in bootloader mode
    #[command(name = "list", alias = "l")]
    List(ListOptions),
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let result = match cli.command {
        Command::Flash(opts) => handle_flashing(opts),
        Command::List(opts) => handle_listing(opts).map(|_| ExitCode::SUCCESS),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            ExitCode::from(2)
        }
    }
}
