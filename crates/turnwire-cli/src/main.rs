use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

mod commands;

use commands::config::run_config_show;
use commands::run::run_turn_cmd;

#[derive(Parser)]
#[command(name = "turnwire")]
#[command(about = "Client orchestrator for the turnwire agent stream", long_about = None)]
struct Cli {
    /// Workspace root that actions execute under. Defaults to the current
    /// directory.
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,

    /// Emit machine-readable JSON instead of human output.
    #[arg(long, global = true)]
    json: bool,

    /// Enable verbose logging to stderr.
    #[arg(short = 'v', long = "verbose", global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one input through a full turn against the agent service.
    Run(RunArgs),
    /// Print the effective configuration after file and flag overrides.
    ConfigShow,
}

#[derive(Args)]
pub struct RunArgs {
    /// The user input for this turn.
    pub input: String,

    /// Override the service base URL for this invocation.
    #[arg(long)]
    pub endpoint: Option<String>,

    /// Override the trust mode: supervised or autonomous.
    #[arg(long = "trust-mode")]
    pub trust_mode: Option<String>,

    /// Let sh.run auto-approve in autonomous mode. Off by default even when
    /// the mode is autonomous.
    #[arg(long = "autonomous-shell")]
    pub autonomous_shell: bool,

    /// Non-interactive mode: deny every approval prompt instead of asking.
    #[arg(long = "no-input")]
    pub no_input: bool,

    /// Skip the result callback even when a report endpoint is configured.
    #[arg(long = "no-report")]
    pub no_report: bool,
}

fn dispatch(cli: &Cli) -> Result<u8> {
    let workspace = match &cli.workspace {
        Some(path) => path.clone(),
        None => std::env::current_dir()?,
    };
    match &cli.command {
        Commands::Run(args) => run_turn_cmd(&workspace, args, cli.json, cli.verbose),
        Commands::ConfigShow => run_config_show(&workspace, cli.json),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match dispatch(&cli) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("[turnwire] error: {err:#}");
            ExitCode::from(2)
        }
    }
}
