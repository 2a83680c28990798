//! lectern - course material build runner.
//!
//! Builds course material by running each project step in its own
//! container. The heavy lifting lives in `lectern-lib`; this binary
//! adds argument parsing, configuration loading and terminal output.

mod cmd;
mod config;
mod output;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cmd::GlobalArgs;

/// Course material builder.
#[derive(Parser)]
#[command(name = "lectern")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Enable verbose output
  #[arg(short, long, global = true)]
  verbose: bool,

  /// Location of the project definition (default: current working dir)
  #[arg(short = 'C', long = "project", global = true, value_name = "DIR")]
  project: Option<PathBuf>,

  /// Backend to run steps with
  #[arg(long, global = true, value_name = "NAME")]
  backend: Option<String>,

  /// Backend option, may be repeated
  #[arg(long = "backend-option", global = true, value_name = "KEY=VALUE")]
  backend_options: Vec<String>,

  /// Settings file to use instead of the default location
  #[arg(long, global = true, value_name = "FILE")]
  settings: Option<PathBuf>,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Build the project
  Build {
    /// Steps to build, by name or index (default: all)
    refs: Vec<String>,

    /// Remove the output directory before building
    #[arg(long)]
    clean: bool,
  },

  /// List the project's steps
  Steps,

  /// Check that the backend runtime is reachable
  Verify,

  /// Remove stray containers left over from previous runs
  Cleanup {
    /// Remove all runner containers, not only expired ones
    #[arg(short, long)]
    force: bool,
  },

  /// Show version information, ours and the backend's
  Version,
}

#[tokio::main]
async fn main() -> ExitCode {
  let cli = Cli::parse();

  let default_level = if cli.verbose { "debug" } else { "warn" };
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
    .without_time()
    .with_writer(std::io::stderr)
    .init();

  let args = GlobalArgs {
    project: cli.project,
    backend: cli.backend,
    backend_options: cli.backend_options,
    settings: cli.settings,
  };

  let outcome = match cli.command {
    Commands::Build { refs, clean } => cmd::cmd_build(&args, &refs, clean).await,
    Commands::Steps => cmd::cmd_steps(&args).map(|()| ExitCode::SUCCESS),
    Commands::Verify => cmd::cmd_verify(&args).await.map(|()| ExitCode::SUCCESS),
    Commands::Cleanup { force } => cmd::cmd_cleanup(&args, force).await.map(|()| ExitCode::SUCCESS),
    Commands::Version => cmd::cmd_version(&args).await.map(|()| ExitCode::SUCCESS),
  };

  match outcome {
    Ok(code) => code,
    Err(error) => {
      output::print_error(&format!("{error:#}"));
      ExitCode::FAILURE
    }
  }
}
