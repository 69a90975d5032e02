use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result, anyhow};
use clap::{ArgAction, Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use pyproject_solve::command::{ApplicationPlugin, CommandLoader, LockArgs, Project, SolvePlugin};

#[derive(Parser, Debug)]
#[command(name = "pyproject-solve", version)]
#[command(about = "Resolve pyproject.toml dependencies and write poetry.lock without installing")]
struct Cli {
    /// Run as if started in DIR
    #[arg(short = 'C', long = "directory", value_name = "DIR", global = true)]
    directory: Option<PathBuf>,

    /// More output (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Only warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Solve and lock the project dependencies
    Solve(LockArgs),
}

fn setup_logging(verbose: u8, quiet: bool) {
    let level = match (quiet, verbose) {
        (true, _) => "warn",
        (false, 0) => "info",
        (false, 1) => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("pyproject_solve={level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<i32> {
    let dir = match cli.directory {
        Some(dir) => dir,
        None => std::env::current_dir().context("cannot determine the working directory")?,
    };

    let mut loader = CommandLoader::new();
    SolvePlugin.activate(&mut loader);

    let (name, args) = match cli.command {
        Commands::Solve(args) => ("solve", args),
    };
    let command = loader
        .get(name)
        .ok_or_else(|| anyhow!("command `{name}` is not registered"))?;
    debug!(command = command.name(), dir = %dir.display(), "running");

    let project = Project::load(&dir)
        .with_context(|| format!("failed to load the project in {}", dir.display()))?;
    let mut stdout = std::io::stdout().lock();
    Ok(command.handle(&project, &args, &mut stdout)?)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(cli.verbose, cli.quiet);

    match run(cli) {
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(e) => {
            eprintln!("Error: {e}");
            for cause in e.chain().skip(1) {
                eprintln!("  Caused by: {cause}");
            }
            ExitCode::FAILURE
        }
    }
}
