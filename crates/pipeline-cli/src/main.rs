mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::config::ConfigSubcommand;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "pipeline",
    about = "Turn a voted backlog into merged code, one story batch per invocation",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from .pipeline/ or .git/)
    #[arg(long, global = true, env = "PIPELINE_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default .pipeline/config.yaml
    Init,

    /// Run one pipeline invocation (intended for cron)
    Run,

    /// Show the lock, the task file, and configured tools
    Status,

    /// Force-release the run lock
    Unlock,

    /// Inspect the configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Run => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Init => cmd::init::run(&root),
        Commands::Run => cmd::run::run(&root, cli.json),
        Commands::Status => cmd::status::run(&root, cli.json),
        Commands::Unlock => cmd::unlock::run(&root, cli.json),
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, cli.json),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
