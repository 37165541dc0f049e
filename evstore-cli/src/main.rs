use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
mod store;

#[derive(Parser)]
#[command(name = "evstore", about = "Event store with optimistic appends and read-model projections")]
#[command(version, propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Append an event to a stream
    Append(commands::append::AppendArgs),
    /// Manage configuration
    Config(commands::config::ConfigArgs),
    /// Read events from a stream
    Load(commands::load::LoadArgs),
    /// Rebuild read models or fold one stream
    Replay(commands::replay::ReplayArgs),
    /// Run the projection and snapshot managers
    Serve(commands::serve::ServeArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if cli.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    match cli.command {
        Commands::Append(args) => commands::append::run(args).await,
        Commands::Config(args) => commands::config::run(args),
        Commands::Load(args) => commands::load::run(args).await,
        Commands::Replay(args) => commands::replay::run(args).await,
        Commands::Serve(args) => commands::serve::run(args).await,
    }
}
