//! `evstore config`: inspect the effective configuration.

use anyhow::Result;
use clap::{Args, Subcommand};

use crate::config::{CONFIG_ENV, ConfigLoader, EvstoreConfig};

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the merged configuration with defaults filled in
    Show {
        /// Print JSON instead of TOML
        #[arg(long)]
        json: bool,
    },
    /// Print the config files searched and the database files in use
    Path,
}

pub fn run(args: ConfigArgs) -> Result<()> {
    let config = ConfigLoader::load()?;
    match args.command {
        ConfigCommands::Show { json } => show_config(&config, json),
        ConfigCommands::Path => show_paths(&config),
    }
}

fn show_config(config: &EvstoreConfig, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(config)?);
    } else {
        println!("{}", toml::to_string_pretty(config)?);
    }
    Ok(())
}

fn show_paths(config: &EvstoreConfig) -> Result<()> {
    match ConfigLoader::user_config_path() {
        Some(path) => println!("User config:    {}", path.display()),
        None => println!("User config:    (no home directory)"),
    }
    println!(
        "Project config: {} (override with {})",
        ConfigLoader::project_config_path().display(),
        CONFIG_ENV
    );

    match &config.storage.url {
        Some(url) => println!("Database:       {}", url),
        None => {
            println!("Event log:      {}", config.storage.events_db().display());
            println!("Read models:    {}", config.storage.projections_db().display());
            println!("Snapshots:      {}", config.storage.snapshots_db().display());
        }
    }
    Ok(())
}
