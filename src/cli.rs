use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Parser)]
#[command(name = "proxygate", about = "proxygate HTTP reverse proxy gateway")]
pub struct Cli {
    /// Path to the runtime configuration file (defaults to ./proxygate.toml if present).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Validate the configuration and service table, then exit without binding listeners.
    #[arg(long)]
    pub check: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}
