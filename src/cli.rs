//! Command-line surface for the kubelite binary.

use clap::{ArgAction, Parser};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "kubelite")]
#[command(about = "A single-binary Kubernetes-compatible control plane")]
#[command(version)]
pub struct Args {
    /// Path to the YAML config file (default: $KUBELITE_CONFIG, then the
    /// bundled example config, then built-in defaults)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override the HTTP port from the config file
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Override the node name (default: $NODE_NAME, then hostname)
    #[arg(long)]
    pub node_name: Option<String>,

    /// Load environment variables from this file before starting
    #[arg(long)]
    pub env_file: Option<PathBuf>,

    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}
