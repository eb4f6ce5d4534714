//! Clap CLI definitions for Weft.

use crate::config::DemoTransport;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  weft demo                         Run a 3-node line over in-process ports
  weft demo --nodes 5 --calls 3     Longer line, more calls
  weft demo --transport stream      Framed byte-stream pipes instead of ports
  weft config                       Print the effective configuration";

/// Weft: gossip-routed channels and remote calls.
#[derive(Parser)]
#[command(
    name = "weft",
    version,
    about = "Weft: decentralized channels, multi-hop routing and remote calls",
    after_help = AFTER_HELP,
)]
pub struct Cli {
    /// Path to config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Wire a line of channels, serve `ping` on the last and call it from the first.
    Demo {
        /// Number of channels in the line (at least 2).
        #[arg(long)]
        nodes: Option<usize>,
        /// Pipe implementation connecting neighbours.
        #[arg(long, value_enum)]
        transport: Option<DemoTransport>,
        /// Number of `ping` calls to issue.
        #[arg(long)]
        calls: Option<u32>,
    },
    /// Print the effective configuration as TOML.
    Config,
}
