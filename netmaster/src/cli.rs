use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "netmaster", version, about = "Netmaster control-plane CLI")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the netmaster daemon with config file
    Start {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Inspect or seed tag pools, or read and patch persisted state
    Cfgtool {
        #[arg(short, long)]
        config: PathBuf,
        /// Tag pool to inspect: vlan or vxlan
        #[arg(long, conflicts_with = "state")]
        resource: Option<String>,
        /// Tenant owning the tag pool
        #[arg(long, default_value = "default")]
        tenant: String,
        /// State type to inspect, e.g. NetworkState
        #[arg(long, requires = "id")]
        state: Option<String>,
        #[arg(long)]
        id: Option<String>,
        /// Field of the state record to patch
        #[arg(long, requires = "set")]
        field: Option<String>,
        /// Range of tags to mark in use, or the new field value
        #[arg(long)]
        set: Option<String>,
    },
}
