// ABOUTME: Command-line interface definition using clap derive macros.
// ABOUTME: Defines all subcommands and their arguments.

use clap::{Parser, Subcommand};
use hostwire::config::Target;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "hostwire")]
#[command(about = "Bootstrap trust material and run commands on remote hosts over SSH")]
#[command(version)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file (default: discovered in the current directory)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate the root CA and key if missing, then print the authorized key
    Keys,

    /// Mint a server certificate signed by the root CA and store it
    ServerCert,

    /// Wait until a host accepts an SSH connection
    Probe {
        /// Host as [user@]host[:port]
        #[arg(long)]
        host: Target,

        /// Give up after this long
        #[arg(long, default_value = "60s", value_parser = humantime::parse_duration)]
        timeout: Duration,
    },

    /// Run a command on every host concurrently
    Exec {
        /// Hosts as [user@]host[:port]
        #[arg(long = "host", required = true)]
        hosts: Vec<Target>,

        /// Command line to run
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },

    /// Upload a local script and run it with sudo on every host
    Script {
        /// Hosts as [user@]host[:port]
        #[arg(long = "host", required = true)]
        hosts: Vec<Target>,

        /// Script to run
        file: PathBuf,
    },

    /// Copy a local file into a remote directory
    Upload {
        #[arg(long)]
        host: Target,

        local: PathBuf,

        remote_dir: String,
    },

    /// Copy a remote file into a local directory
    Download {
        #[arg(long)]
        host: Target,

        remote_file: String,

        local_dir: PathBuf,
    },
}
