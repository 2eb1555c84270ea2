// ABOUTME: SSH client module for remote hosts authenticated with the trust store's root key.
// ABOUTME: Command and script execution, SCP file transfer and the reachability probe.

mod client;
mod handler;
mod input;
mod probe;
pub mod scp;

pub use client::{Client, CommandOutput, ConnectConfig, SCRIPT_DIR, Stdio};
pub use handler::{HostKeyCallback, HostKeyPolicy};
pub use probe::{check_ssh, check_ssh_every};
