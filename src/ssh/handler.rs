// ABOUTME: russh client handler and the host key policy it enforces.
// ABOUTME: Host keys are accepted blindly by default; known_hosts checking is opt-in.

use crate::config::HostKeyCheck;
use russh::client;
use russh::keys::known_hosts::{
    check_known_hosts, check_known_hosts_path, learn_known_hosts, learn_known_hosts_path,
};
use russh::keys::ssh_key;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Decides whether a server's host key is acceptable: `(host, port, key)`.
pub type HostKeyCallback = Arc<dyn Fn(&str, u16, &ssh_key::PublicKey) -> bool + Send + Sync>;

/// How the server's host key is verified.
///
/// [`HostKeyPolicy::AcceptAny`] is the default for freshly provisioned hosts
/// whose keys are not known yet. Authentication then rests only on the
/// client holding the root private key: the client proves who it is, but a
/// machine answering on the target address is not detected as an impostor.
/// Callers with a known_hosts file or their own fingerprint source should
/// use the other variants.
#[derive(Clone, Default)]
pub enum HostKeyPolicy {
    #[default]
    AcceptAny,
    KnownHosts {
        /// Defaults to `~/.ssh/known_hosts`.
        path: Option<PathBuf>,
        /// Accept and record keys for hosts not present yet.
        trust_on_first_use: bool,
    },
    Callback(HostKeyCallback),
}

impl HostKeyPolicy {
    pub fn from_settings(check: HostKeyCheck, path: Option<PathBuf>) -> Self {
        match check {
            HostKeyCheck::AcceptAny => Self::AcceptAny,
            HostKeyCheck::KnownHosts => Self::KnownHosts {
                path,
                trust_on_first_use: false,
            },
            HostKeyCheck::TrustOnFirstUse => Self::KnownHosts {
                path,
                trust_on_first_use: true,
            },
        }
    }

    pub fn callback<F>(f: F) -> Self
    where
        F: Fn(&str, u16, &ssh_key::PublicKey) -> bool + Send + Sync + 'static,
    {
        Self::Callback(Arc::new(f))
    }
}

impl fmt::Debug for HostKeyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AcceptAny => f.write_str("AcceptAny"),
            Self::KnownHosts {
                path,
                trust_on_first_use,
            } => f
                .debug_struct("KnownHosts")
                .field("path", path)
                .field("trust_on_first_use", trust_on_first_use)
                .finish(),
            Self::Callback(_) => f.write_str("Callback(<fn>)"),
        }
    }
}

/// SSH client handler for russh.
pub(crate) struct SshHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
}

impl SshHandler {
    pub(crate) fn new(host: String, port: u16, policy: HostKeyPolicy) -> Self {
        Self { host, port, policy }
    }

    fn check_known_hosts(
        &self,
        key: &ssh_key::PublicKey,
        path: Option<&PathBuf>,
        trust_on_first_use: bool,
    ) -> bool {
        let check_result = match path {
            Some(path) => check_known_hosts_path(&self.host, self.port, key, path),
            None => check_known_hosts(&self.host, self.port, key),
        };

        match check_result {
            Ok(true) => true,
            Ok(false) if trust_on_first_use => {
                tracing::warn!(
                    "Trust-On-First-Use: accepting unknown host key for {}:{}",
                    self.host,
                    self.port
                );
                let learn_result = match path {
                    Some(path) => learn_known_hosts_path(&self.host, self.port, key, path),
                    None => learn_known_hosts(&self.host, self.port, key),
                };
                if let Err(e) = learn_result {
                    tracing::warn!("Failed to save host key to known_hosts: {}", e);
                }
                true
            }
            Ok(false) => false,
            Err(russh::keys::Error::KeyChanged { line }) => {
                tracing::warn!(
                    "host key for {}:{} changed (known_hosts line {})",
                    self.host,
                    self.port,
                    line
                );
                false
            }
            Err(e) => {
                tracing::debug!("known_hosts lookup failed: {}", e);
                trust_on_first_use
            }
        }
    }
}

impl client::Handler for SshHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &ssh_key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let accepted = match &self.policy {
            HostKeyPolicy::AcceptAny => true,
            HostKeyPolicy::KnownHosts {
                path,
                trust_on_first_use,
            } => self.check_known_hosts(server_public_key, path.as_ref(), *trust_on_first_use),
            HostKeyPolicy::Callback(callback) => callback(&self.host, self.port, server_public_key),
        };
        Ok(accepted)
    }
}
