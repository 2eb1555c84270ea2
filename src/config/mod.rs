// ABOUTME: Configuration types and parsing for hostwire.yml.
// ABOUTME: Covers the trust store location, SSH client defaults and probe cadence.

mod target;

pub use target::Target;

use crate::error::{Error, ErrorKind, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILENAME: &str = "hostwire.yml";
pub const CONFIG_FILENAME_ALT: &str = "hostwire.yaml";
pub const CONFIG_FILENAME_DIR: &str = ".hostwire/config.yml";

/// Environment variable that overrides `trust.dir`.
pub const TRUST_DIR_ENV: &str = "HOSTWIRE_TRUST_DIR";

/// Smallest RSA modulus accepted for the root key.
pub const MIN_RSA_BITS: usize = 1024;

/// RSA sizes below this are accepted but logged as weak.
pub const RECOMMENDED_RSA_BITS: usize = 2048;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub trust: TrustConfig,

    #[serde(default)]
    pub ssh: SshConfig,

    #[serde(default)]
    pub probe: ProbeConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrustConfig {
    /// Trust store directory. Defaults to `$HOME/.hostwire/ssh`.
    #[serde(default)]
    pub dir: Option<PathBuf>,

    /// Modulus size for newly generated RSA keys.
    #[serde(default = "default_rsa_bits")]
    pub rsa_bits: usize,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            dir: None,
            rsa_bits: default_rsa_bits(),
        }
    }
}

fn default_rsa_bits() -> usize {
    RECOMMENDED_RSA_BITS
}

impl TrustConfig {
    /// Resolve the trust directory: environment override, then the configured
    /// path (with `~/` expanded), then the default under `$HOME`.
    pub fn resolved_dir(&self) -> Result<PathBuf> {
        if let Ok(dir) = std::env::var(TRUST_DIR_ENV) {
            if !dir.is_empty() {
                return Ok(PathBuf::from(dir));
            }
        }

        match &self.dir {
            Some(dir) => expand_home(dir),
            None => Ok(home_dir()?.join(".hostwire").join("ssh")),
        }
    }
}

fn home_dir() -> Result<PathBuf> {
    std::env::var("HOME")
        .map(PathBuf::from)
        .map_err(|_| Error::new(ErrorKind::Config("HOME is not set".to_string())))
}

fn expand_home(path: &Path) -> Result<PathBuf> {
    match path.strip_prefix("~") {
        Ok(rest) => Ok(home_dir()?.join(rest)),
        Err(_) => Ok(path.to_path_buf()),
    }
}

/// How the server's host key is checked when connecting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyCheck {
    /// Accept any host key. Trust rests on possession of the root private
    /// key, which freshly provisioned hosts are seeded with; a host that
    /// impersonates the target is not detected.
    #[default]
    AcceptAny,
    /// Require the key to be present in known_hosts.
    KnownHosts,
    /// Accept and record unknown keys, reject changed ones.
    TrustOnFirstUse,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SshConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_user")]
    pub user: String,

    #[serde(default)]
    pub host_key: HostKeyCheck,

    #[serde(default)]
    pub known_hosts_path: Option<PathBuf>,

    #[serde(default = "default_inactivity_timeout", with = "humantime_serde")]
    pub inactivity_timeout: Duration,

    #[serde(default = "default_command_timeout", with = "humantime_serde")]
    pub command_timeout: Duration,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            user: default_user(),
            host_key: HostKeyCheck::default(),
            known_hosts_path: None,
            inactivity_timeout: default_inactivity_timeout(),
            command_timeout: default_command_timeout(),
        }
    }
}

fn default_port() -> u16 {
    22
}

fn default_user() -> String {
    "root".to_string()
}

fn default_inactivity_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(300)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProbeConfig {
    #[serde(default = "default_probe_interval", with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval: default_probe_interval(),
        }
    }
}

fn default_probe_interval() -> Duration {
    Duration::from_secs(1)
}

impl Config {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::io(format!("cannot read {}", path.display()), e))?;
        Self::from_yaml(&content)
    }

    /// Load the first config file found in `dir`, or defaults if none exists.
    pub fn discover(dir: &Path) -> Result<Self> {
        let candidates = [
            dir.join(CONFIG_FILENAME),
            dir.join(CONFIG_FILENAME_ALT),
            dir.join(CONFIG_FILENAME_DIR),
        ];

        for path in &candidates {
            if path.exists() {
                tracing::debug!("loading configuration from {}", path.display());
                return Self::load(path);
            }
        }

        Ok(Self::default())
    }

    pub fn validate(&self) -> Result<()> {
        if self.trust.rsa_bits < MIN_RSA_BITS {
            return Err(Error::new(ErrorKind::Config(format!(
                "trust.rsa_bits must be at least {MIN_RSA_BITS}, got {}",
                self.trust.rsa_bits
            ))));
        }
        if self.probe.interval.is_zero() {
            return Err(Error::new(ErrorKind::Config(
                "probe.interval must be greater than zero".to_string(),
            )));
        }
        if self.ssh.host_key == HostKeyCheck::AcceptAny && self.ssh.known_hosts_path.is_some() {
            return Err(Error::new(ErrorKind::Config(
                "ssh.known_hosts_path requires host_key to be known-hosts or trust-on-first-use"
                    .to_string(),
            )));
        }
        Ok(())
    }
}
