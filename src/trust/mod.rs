// ABOUTME: Local trust store holding the root CA, its RSA key and the SSH authorized key.
// ABOUTME: Generates the material lazily, all-or-nothing, under a per-store lock.

mod cert;

pub use cert::{CertPool, LeafCertificate, PemPair};

use crate::config::{MIN_RSA_BITS, RECOMMENDED_RSA_BITS, TrustConfig};
use crate::error::{Error, ErrorKind, Result};
use parking_lot::Mutex;
use rsa::RsaPrivateKey;
use rsa::pkcs1::DecodeRsaPrivateKey;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use x509_cert::Certificate;
use x509_cert::der::DecodePem;

pub use cert::{CA_SUBJECT, LEAF_SUBJECT};

pub const ROOT_KEY_FILE: &str = "key.pem";
pub const AUTHORIZED_KEY_FILE: &str = "key.pub";
pub const CA_FILE: &str = "ca.pem";
pub const SERVER_CERT_FILE: &str = "server.crt";
pub const SERVER_KEY_FILE: &str = "server.key";

const DIR_MODE: u32 = 0o700;
const PRIVATE_MODE: u32 = 0o600;
const PUBLIC_MODE: u32 = 0o644;

/// One file of the trust store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustFile {
    path: PathBuf,
}

impl TrustFile {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Fail with [`ErrorKind::MissingTrustMaterial`] unless the file exists.
    pub fn require(&self) -> Result<&Path> {
        if self.exists() {
            Ok(&self.path)
        } else {
            Err(Error::new(ErrorKind::MissingTrustMaterial(self.path.clone())))
        }
    }

    pub fn content(&self) -> Result<String> {
        self.require()?;
        fs::read_to_string(&self.path)
            .map_err(|e| Error::io(format!("cannot read {}", self.path.display()), e))
    }

    pub fn content_bytes(&self) -> Result<Vec<u8>> {
        self.require()?;
        fs::read(&self.path).map_err(|e| Error::io(format!("cannot read {}", self.path.display()), e))
    }

    /// Permission bits of the file.
    pub fn mode(&self) -> Result<u32> {
        let metadata = fs::metadata(self.require()?)
            .map_err(|e| Error::io(format!("cannot stat {}", self.path.display()), e))?;
        Ok(metadata.permissions().mode() & 0o777)
    }

    fn write(&self, content: &[u8], mode: u32) -> Result<()> {
        let io_err = |e| Error::io(format!("cannot write {}", self.path.display()), e);
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .open(&self.path)
            .map_err(io_err)?;
        file.write_all(content).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        // The umask may have narrowed the creation mode.
        fs::set_permissions(&self.path, fs::Permissions::from_mode(mode)).map_err(io_err)
    }
}

/// Root CA, RSA key pair and authorized key persisted under one directory.
///
/// `key.pem`, `key.pub` and `ca.pem` form a unit: if any of them is missing
/// the directory is wiped and all three are regenerated. Regeneration is
/// serialized by a guard that belongs to the store; stores sharing a
/// directory within one process should share the guard through
/// [`TrustStore::with_guard`]. Nothing protects against two processes
/// regenerating the same directory at once.
#[derive(Debug, Clone)]
pub struct TrustStore {
    dir: PathBuf,
    rsa_bits: usize,
    guard: Arc<Mutex<()>>,
}

impl TrustStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            rsa_bits: RECOMMENDED_RSA_BITS,
            guard: Arc::new(Mutex::new(())),
        }
    }

    pub fn from_config(config: &TrustConfig) -> Result<Self> {
        Ok(Self::new(config.resolved_dir()?).rsa_bits(config.rsa_bits))
    }

    /// Modulus size for keys generated from now on. Clamped to 1024 bits.
    pub fn rsa_bits(mut self, bits: usize) -> Self {
        self.rsa_bits = bits.max(MIN_RSA_BITS);
        self
    }

    pub fn with_guard(mut self, guard: Arc<Mutex<()>>) -> Self {
        self.guard = guard;
        self
    }

    pub fn guard(&self) -> Arc<Mutex<()>> {
        Arc::clone(&self.guard)
    }

    pub fn root(&self) -> &Path {
        &self.dir
    }

    fn child(&self, name: &str) -> TrustFile {
        TrustFile::new(self.dir.join(name))
    }

    pub fn root_key_pem(&self) -> TrustFile {
        self.child(ROOT_KEY_FILE)
    }

    pub fn root_authorized_key(&self) -> TrustFile {
        self.child(AUTHORIZED_KEY_FILE)
    }

    pub fn ca_file(&self) -> TrustFile {
        self.child(CA_FILE)
    }

    pub fn server_cert(&self) -> TrustFile {
        self.child(SERVER_CERT_FILE)
    }

    pub fn server_key(&self) -> TrustFile {
        self.child(SERVER_KEY_FILE)
    }

    pub fn has_root_keys(&self) -> bool {
        self.ca_file().exists() && self.root_key_pem().exists() && self.root_authorized_key().exists()
    }

    pub fn has_server_certificate(&self) -> bool {
        self.ca_file().exists() && self.server_cert().exists() && self.server_key().exists()
    }

    /// Make sure the root material exists, generating all of it if any part
    /// is missing. Returns `true` when material was generated.
    pub fn ensure_root_keys_exist(&self) -> Result<bool> {
        let _held = self.guard.lock();
        if self.has_root_keys() {
            return Ok(false);
        }
        tracing::info!("generating root trust material in {}", self.dir.display());
        self.create_and_persist_root()?;
        Ok(true)
    }

    fn create_and_persist_root(&self) -> Result<()> {
        self.reset_dir()?;

        if self.rsa_bits < RECOMMENDED_RSA_BITS {
            tracing::warn!(
                "root key uses {} bits; {} or more is recommended",
                self.rsa_bits,
                RECOMMENDED_RSA_BITS
            );
        }

        let key = cert::generate_key(self.rsa_bits)?;
        let ca = cert::new_root_ca(&key)?;

        self.ca_file()
            .write(cert::certificate_to_pem(&ca)?.as_bytes(), PUBLIC_MODE)?;
        self.root_key_pem()
            .write(cert::key_to_pem(&key)?.as_bytes(), PRIVATE_MODE)?;
        self.root_authorized_key()
            .write(cert::authorized_key(&key.to_public_key())?.as_bytes(), PUBLIC_MODE)?;
        Ok(())
    }

    fn reset_dir(&self) -> Result<()> {
        let io_err = |e| Error::io(format!("cannot reset {}", self.dir.display()), e);
        if self.dir.exists() {
            fs::remove_dir_all(&self.dir).map_err(io_err)?;
        }
        fs::create_dir_all(&self.dir).map_err(io_err)?;
        fs::set_permissions(&self.dir, fs::Permissions::from_mode(DIR_MODE)).map_err(io_err)
    }

    /// Parse the stored CA certificate.
    pub fn ca(&self) -> Result<Certificate> {
        let pem = self.ca_file().content_bytes()?;
        Certificate::from_pem(&pem)
            .map_err(|e| Error::new(ErrorKind::Crypto(format!("cannot parse CA certificate: {e}"))))
    }

    /// Parse the stored root private key.
    pub fn root_key(&self) -> Result<RsaPrivateKey> {
        let pem = self.root_key_pem().content()?;
        RsaPrivateKey::from_pkcs1_pem(&pem)
            .map_err(|e| Error::new(ErrorKind::Crypto(format!("cannot parse root key: {e}"))))
    }

    /// CA certificate and root key as a PEM pair.
    pub fn root_certificate(&self) -> Result<PemPair> {
        Ok(PemPair {
            certificate_pem: self.ca_file().content()?,
            private_key_pem: self.root_key_pem().content()?,
        })
    }

    /// Mint a new leaf certificate signed by the root. The caller decides
    /// whether and where to store it.
    pub fn new_server_certificate(&self) -> Result<LeafCertificate> {
        let ca = self.ca()?;
        let key = self.root_key()?;
        cert::new_server_certificate(&ca, &key, self.rsa_bits)
    }

    /// Store `leaf` as `server.crt` / `server.key` next to the root material.
    pub fn persist_server_certificate(&self, leaf: &LeafCertificate) -> Result<()> {
        self.server_cert()
            .write(leaf.certificate_pem.as_bytes(), PUBLIC_MODE)?;
        self.server_key()
            .write(leaf.private_key_pem.as_bytes(), PRIVATE_MODE)
    }

    /// Read back the persisted `server.crt` / `server.key` pair, failing
    /// with [`ErrorKind::Crypto`] when the key does not belong to the
    /// certificate.
    pub fn server_certificate(&self) -> Result<LeafCertificate> {
        cert::load_server_certificate(self.server_cert().content()?, self.server_key().content()?)
    }

    /// Verification pool containing only the CA certificate.
    pub fn cert_pool(&self) -> Result<CertPool> {
        CertPool::from_pem(&self.ca_file().content_bytes()?)
    }
}
