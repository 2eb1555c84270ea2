// ABOUTME: Test support utilities.
// ABOUTME: Provides tracing setup, trust store fixtures and the SSH container helper.

use hostwire::trust::TrustStore;
use std::sync::Once;
use tempfile::TempDir;

// Each test binary only uses some of these modules, so allow dead_code.
#[allow(dead_code)]
pub mod ssh_container;

static TRACING_INIT: Once = Once::new();

/// Initialize tracing for tests. Safe to call multiple times.
#[allow(dead_code)]
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        use tracing_subscriber::EnvFilter;
        let filter = EnvFilter::from_default_env()
            .add_directive("hostwire=debug".parse().unwrap())
            .add_directive("russh=info".parse().unwrap());
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Small keys keep generation fast; these stores never talk to a real sshd.
#[allow(dead_code)]
pub const FAST_RSA_BITS: usize = 1024;

/// A trust store rooted in a fresh temporary directory.
#[allow(dead_code)]
pub fn temp_store() -> (TempDir, TrustStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = TrustStore::new(dir.path().join("ssh")).rsa_bits(FAST_RSA_BITS);
    (dir, store)
}
