// ABOUTME: X.509 certificate minting for the root CA and TLS leaf certificates.
// ABOUTME: Also provides a verification pool holding only the root CA.

use crate::error::{Error, ErrorKind, Result};
use const_oid::db::rfc5280::{ID_KP_CLIENT_AUTH, ID_KP_SERVER_AUTH};
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::DecodePublicKey;
use rsa::signature::Verifier;
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use russh::keys::ssh_key::public::{KeyData, RsaPublicKey as SshRsaPublicKey};
use russh::keys::ssh_key::{Mpint, PublicKey};
use sha2::Sha256;
use std::fmt::Display;
use std::net::Ipv4Addr;
use std::time::{Duration, SystemTime};
use x509_cert::Certificate;
use x509_cert::builder::{Builder, CertificateBuilder, Profile};
use x509_cert::der::asn1::OctetString;
use x509_cert::der::{DecodePem, Encode, EncodePem, pem::LineEnding};
use x509_cert::ext::pkix::name::GeneralName;
use x509_cert::ext::pkix::{
    BasicConstraints, ExtendedKeyUsage, KeyUsage, KeyUsages, SubjectAltName,
};
use x509_cert::name::Name;
use x509_cert::serial_number::SerialNumber;
use x509_cert::spki::SubjectPublicKeyInfoOwned;
use x509_cert::time::Validity;

/// Subject (and issuer) of the self-signed root.
pub const CA_SUBJECT: &str = "CN=hostwire,O=Hostwire,C=FR";

/// Subject of minted leaf certificates.
pub const LEAF_SUBJECT: &str = "O=Hostwire,C=FR";

pub const CA_SERIAL: u32 = 2019;

/// Ten years, ignoring leap days.
pub const VALIDITY: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// Address every leaf certificate is issued for.
pub const LEAF_IP: Ipv4Addr = Ipv4Addr::LOCALHOST;

/// A certificate and its private key, both PEM encoded.
#[derive(Clone)]
pub struct PemPair {
    pub certificate_pem: String,
    pub private_key_pem: String,
}

impl std::fmt::Debug for PemPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PemPair")
            .field("certificate_pem", &self.certificate_pem)
            .field("private_key_pem", &"<redacted>")
            .finish()
    }
}

/// TLS material signed by the root CA.
pub type LeafCertificate = PemPair;

fn crypto<E: Display>(context: &'static str) -> impl FnOnce(E) -> Error {
    move |e| Error::new(ErrorKind::Crypto(format!("{context}: {e}")))
}

pub(crate) fn generate_key(bits: usize) -> Result<RsaPrivateKey> {
    let mut rng = rand::thread_rng();
    RsaPrivateKey::new(&mut rng, bits).map_err(crypto("cannot generate RSA key"))
}

fn parse_name(name: &str) -> Result<Name> {
    name.parse::<Name>().map_err(crypto("invalid distinguished name"))
}

fn key_info(key: &RsaPrivateKey) -> Result<SubjectPublicKeyInfoOwned> {
    SubjectPublicKeyInfoOwned::from_key(key.to_public_key())
        .map_err(crypto("cannot encode public key"))
}

fn usages() -> ExtendedKeyUsage {
    ExtendedKeyUsage(vec![ID_KP_CLIENT_AUTH, ID_KP_SERVER_AUTH])
}

/// Build the self-signed CA certificate for `key`: CA=true, key usage
/// digital-signature + cert-sign, extended usage client + server auth.
pub fn new_root_ca(key: &RsaPrivateKey) -> Result<Certificate> {
    let signer = SigningKey::<Sha256>::new(key.clone());
    let validity = Validity::from_now(VALIDITY).map_err(crypto("invalid validity"))?;

    let mut builder = CertificateBuilder::new(
        Profile::Manual { issuer: None },
        SerialNumber::from(CA_SERIAL),
        validity,
        parse_name(CA_SUBJECT)?,
        key_info(key)?,
        &signer,
    )
    .map_err(crypto("cannot prepare CA certificate"))?;

    builder
        .add_extension(&BasicConstraints {
            ca: true,
            path_len_constraint: None,
        })
        .map_err(crypto("basic constraints"))?;
    builder
        .add_extension(&KeyUsage(
            KeyUsages::DigitalSignature | KeyUsages::KeyCertSign,
        ))
        .map_err(crypto("key usage"))?;
    builder
        .add_extension(&usages())
        .map_err(crypto("extended key usage"))?;

    builder
        .build::<Signature>()
        .map_err(crypto("cannot sign CA certificate"))
}

/// Mint a fresh key pair and a leaf certificate for 127.0.0.1 signed by the CA.
pub fn new_server_certificate(
    ca: &Certificate,
    ca_key: &RsaPrivateKey,
    bits: usize,
) -> Result<LeafCertificate> {
    let leaf_key = generate_key(bits)?;
    let signer = SigningKey::<Sha256>::new(ca_key.clone());
    let validity = Validity::from_now(VALIDITY).map_err(crypto("invalid validity"))?;
    let serial = SerialNumber::from(rand::random::<u32>());

    let mut builder = CertificateBuilder::new(
        Profile::Manual {
            issuer: Some(ca.tbs_certificate.subject.clone()),
        },
        serial,
        validity,
        parse_name(LEAF_SUBJECT)?,
        key_info(&leaf_key)?,
        &signer,
    )
    .map_err(crypto("cannot prepare server certificate"))?;

    let ip = OctetString::new(LEAF_IP.octets().to_vec()).map_err(crypto("ip address"))?;
    builder
        .add_extension(&SubjectAltName(vec![GeneralName::IpAddress(ip)]))
        .map_err(crypto("subject alternative name"))?;
    builder
        .add_extension(&KeyUsage(KeyUsages::DigitalSignature.into()))
        .map_err(crypto("key usage"))?;
    builder
        .add_extension(&usages())
        .map_err(crypto("extended key usage"))?;

    let certificate = builder
        .build::<Signature>()
        .map_err(crypto("cannot sign server certificate"))?;

    Ok(PemPair {
        certificate_pem: certificate_to_pem(&certificate)?,
        private_key_pem: key_to_pem(&leaf_key)?,
    })
}

pub(crate) fn certificate_to_pem(certificate: &Certificate) -> Result<String> {
    certificate
        .to_pem(LineEnding::LF)
        .map_err(crypto("cannot encode certificate"))
}

pub(crate) fn key_to_pem(key: &RsaPrivateKey) -> Result<String> {
    key.to_pkcs1_pem(rsa::pkcs1::LineEnding::LF)
        .map(|pem| pem.as_str().to_owned())
        .map_err(crypto("cannot encode private key"))
}

/// OpenSSH `authorized_keys` line for `key`, newline terminated.
pub(crate) fn authorized_key(key: &RsaPublicKey) -> Result<String> {
    let mpint = |bytes: Vec<u8>| {
        Mpint::from_positive_bytes(&bytes).map_err(crypto("cannot encode RSA component"))
    };
    let data = KeyData::Rsa(SshRsaPublicKey {
        e: mpint(key.e().to_bytes_be())?,
        n: mpint(key.n().to_bytes_be())?,
    });
    let line = PublicKey::from(data)
        .to_openssh()
        .map_err(crypto("cannot encode authorized key"))?;
    Ok(format!("{line}\n"))
}

/// Leaf certificate and key read back from disk; fails unless the
/// certificate carries the public half of the key.
pub(crate) fn load_server_certificate(
    certificate_pem: String,
    private_key_pem: String,
) -> Result<LeafCertificate> {
    let certificate = Certificate::from_pem(certificate_pem.as_bytes())
        .map_err(crypto("cannot parse server certificate"))?;
    let key = RsaPrivateKey::from_pkcs1_pem(&private_key_pem)
        .map_err(crypto("cannot parse server key"))?;

    let spki = certificate
        .tbs_certificate
        .subject_public_key_info
        .to_der()
        .map_err(crypto("cannot encode certificate key"))?;
    let certified =
        RsaPublicKey::from_public_key_der(&spki).map_err(crypto("certificate key is not RSA"))?;
    if certified != key.to_public_key() {
        return Err(Error::new(ErrorKind::Crypto(
            "server key does not match server certificate".to_string(),
        )));
    }

    Ok(PemPair {
        certificate_pem,
        private_key_pem,
    })
}

/// Certificates trusted to issue leaves; built from the CA file only.
#[derive(Debug, Clone)]
pub struct CertPool {
    roots: Vec<Certificate>,
}

impl CertPool {
    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        let roots = Certificate::load_pem_chain(pem).map_err(crypto("cannot parse CA PEM"))?;
        if roots.is_empty() {
            return Err(Error::new(ErrorKind::Crypto(
                "CA PEM contains no certificate".to_string(),
            )));
        }
        Ok(Self { roots })
    }

    pub fn roots(&self) -> &[Certificate] {
        &self.roots
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Check that `leaf` was issued by a pooled root and is still valid.
    pub fn verify(&self, leaf: &Certificate) -> Result<()> {
        let tbs = &leaf.tbs_certificate;
        let root = self
            .roots
            .iter()
            .find(|root| root.tbs_certificate.subject == tbs.issuer)
            .ok_or_else(|| {
                Error::new(ErrorKind::Crypto(format!(
                    "issuer {} is not in the pool",
                    tbs.issuer
                )))
            })?;

        if tbs.validity.not_after.to_system_time() < SystemTime::now() {
            return Err(Error::new(ErrorKind::Crypto(
                "certificate has expired".to_string(),
            )));
        }

        let spki = root
            .tbs_certificate
            .subject_public_key_info
            .to_der()
            .map_err(crypto("cannot encode issuer key"))?;
        let issuer_key =
            RsaPublicKey::from_public_key_der(&spki).map_err(crypto("issuer key is not RSA"))?;
        let verifying_key = VerifyingKey::<Sha256>::new(issuer_key);

        let message = tbs.to_der().map_err(crypto("cannot encode certificate body"))?;
        let raw = leaf.signature.as_bytes().ok_or_else(|| {
            Error::new(ErrorKind::Crypto("malformed signature bits".to_string()))
        })?;
        let signature = Signature::try_from(raw).map_err(crypto("malformed signature"))?;

        verifying_key
            .verify(&message, &signature)
            .map_err(crypto("signature does not match issuer"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_ca_is_self_issued() {
        let key = generate_key(1024).unwrap();
        let ca = new_root_ca(&key).unwrap();
        assert_eq!(ca.tbs_certificate.issuer, ca.tbs_certificate.subject);
        assert_eq!(ca.tbs_certificate.serial_number, SerialNumber::from(CA_SERIAL));

        let pool = CertPool::from_pem(certificate_to_pem(&ca).unwrap().as_bytes()).unwrap();
        pool.verify(&ca).expect("self-signed root verifies against itself");
    }

    #[test]
    fn leaf_verifies_against_issuing_ca_only() {
        let key = generate_key(1024).unwrap();
        let ca = new_root_ca(&key).unwrap();
        let leaf = new_server_certificate(&ca, &key, 1024).unwrap();
        let leaf_cert = Certificate::from_pem(leaf.certificate_pem.as_bytes()).unwrap();

        let pool = CertPool::from_pem(certificate_to_pem(&ca).unwrap().as_bytes()).unwrap();
        pool.verify(&leaf_cert).expect("leaf signed by pooled CA");

        let other_key = generate_key(1024).unwrap();
        let other_ca = new_root_ca(&other_key).unwrap();
        let other_pool =
            CertPool::from_pem(certificate_to_pem(&other_ca).unwrap().as_bytes()).unwrap();
        assert!(other_pool.verify(&leaf_cert).is_err());
    }

    #[test]
    fn authorized_key_is_a_single_ssh_rsa_line() {
        let key = generate_key(1024).unwrap();
        let line = authorized_key(&key.to_public_key()).unwrap();

        assert!(line.starts_with("ssh-rsa AAAAB3NzaC1yc2E"));
        assert!(line.ends_with('\n'));
        assert_eq!(line.trim_end().split(' ').count(), 2);

        let parsed = PublicKey::from_openssh(line.trim_end()).unwrap();
        let KeyData::Rsa(rsa) = parsed.key_data() else {
            panic!("expected an RSA key");
        };
        assert_eq!(rsa.n.as_positive_bytes().unwrap(), key.n().to_bytes_be());
    }

    #[test]
    fn mismatched_server_key_is_rejected() {
        let key = generate_key(1024).unwrap();
        let ca = new_root_ca(&key).unwrap();
        let leaf = new_server_certificate(&ca, &key, 1024).unwrap();
        let other = new_server_certificate(&ca, &key, 1024).unwrap();

        load_server_certificate(leaf.certificate_pem.clone(), leaf.private_key_pem.clone())
            .expect("matching pair loads");
        let err = load_server_certificate(leaf.certificate_pem, other.private_key_pem).unwrap_err();
        assert!(matches!(err.kind(), Some(ErrorKind::Crypto(_))));
    }

    #[test]
    fn garbage_pem_is_rejected() {
        assert!(CertPool::from_pem(b"not a certificate").is_err());
    }
}
