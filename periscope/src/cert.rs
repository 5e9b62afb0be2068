//! Certificate authority for TLS interception: pre-provisioned root
//! material, per-hostname leaf certificates memoized on disk.

use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Once, PoisonError};

use anyhow::{Context, Result};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use rustls::pki_types::CertificateDer;
use rustls::ServerConfig;
use time::{Duration, OffsetDateTime};
use tracing::info;

/// Validity window for issued leaf certificates.
const LEAF_VALIDITY_DAYS: i64 = 365;

/// Installs the ring CryptoProvider as the process default on first use.
/// The rustls config builders require one; repeated calls are no-ops, so
/// every entry point that builds TLS configs can call this safely.
pub fn install_crypto_provider() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Certificate authority backed by root material that must already exist on
/// disk (`root.ca.key`, `root.ca.pem`, `private.key`); provisioning is
/// external.
///
/// Leaf certificates are memoized under the same directory and path
/// existence is the cache test, so issuance publishes via a temp file and
/// rename. One private key is shared by every leaf — only the certificate
/// differs per hostname, and the key never leaves this process.
pub struct CertificateAuthority {
    cert_dir: PathBuf,
    ca_cert: rcgen::Certificate,
    ca_key: KeyPair,
    ca_cert_pem: String,
    leaf_key: KeyPair,
    leaf_key_pem: String,
    issue_lock: Mutex<()>,
}

impl CertificateAuthority {
    /// Loads the root CA key/cert and the shared leaf key from `cert_dir`.
    pub fn open(cert_dir: &Path) -> Result<Self> {
        install_crypto_provider();
        let ca_key_pem = fs::read_to_string(cert_dir.join("root.ca.key"))
            .with_context(|| format!("read root CA key in {}", cert_dir.display()))?;
        let ca_cert_pem = fs::read_to_string(cert_dir.join("root.ca.pem"))
            .with_context(|| format!("read root CA cert in {}", cert_dir.display()))?;
        let leaf_key_pem = fs::read_to_string(cert_dir.join("private.key"))
            .with_context(|| format!("read shared leaf key in {}", cert_dir.display()))?;

        let ca_key = KeyPair::from_pem(&ca_key_pem).context("parse root CA key")?;
        // Rebuild the issuer from the on-disk PEM so leaf issuer DNs match
        // the root certificate clients have installed.
        let ca_cert = CertificateParams::from_ca_cert_pem(&ca_cert_pem)
            .context("parse root CA cert")?
            .self_signed(&ca_key)
            .context("reconstruct root CA cert")?;
        let leaf_key = KeyPair::from_pem(&leaf_key_pem).context("parse shared leaf key")?;

        Ok(Self {
            cert_dir: cert_dir.to_path_buf(),
            ca_cert,
            ca_key,
            ca_cert_pem,
            leaf_key,
            leaf_key_pem,
            issue_lock: Mutex::new(()),
        })
    }

    pub fn cert_dir(&self) -> &Path {
        &self.cert_dir
    }

    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// Returns the path of the leaf certificate for `hostname`, issuing and
    /// caching it on first use. Issuance is serialized so concurrent
    /// sessions opening the same unseen hostname produce the file exactly
    /// once.
    pub fn ensure_leaf_cert(&self, hostname: &str) -> Result<PathBuf> {
        let cert_path = self.cert_dir.join(format!("{hostname}.crt"));
        if cert_path.exists() {
            return Ok(cert_path);
        }
        let _guard = self.issue_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if cert_path.exists() {
            return Ok(cert_path);
        }

        let mut params = CertificateParams::new(vec![hostname.to_owned()])
            .with_context(|| format!("leaf params for {hostname}"))?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, hostname);
        params.distinguished_name = dn;
        params.not_before = OffsetDateTime::now_utc();
        params.not_after = params.not_before + Duration::days(LEAF_VALIDITY_DAYS);

        let leaf = params
            .signed_by(&self.leaf_key, &self.ca_cert, &self.ca_key)
            .with_context(|| format!("sign leaf cert for {hostname}"))?;

        let tmp_path = self.cert_dir.join(format!("{hostname}.crt.tmp"));
        fs::write(&tmp_path, leaf.pem())
            .with_context(|| format!("write {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &cert_path)
            .with_context(|| format!("publish {}", cert_path.display()))?;
        info!(host = hostname, path = %cert_path.display(), "issued leaf certificate");
        Ok(cert_path)
    }

    /// Server-side TLS config presenting the leaf for `hostname`, chained to
    /// the root and keyed by the shared leaf key. No client auth.
    pub fn server_config_for_host(&self, hostname: &str) -> Result<Arc<ServerConfig>> {
        let cert_path = self.ensure_leaf_cert(hostname)?;
        let leaf_pem = fs::read_to_string(&cert_path)
            .with_context(|| format!("read {}", cert_path.display()))?;

        let mut chain: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut Cursor::new(leaf_pem.as_bytes()))
                .collect::<Result<_, _>>()
                .context("parse leaf cert PEM")?;
        let roots: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut Cursor::new(self.ca_cert_pem.as_bytes()))
                .collect::<Result<_, _>>()
                .context("parse root CA cert PEM")?;
        chain.extend(roots);

        let key = rustls_pemfile::private_key(&mut Cursor::new(self.leaf_key_pem.as_bytes()))
            .context("parse shared leaf key PEM")?
            .context("no private key in shared leaf key PEM")?;

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .with_context(|| format!("server TLS config for {hostname}"))?;
        Ok(Arc::new(config))
    }
}
