//! Upstream-facing trust configuration and the MITM context shared by
//! sessions.

use std::sync::Arc;

use anyhow::Result;
use rustls::{ClientConfig, RootCertStore};
use tracing::warn;

use crate::cert::CertificateAuthority;

/// Port whose CONNECT tunnels are intercepted when MITM mode is on.
pub const TLS_INTERCEPT_PORT: u16 = 443;

/// Everything a session needs to interpose on a TLS tunnel: the issuing CA,
/// the upstream-facing trust configuration, and the port that triggers
/// interception.
pub struct MitmState {
    pub ca: CertificateAuthority,
    pub upstream_config: Arc<ClientConfig>,
    pub intercept_port: u16,
}

impl MitmState {
    pub fn new(ca: CertificateAuthority) -> Result<Self> {
        Ok(Self {
            ca,
            upstream_config: upstream_client_config()?,
            intercept_port: TLS_INTERCEPT_PORT,
        })
    }

    /// Whether a CONNECT tunnel to `port` should be intercepted.
    pub fn intercepts(&self, port: u16) -> bool {
        port == self.intercept_port
    }
}

/// Client-side TLS config for origin connections: platform trust roots,
/// falling back to the bundled webpki roots when none can be loaded.
pub fn upstream_client_config() -> Result<Arc<ClientConfig>> {
    crate::cert::install_crypto_provider();
    let mut roots = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for err in &native.errors {
        warn!("skipping unreadable platform trust root: {err}");
    }
    let (added, _) = roots.add_parsable_certificates(native.certs);
    if added == 0 {
        warn!("no platform trust roots loaded, falling back to bundled webpki roots");
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}
