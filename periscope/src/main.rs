use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use periscope::cert::{self, CertificateAuthority};
use periscope::logging;
use periscope::server::ProxyServer;
use periscope::tls::MitmState;

#[derive(Parser, Debug)]
#[command(name = "periscope", version, about = "Intercepting HTTP/HTTPS forward proxy")]
struct Cli {
    /// Port to bind on 127.0.0.1
    #[arg(short = 'p', long, default_value_t = 8899)]
    port: u16,

    /// Intercept CONNECT host:443 tunnels with locally issued certificates
    #[arg(short = 'm', long)]
    man_in_the_middle: bool,

    /// Directory holding root.ca.key, root.ca.pem and private.key
    #[arg(long, default_value = "certs")]
    cert_dir: PathBuf,

    /// Log file (stderr always receives a copy)
    #[arg(long, default_value = "proxy.log")]
    log_file: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_file)?;

    // Pin the ring CryptoProvider before any TLS config is built.
    cert::install_crypto_provider();

    let mitm = if cli.man_in_the_middle {
        let ca = CertificateAuthority::open(&cli.cert_dir)
            .context("CA material missing or unreadable")?;
        Some(MitmState::new(ca)?)
    } else {
        None
    };

    info!(port = cli.port, mitm = cli.man_in_the_middle, "starting periscope");
    let server = ProxyServer::bind(cli.port, mitm)?;
    server.run()
}
