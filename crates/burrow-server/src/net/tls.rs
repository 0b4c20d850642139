//! TLS for the tunnel protocol and for QUIC.
//!
//! A configured certificate/key pair is used when present; otherwise a
//! self-signed certificate is generated at startup so TLS transports work
//! out of the box.

use crate::config::ServerConfig;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsAcceptor;
use tracing::info;

fn load_or_generate(
    cfg: &ServerConfig,
) -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let tls = &cfg.transport.tls;
    if tls.cert_file.as_os_str().is_empty() || tls.key_file.as_os_str().is_empty() {
        let cert = rcgen::generate_simple_self_signed(vec![
            "localhost".to_string(),
            cfg.bind_addr.clone(),
        ])?;
        info!("generated self-signed tls certificate");
        let cert_der = CertificateDer::from(cert.cert.der().to_vec());
        let key_der = PrivateKeyDer::try_from(cert.key_pair.serialize_der())
            .map_err(|e| anyhow::anyhow!("self-signed key: {e}"))?;
        return Ok((vec![cert_der], key_der));
    }
    let certs = load_certs(&tls.cert_file)?;
    let key = load_key(&tls.key_file)?;
    Ok((certs, key))
}

fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(std::fs::File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        anyhow::bail!("no certificates found in {}", path.display());
    }
    Ok(certs)
}

fn load_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(std::fs::File::open(path)?);
    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| anyhow::anyhow!("no private key found in {}", path.display()))
}

/// Acceptor for tunnel-over-TLS connections on the bind port.
pub fn acceptor(cfg: &ServerConfig) -> anyhow::Result<TlsAcceptor> {
    let (certs, key) = load_or_generate(cfg)?;
    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

/// rustls config for the QUIC endpoint, with the tunnel ALPN.
pub fn quic_server_config(cfg: &ServerConfig) -> anyhow::Result<rustls::ServerConfig> {
    let (certs, key) = load_or_generate(cfg)?;
    let mut server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    server_config.alpn_protocols = vec![b"frp".to_vec()];
    Ok(server_config)
}
