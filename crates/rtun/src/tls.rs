//! Loads a Gateway's TLS certificate and key from disk once, in the shapes each
//! transport backend wants them: DER for `rustls`/`quinn`, raw PEM bytes for `tonic`.

use std::path::Path;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};

pub struct CertMaterial {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

impl CertMaterial {
    pub fn load(cert_path: &Path, key_path: &Path) -> eyre::Result<Self> {
        let cert_pem = std::fs::read(cert_path)
            .map_err(|e| eyre::eyre!("reading TLS certificate at {}: {e}", cert_path.display()))?;
        let key_pem = std::fs::read(key_path)
            .map_err(|e| eyre::eyre!("reading TLS key at {}: {e}", key_path.display()))?;
        Ok(Self { cert_pem, key_pem })
    }

    pub fn der_chain(&self) -> eyre::Result<Vec<CertificateDer<'static>>> {
        rustls_pemfile::certs(&mut &self.cert_pem[..])
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| eyre::eyre!("no usable certificates in TLS cert file: {e}"))
    }

    pub fn der_key(&self) -> eyre::Result<PrivateKeyDer<'static>> {
        rustls_pemfile::private_key(&mut &self.key_pem[..])?
            .ok_or_else(|| eyre::eyre!("no private key found in TLS key file"))
    }

    pub fn rustls_server_config(&self) -> eyre::Result<rustls::ServerConfig> {
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(self.der_chain()?, self.der_key()?)?;
        Ok(config)
    }
}
