//! Mutual-TLS context construction.
//!
//! A node's TLS material lives in its `ssl_location` directory:
//!
//! ```text
//! <ssl_location>/node.key   private key
//! <ssl_location>/node.crt   certificate signed by the mesh CA
//! <ssl_location>/ca.crt     CA root — the only trust anchor
//! <ssl_location>/crl.pem    latest revocation list
//! ```
//!
//! Both directions verify the peer chain against the CA root and consult
//! the CRL before any envelope is processed; a revoked or invalid peer is
//! cut at the handshake.

use rustls::client::WebPkiServerVerifier;
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pki_types::{CertificateDer, CertificateRevocationListDer, PrivateKeyDer, ServerName};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio_rustls::{TlsAcceptor, TlsConnector};

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("no usable material in {0}")]
    EmptyPem(PathBuf),

    #[error("tls error: {0}")]
    Rustls(#[from] rustls::Error),

    #[error("verifier construction failed: {0}")]
    Verifier(String),

    #[error("invalid server name: {0}")]
    ServerName(String),
}

/// Acceptor + connector pair sharing the same identity and trust anchors.
#[derive(Clone)]
pub struct TlsContext {
    acceptor: TlsAcceptor,
    connector: TlsConnector,
}

impl TlsContext {
    /// Build from on-disk material. Fails fast on missing or unparsable
    /// files — a node with TLS enabled must not silently run in the clear.
    pub fn from_dir(dir: &Path) -> Result<Self, TlsError> {
        let chain = load_certs(&dir.join("node.crt"))?;
        let key = load_key(&dir.join("node.key"))?;
        let roots = load_root_store(&dir.join("ca.crt"))?;
        let crls = load_crls(&dir.join("crl.pem"))?;

        let client_verifier = WebPkiClientVerifier::builder(Arc::new(roots.clone()))
            .with_crls(crls.clone())
            .build()
            .map_err(|e| TlsError::Verifier(e.to_string()))?;
        let server_config = ServerConfig::builder()
            .with_client_cert_verifier(client_verifier)
            .with_single_cert(chain.clone(), key.clone_key())?;

        let server_verifier = WebPkiServerVerifier::builder(Arc::new(roots))
            .with_crls(crls)
            .build()
            .map_err(|e| TlsError::Verifier(e.to_string()))?;
        let client_config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(server_verifier)
            .with_client_auth_cert(chain, key)?;

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(server_config)),
            connector: TlsConnector::from(Arc::new(client_config)),
        })
    }

    pub fn acceptor(&self) -> &TlsAcceptor {
        &self.acceptor
    }

    pub fn connector(&self) -> &TlsConnector {
        &self.connector
    }

    pub fn server_name(host: &str) -> Result<ServerName<'static>, TlsError> {
        ServerName::try_from(host.to_string()).map_err(|e| TlsError::ServerName(e.to_string()))
    }
}

fn open(path: &Path) -> Result<BufReader<std::fs::File>, TlsError> {
    std::fs::File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsError::Io {
            path: path.to_path_buf(),
            source,
        })
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs: Vec<_> = rustls_pemfile::certs(&mut open(path)?)
        .collect::<Result<_, _>>()
        .map_err(|source| TlsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsError::EmptyPem(path.to_path_buf()));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    rustls_pemfile::private_key(&mut open(path)?)
        .map_err(|source| TlsError::Io {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TlsError::EmptyPem(path.to_path_buf()))
}

fn load_root_store(path: &Path) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|e| TlsError::Verifier(e.to_string()))?;
    }
    Ok(roots)
}

fn load_crls(path: &Path) -> Result<Vec<CertificateRevocationListDer<'static>>, TlsError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    rustls_pemfile::crls(&mut open(path)?)
        .collect::<Result<_, _>>()
        .map_err(|source| TlsError::Io {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::{CaConfig, CertificateAuthority};
    use crate::net::envelope::{
        CertificateOutcome, CertificateRequestPayload, SubjectAttributes,
    };

    fn provision(dir: &Path, ca: &mut CertificateAuthority) -> u64 {
        let outcome = ca.handle_request(&CertificateRequestPayload {
            subject: SubjectAttributes {
                country: "CL".into(),
                state: "Nuble".into(),
                locality: "Chillan".into(),
                organization: "Chaski".into(),
                common_name: "node".into(),
            },
            ip: "127.0.0.1".into(),
            csr_pem: None,
        });
        let CertificateOutcome::Issued {
            serial,
            cert_pem,
            key_pem,
            root_pem,
        } = outcome
        else {
            panic!("issuance rejected");
        };
        std::fs::write(dir.join("node.crt"), cert_pem).unwrap();
        std::fs::write(dir.join("node.key"), key_pem.unwrap()).unwrap();
        std::fs::write(dir.join("ca.crt"), root_pem).unwrap();
        std::fs::write(dir.join("crl.pem"), ca.crl_pem()).unwrap();
        serial
    }

    #[test]
    fn context_builds_from_issued_material() {
        let ca_dir = tempfile::tempdir().unwrap();
        let ssl_dir = tempfile::tempdir().unwrap();
        let mut ca = CertificateAuthority::open(CaConfig::new(ca_dir.path())).unwrap();
        provision(ssl_dir.path(), &mut ca);

        TlsContext::from_dir(ssl_dir.path()).unwrap();
    }

    #[test]
    fn missing_material_fails_fast() {
        let empty = tempfile::tempdir().unwrap();
        assert!(TlsContext::from_dir(empty.path()).is_err());
    }

    #[test]
    fn ip_server_name_parses() {
        TlsContext::server_name("127.0.0.1").unwrap();
        TlsContext::server_name("localhost").unwrap();
        assert!(TlsContext::server_name("not a hostname!").is_err());
    }
}
