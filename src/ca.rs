//! Embedded certification authority.
//!
//! On first start the CA generates its root key and a self-signed root
//! certificate, then persists them under the CA directory:
//!
//! ```text
//! <root>/ca.key
//! <root>/ca.crt
//! <root>/issued/<serial>.crt
//! <root>/crl.pem
//! ```
//!
//! Subsequent starts reload the same material; a corrupted or missing key
//! aborts startup. Issuance either signs a caller-provided CSR or generates
//! the key on the requester's behalf. Revocations rewrite `crl.pem`, which
//! every TLS endpoint loads as part of its context.

use crate::net::envelope::{CertificateOutcome, CertificateRequestPayload, SubjectAttributes};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, CertificateRevocationListParams,
    CertificateSigningRequestParams, DistinguishedName, DnType, IsCa, KeyIdMethod, KeyPair,
    KeyUsagePurpose, RevocationReason, RevokedCertParams, SerialNumber,
};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use tracing::{info, warn};

/// Root certificate lifetime.
const ROOT_VALIDITY_DAYS: i64 = 3650;

/// Issued certificate lifetime.
const ISSUED_VALIDITY_DAYS: i64 = 365;

/// CRL freshness window advertised in `next_update`.
const CRL_VALIDITY_DAYS: i64 = 30;

#[derive(Debug, Error)]
pub enum CaError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pki error: {0}")]
    Pki(#[from] rcgen::Error),

    #[error("root key at {0} is missing or corrupted")]
    CorruptRootKey(PathBuf),

    #[error("root certificate at {0} is missing or corrupted")]
    CorruptRootCert(PathBuf),
}

#[derive(Debug, Clone)]
pub struct CaConfig {
    pub root_dir: PathBuf,
    pub subject: SubjectAttributes,
}

impl CaConfig {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            subject: default_subject(),
        }
    }
}

/// Default subject for the embedded root.
pub fn default_subject() -> SubjectAttributes {
    SubjectAttributes {
        country: "CL".to_string(),
        state: "Nuble".to_string(),
        locality: "Chillan".to_string(),
        organization: "Chaski".to_string(),
        common_name: "Chaski-Confluent".to_string(),
    }
}

#[derive(Debug)]
struct RevokedEntry {
    serial: u64,
    revoked_at: OffsetDateTime,
}

pub struct CertificateAuthority {
    root_dir: PathBuf,
    key: KeyPair,
    cert: Certificate,
    cert_pem: String,
    revoked: Vec<RevokedEntry>,
    crl_pem: String,
    crl_number: u64,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("root_dir", &self.root_dir)
            .field("cert_pem", &self.cert_pem)
            .field("revoked", &self.revoked)
            .field("crl_pem", &self.crl_pem)
            .field("crl_number", &self.crl_number)
            .finish()
    }
}

impl CertificateAuthority {
    /// Load the CA from disk, generating the root material on first start.
    pub fn open(config: CaConfig) -> Result<Self, CaError> {
        let root_dir = config.root_dir;
        std::fs::create_dir_all(root_dir.join("issued"))?;

        let key_path = root_dir.join("ca.key");
        let cert_path = root_dir.join("ca.crt");

        let mut ca = if key_path.exists() || cert_path.exists() {
            let key_pem = std::fs::read_to_string(&key_path)
                .map_err(|_| CaError::CorruptRootKey(key_path.clone()))?;
            let key = KeyPair::from_pem(&key_pem)
                .map_err(|_| CaError::CorruptRootKey(key_path.clone()))?;

            let cert_pem = std::fs::read_to_string(&cert_path)
                .map_err(|_| CaError::CorruptRootCert(cert_path.clone()))?;
            let params = CertificateParams::from_ca_cert_pem(&cert_pem)
                .map_err(|_| CaError::CorruptRootCert(cert_path.clone()))?;
            let cert = params.self_signed(&key)?;

            let revoked = load_revocations(&root_dir.join("crl.pem"));
            info!(
                "loaded certificate authority from {} ({} revocations)",
                root_dir.display(),
                revoked.len()
            );
            Self {
                root_dir,
                key,
                cert,
                cert_pem,
                revoked,
                crl_pem: String::new(),
                crl_number: 1,
            }
        } else {
            let key = KeyPair::generate()?;
            let params = root_params(&config.subject)?;
            let cert = params.self_signed(&key)?;
            let cert_pem = cert.pem();

            write_atomic(&key_path, key.serialize_pem().as_bytes())?;
            restrict_permissions(&key_path)?;
            write_atomic(&cert_path, cert_pem.as_bytes())?;

            info!(
                "generated certificate authority root at {}",
                root_dir.display()
            );
            Self {
                root_dir,
                key,
                cert,
                cert_pem,
                revoked: Vec::new(),
                crl_pem: String::new(),
                crl_number: 1,
            }
        };

        ca.rewrite_crl()?;
        Ok(ca)
    }

    /// PEM of the root certificate (the trust anchor handed to requesters).
    pub fn root_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Latest CRL in PEM form.
    pub fn crl_pem(&self) -> &str {
        &self.crl_pem
    }

    pub fn revoked_count(&self) -> usize {
        self.revoked.len()
    }

    /// Serve a `ca_request_certificate`. Malformed input yields a structured
    /// rejection, never an error — the CA must not crash on bad requests.
    pub fn handle_request(&mut self, req: &CertificateRequestPayload) -> CertificateOutcome {
        let ip: IpAddr = match req.ip.parse() {
            Ok(ip) => ip,
            Err(_) => {
                return CertificateOutcome::Rejected {
                    reason: format!("invalid requester ip: {}", req.ip),
                };
            }
        };
        if req.subject.common_name.is_empty() {
            return CertificateOutcome::Rejected {
                reason: "empty common name".to_string(),
            };
        }

        match &req.csr_pem {
            Some(csr_pem) => self.sign_csr(csr_pem, ip),
            None => self.issue_fresh(&req.subject, ip),
        }
    }

    fn sign_csr(&mut self, csr_pem: &str, ip: IpAddr) -> CertificateOutcome {
        let mut csr = match CertificateSigningRequestParams::from_pem(csr_pem) {
            Ok(csr) => csr,
            Err(e) => {
                warn!("rejecting malformed CSR: {}", e);
                return CertificateOutcome::Rejected {
                    reason: format!("malformed csr: {e}"),
                };
            }
        };

        let serial: u64 = rand::random();
        stamp_leaf(&mut csr.params, serial, ip);

        match csr.signed_by(&self.cert, &self.key) {
            Ok(cert) => self.record_issued(serial, cert.pem(), None),
            Err(e) => {
                warn!("CSR signing failed: {}", e);
                CertificateOutcome::Rejected {
                    reason: format!("signing failure: {e}"),
                }
            }
        }
    }

    fn issue_fresh(&mut self, subject: &SubjectAttributes, ip: IpAddr) -> CertificateOutcome {
        let issue = || -> Result<(u64, String, String), rcgen::Error> {
            let leaf_key = KeyPair::generate()?;
            let mut params =
                CertificateParams::new(vec![subject.common_name.clone(), ip.to_string()])?;
            params.distinguished_name = distinguished_name(subject);
            let serial: u64 = rand::random();
            stamp_leaf(&mut params, serial, ip);

            let cert = params.signed_by(&leaf_key, &self.cert, &self.key)?;
            Ok((serial, cert.pem(), leaf_key.serialize_pem()))
        };

        match issue() {
            Ok((serial, cert_pem, key_pem)) => {
                self.record_issued(serial, cert_pem, Some(key_pem))
            }
            Err(e) => {
                warn!("certificate issuance failed: {}", e);
                CertificateOutcome::Rejected {
                    reason: format!("signing failure: {e}"),
                }
            }
        }
    }

    fn record_issued(
        &mut self,
        serial: u64,
        cert_pem: String,
        key_pem: Option<String>,
    ) -> CertificateOutcome {
        let path = self.root_dir.join("issued").join(format!("{serial}.crt"));
        if let Err(e) = write_atomic(&path, cert_pem.as_bytes()) {
            warn!("failed to persist issued certificate {}: {}", serial, e);
            return CertificateOutcome::Rejected {
                reason: format!("persist failure: {e}"),
            };
        }
        info!("issued certificate serial {}", serial);
        CertificateOutcome::Issued {
            serial,
            cert_pem,
            key_pem,
            root_pem: self.cert_pem.clone(),
        }
    }

    /// Add a serial to the CRL and rewrite `crl.pem`.
    pub fn revoke(&mut self, serial: u64) -> Result<(), CaError> {
        if self.revoked.iter().any(|r| r.serial == serial) {
            return Ok(());
        }
        self.revoked.push(RevokedEntry {
            serial,
            revoked_at: OffsetDateTime::now_utc(),
        });
        self.rewrite_crl()?;
        info!(
            "revoked certificate serial {} ({} total revocations)",
            serial,
            self.revoked.len()
        );
        Ok(())
    }

    fn rewrite_crl(&mut self) -> Result<(), CaError> {
        let now = OffsetDateTime::now_utc();
        self.crl_number += 1;

        let params = CertificateRevocationListParams {
            this_update: now,
            next_update: now + Duration::days(CRL_VALIDITY_DAYS),
            crl_number: SerialNumber::from_slice(&self.crl_number.to_be_bytes()),
            issuing_distribution_point: None,
            revoked_certs: self
                .revoked
                .iter()
                .map(|r| RevokedCertParams {
                    serial_number: SerialNumber::from_slice(&r.serial.to_be_bytes()),
                    revocation_time: r.revoked_at,
                    reason_code: Some(RevocationReason::Unspecified),
                    invalidity_date: None,
                })
                .collect(),
            key_identifier_method: KeyIdMethod::Sha256,
        };

        let crl = params.signed_by(&self.cert, &self.key)?;
        self.crl_pem = crl.pem()?;
        write_atomic(&self.root_dir.join("crl.pem"), self.crl_pem.as_bytes())?;
        Ok(())
    }
}

fn root_params(subject: &SubjectAttributes) -> Result<CertificateParams, rcgen::Error> {
    let mut params = CertificateParams::new(vec![subject.common_name.clone()])?;
    params.distinguished_name = distinguished_name(subject);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(ROOT_VALIDITY_DAYS);
    params.serial_number = Some(SerialNumber::from_slice(&rand::random::<u64>().to_be_bytes()));
    Ok(params)
}

fn stamp_leaf(params: &mut CertificateParams, serial: u64, ip: IpAddr) {
    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(ISSUED_VALIDITY_DAYS);
    params.serial_number = Some(SerialNumber::from_slice(&serial.to_be_bytes()));
    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    let ip_san = rcgen::SanType::IpAddress(ip);
    if !params.subject_alt_names.contains(&ip_san) {
        params.subject_alt_names.push(ip_san);
    }
}

fn distinguished_name(subject: &SubjectAttributes) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CountryName, subject.country.clone());
    dn.push(DnType::StateOrProvinceName, subject.state.clone());
    dn.push(DnType::LocalityName, subject.locality.clone());
    dn.push(DnType::OrganizationName, subject.organization.clone());
    dn.push(DnType::CommonName, subject.common_name.clone());
    dn
}

/// Recover revocation state from the on-disk CRL so a restart does not
/// silently un-revoke anything. A missing or unreadable CRL starts empty.
fn load_revocations(path: &Path) -> Vec<RevokedEntry> {
    let Ok(data) = std::fs::read(path) else {
        return Vec::new();
    };
    let Ok((_, pem)) = x509_parser::pem::parse_x509_pem(&data) else {
        warn!("unparsable CRL at {}, starting empty", path.display());
        return Vec::new();
    };
    let Ok((_, crl)) = x509_parser::parse_x509_crl(&pem.contents) else {
        warn!("unparsable CRL at {}, starting empty", path.display());
        return Vec::new();
    };

    crl.iter_revoked_certificates()
        .map(|revoked| {
            let raw = revoked.raw_serial();
            let mut serial_bytes = [0u8; 8];
            let tail = &raw[raw.len().saturating_sub(8)..];
            serial_bytes[8 - tail.len()..].copy_from_slice(tail);
            RevokedEntry {
                serial: u64::from_be_bytes(serial_bytes),
                revoked_at: OffsetDateTime::from_unix_timestamp(
                    revoked.revocation_date.timestamp(),
                )
                .unwrap_or_else(|_| OffsetDateTime::now_utc()),
            }
        })
        .collect()
}

/// Write via a sibling temp file and rename so readers never observe a
/// partial file.
fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o600);
    std::fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(csr: Option<String>) -> CertificateRequestPayload {
        CertificateRequestPayload {
            subject: SubjectAttributes {
                country: "CL".into(),
                state: "Nuble".into(),
                locality: "Chillan".into(),
                organization: "Chaski".into(),
                common_name: "node-x".into(),
            },
            ip: "127.0.0.1".into(),
            csr_pem: csr,
        }
    }

    #[test]
    fn generates_and_reloads_root() {
        let dir = tempfile::tempdir().unwrap();
        {
            let ca = CertificateAuthority::open(CaConfig::new(dir.path())).unwrap();
            assert!(ca.root_pem().contains("BEGIN CERTIFICATE"));
        }
        assert!(dir.path().join("ca.key").exists());
        assert!(dir.path().join("ca.crt").exists());
        assert!(dir.path().join("crl.pem").exists());

        // Second open loads the same root instead of regenerating.
        let pem_before = std::fs::read_to_string(dir.path().join("ca.crt")).unwrap();
        let ca = CertificateAuthority::open(CaConfig::new(dir.path())).unwrap();
        assert_eq!(ca.root_pem(), pem_before);
    }

    #[test]
    fn corrupt_key_aborts_startup() {
        let dir = tempfile::tempdir().unwrap();
        CertificateAuthority::open(CaConfig::new(dir.path())).unwrap();
        std::fs::write(dir.path().join("ca.key"), "not a key").unwrap();

        let err = CertificateAuthority::open(CaConfig::new(dir.path())).unwrap_err();
        assert!(matches!(err, CaError::CorruptRootKey(_)));
    }

    #[test]
    fn issues_key_and_certificate_when_csr_absent() {
        let dir = tempfile::tempdir().unwrap();
        let mut ca = CertificateAuthority::open(CaConfig::new(dir.path())).unwrap();

        match ca.handle_request(&request(None)) {
            CertificateOutcome::Issued {
                serial,
                cert_pem,
                key_pem,
                root_pem,
            } => {
                assert!(cert_pem.contains("BEGIN CERTIFICATE"));
                assert!(key_pem.unwrap().contains("PRIVATE KEY"));
                assert_eq!(root_pem, ca.root_pem());
                assert!(dir
                    .path()
                    .join("issued")
                    .join(format!("{serial}.crt"))
                    .exists());
            }
            CertificateOutcome::Rejected { reason } => panic!("rejected: {reason}"),
        }
    }

    #[test]
    fn signs_a_provided_csr_without_returning_a_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut ca = CertificateAuthority::open(CaConfig::new(dir.path())).unwrap();

        let leaf_key = KeyPair::generate().unwrap();
        let params = CertificateParams::new(vec!["node-x".to_string()]).unwrap();
        let csr_pem = params.serialize_request(&leaf_key).unwrap().pem().unwrap();

        match ca.handle_request(&request(Some(csr_pem))) {
            CertificateOutcome::Issued { key_pem, .. } => assert!(key_pem.is_none()),
            CertificateOutcome::Rejected { reason } => panic!("rejected: {reason}"),
        }
    }

    #[test]
    fn malformed_csr_is_rejected_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut ca = CertificateAuthority::open(CaConfig::new(dir.path())).unwrap();

        let outcome = ca.handle_request(&request(Some("garbage".to_string())));
        assert!(matches!(outcome, CertificateOutcome::Rejected { .. }));

        let outcome = ca.handle_request(&CertificateRequestPayload {
            ip: "not-an-ip".into(),
            ..request(None)
        });
        assert!(matches!(outcome, CertificateOutcome::Rejected { .. }));
    }

    #[test]
    fn revocation_rewrites_the_crl() {
        let dir = tempfile::tempdir().unwrap();
        let mut ca = CertificateAuthority::open(CaConfig::new(dir.path())).unwrap();
        let before = ca.crl_pem().to_string();

        let serial = match ca.handle_request(&request(None)) {
            CertificateOutcome::Issued { serial, .. } => serial,
            CertificateOutcome::Rejected { reason } => panic!("rejected: {reason}"),
        };
        ca.revoke(serial).unwrap();

        let after = std::fs::read_to_string(dir.path().join("crl.pem")).unwrap();
        assert_ne!(before, after);
        assert_eq!(ca.revoked_count(), 1);

        // Revoking twice is a no-op.
        ca.revoke(serial).unwrap();
        assert_eq!(ca.revoked_count(), 1);
    }

    #[test]
    fn revocations_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut ca = CertificateAuthority::open(CaConfig::new(dir.path())).unwrap();
            let serial = match ca.handle_request(&request(None)) {
                CertificateOutcome::Issued { serial, .. } => serial,
                CertificateOutcome::Rejected { reason } => panic!("rejected: {reason}"),
            };
            ca.revoke(serial).unwrap();
        }

        let ca = CertificateAuthority::open(CaConfig::new(dir.path())).unwrap();
        assert_eq!(ca.revoked_count(), 1);
    }
}
