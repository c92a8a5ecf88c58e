//! Certificate primitives: CA and leaf issuance, PEM read-back, and a
//! scratch-directory guard for anything that needs material on disk.

use chrono::{DateTime, Duration, Utc};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
};

use crate::error::{Error, Result};

/// A minted certificate plus the metadata callers need without re-parsing
/// the PEM.
#[derive(Clone, Debug)]
pub struct CertMaterial {
    pub cert_pem: String,
    pub key_pem: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

/// A CA certificate kept live in-memory so leaves can be signed against it
/// within the same run without round-tripping through PEM.
pub struct IssuedCa {
    pub material: CertMaterial,
    pub cert: Certificate,
    pub key_pair: KeyPair,
}

fn to_offset(dt: DateTime<Utc>) -> Result<time::OffsetDateTime> {
    time::OffsetDateTime::from_unix_timestamp(dt.timestamp())
        .map_err(|e| Error::crypto(e.to_string()))
}

fn common_name_dn(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn
}

/// Mint a fresh, self-signed CA certificate.
pub fn issue_ca(common_name: &str, duration: Duration, now: DateTime<Utc>) -> Result<IssuedCa> {
    let not_before = now;
    let not_after = now + duration;

    let mut params = CertificateParams::new(Vec::<String>::new())?;
    params.distinguished_name = common_name_dn(common_name);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.not_before = to_offset(not_before)?;
    params.not_after = to_offset(not_after)?;

    let key_pair = KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;

    let material = CertMaterial {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
        not_before,
        not_after,
    };

    Ok(IssuedCa {
        material,
        cert,
        key_pair,
    })
}

/// Reconstruct a CA already stored in a secret so leaves can be signed
/// against it, without re-minting it.
pub fn load_ca(ca_cert_pem: &str, ca_key_pem: &str) -> Result<IssuedCa> {
    let key_pair = KeyPair::from_pem(ca_key_pem)?;
    let params = CertificateParams::from_ca_cert_pem(ca_cert_pem)?;
    let (not_before, not_after) = read_validity(ca_cert_pem)?;
    let cert = params.self_signed(&key_pair)?;

    let material = CertMaterial {
        cert_pem: ca_cert_pem.to_string(),
        key_pem: ca_key_pem.to_string(),
        not_before,
        not_after,
    };

    Ok(IssuedCa {
        material,
        cert,
        key_pair,
    })
}

/// Mint a leaf certificate (node or client) signed by `ca`.
pub fn issue_leaf(
    common_name: &str,
    sans: Vec<String>,
    duration: Duration,
    now: DateTime<Utc>,
    ca: &IssuedCa,
    extended_key_usages: Vec<ExtendedKeyUsagePurpose>,
) -> Result<CertMaterial> {
    let not_before = now;
    let not_after = now + duration;

    let mut params = CertificateParams::new(sans)?;
    params.distinguished_name = common_name_dn(common_name);
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = extended_key_usages;
    params.not_before = to_offset(not_before)?;
    params.not_after = to_offset(not_after)?;

    let key_pair = KeyPair::generate()?;
    let cert = params.signed_by(&key_pair, &ca.cert, &ca.key_pair)?;

    Ok(CertMaterial {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
        not_before,
        not_after,
    })
}

/// Read the validity window out of a PEM-encoded certificate, for certs
/// this tool didn't just mint (operator-supplied CAs, secrets loaded back
/// from the cluster).
pub fn read_validity(cert_pem: &str) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(cert_pem.as_bytes())
        .map_err(|e| Error::crypto(format!("invalid PEM: {e}")))?;
    let cert = pem.parse_x509()?;
    let validity = cert.validity();
    Ok((
        DateTime::from_timestamp(validity.not_before.timestamp(), 0)
            .ok_or_else(|| Error::crypto("not_before out of range"))?,
        DateTime::from_timestamp(validity.not_after.timestamp(), 0)
            .ok_or_else(|| Error::crypto("not_after out of range"))?,
    ))
}

/// RAII scratch directory: removed on every exit path, including panics,
/// via `tempfile::TempDir`'s own `Drop`.
pub struct ScratchDir {
    dir: tempfile::TempDir,
}

impl ScratchDir {
    pub fn new() -> Result<Self> {
        Ok(ScratchDir {
            dir: tempfile::TempDir::new()?,
        })
    }

    pub fn path(&self) -> &std::path::Path {
        self.dir.path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-07-27T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn issue_ca_self_signs_with_requested_lifetime() {
        let ca = issue_ca("db-ca", Duration::days(30), now()).unwrap();
        assert!(ca.material.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(ca.material.key_pem.contains("PRIVATE KEY"));
        assert_eq!(ca.material.not_after - ca.material.not_before, Duration::days(30));
    }

    #[test]
    fn issue_leaf_is_signed_by_the_ca() {
        let ca = issue_ca("db-ca", Duration::days(365), now()).unwrap();
        let leaf = issue_leaf(
            "node",
            vec!["db-0.db.default.svc.cluster.local".to_string()],
            Duration::days(30),
            now(),
            &ca,
            vec![
                ExtendedKeyUsagePurpose::ServerAuth,
                ExtendedKeyUsagePurpose::ClientAuth,
            ],
        )
        .unwrap();
        assert!(leaf.cert_pem.contains("BEGIN CERTIFICATE"));
        assert_ne!(leaf.cert_pem, ca.material.cert_pem);
    }

    #[test]
    fn read_validity_round_trips_a_freshly_minted_cert() {
        let ca = issue_ca("db-ca", Duration::days(10), now()).unwrap();
        let (not_before, not_after) = read_validity(&ca.material.cert_pem).unwrap();
        assert_eq!(not_after - not_before, Duration::days(10));
    }

    #[test]
    fn load_ca_reconstructs_a_stored_ca() {
        let original = issue_ca("db-ca", Duration::days(10), now()).unwrap();
        let reloaded = load_ca(&original.material.cert_pem, &original.material.key_pem).unwrap();
        assert_eq!(reloaded.material.cert_pem, original.material.cert_pem);
    }

    #[test]
    fn scratch_dir_removes_itself_on_drop() {
        let path = {
            let guard = ScratchDir::new().unwrap();
            let path = guard.path().to_path_buf();
            assert!(path.exists());
            path
        };
        assert!(!path.exists());
    }
}
