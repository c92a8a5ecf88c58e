//! Generates and rewrites CA, node, and client certificate secrets
//! according to the state each is currently in.
//!
//! A CA rotation writes a trust bundle (new cert first, old cert appended)
//! so already-issued node/client leaves keep validating while the fleet
//! rolls onto certificates signed by the new CA; node/client are only
//! reissued when their own state, or an explicitly requested mode, calls
//! for it. Node/client secrets always carry the current `ca.crt` bundle
//! alongside their own `tls.crt`/`tls.key`.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use rcgen::ExtendedKeyUsagePurpose;
use tracing::{info, instrument};

use crate::certs::{self, CertMaterial, IssuedCa};
use crate::error::{Error, Result};
use crate::policy::{Mode, Policy};
use crate::secret_repo::{SecretRecord, SecretRepository, SECRET_TYPE_OPAQUE, SECRET_TYPE_TLS};
use crate::state::{self, CertState};

const CA_KEYS: [&str; 2] = ["ca.crt", "ca.key"];
const LEAF_KEYS: [&str; 3] = ["ca.crt", "tls.crt", "tls.key"];

/// Which leaves this invocation actually (re)minted, so the caller can
/// decide whether a rolling restart is warranted.
#[derive(Debug, Default, Clone, Copy)]
pub struct RunSummary {
    pub ca_rotated: bool,
    pub node_rotated: bool,
    pub client_rotated: bool,
}

impl RunSummary {
    pub fn any_change(&self) -> bool {
        self.ca_rotated || self.node_rotated || self.client_rotated
    }
}

/// The CA able to sign new leaves, plus the raw on-disk `ca.crt` bundle
/// (which may concatenate more than one certificate across a rotation) so
/// it can be embedded verbatim into node/client secrets.
struct CaContext {
    ca: IssuedCa,
    bundle_pem: String,
}

pub struct Generator {
    repo: Arc<dyn SecretRepository>,
    policy: Policy,
}

impl Generator {
    pub fn new(repo: Arc<dyn SecretRepository>, policy: Policy) -> Self {
        Generator { repo, policy }
    }

    #[instrument(skip(self), fields(cluster = %self.policy.cluster_name))]
    pub async fn run(&self, mode: Mode) -> Result<RunSummary> {
        let mut summary = RunSummary::default();

        if mode.is_client_only() {
            let ca = self.load_signing_ca().await?;
            self.issue_client(&ca).await?;
            summary.client_rotated = true;
            return Ok(summary);
        }

        summary.ca_rotated = self.ensure_ca(&mode).await?;
        let signing_ca = self.load_signing_ca().await?;

        summary.node_rotated = self.ensure_node(&mode, &signing_ca).await?;
        summary.client_rotated = self.ensure_client(&mode, &signing_ca).await?;

        Ok(summary)
    }

    /// Generate certificates in the layout the CockroachDB operator
    /// expects: CA mirrored into a ConfigMap, node cert carrying the join
    /// service's SAN, client cert created only if absent.
    #[instrument(skip(self), fields(cluster = %self.policy.cluster_name))]
    pub async fn migrate(&self) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        summary.ca_rotated = self.ensure_ca(&Mode::GenerateAll).await?;

        let signing_ca = self.load_signing_ca().await?;
        self.mirror_ca_config_map(&signing_ca.ca).await?;

        self.issue_node(&signing_ca, true).await?;
        summary.node_rotated = true;

        let client_secret_name = self.policy.client_secret_name();
        if self.repo.load_secret(&self.policy.namespace, &client_secret_name).await?.is_none() {
            self.issue_client(&signing_ca).await?;
            summary.client_rotated = true;
        }

        Ok(summary)
    }

    async fn ca_record(&self) -> Result<Option<SecretRecord>> {
        let name = self
            .policy
            .ca_provided_secret
            .clone()
            .unwrap_or_else(|| self.policy.ca_secret_name());
        self.repo.load_secret(&self.policy.namespace, &name).await
    }

    fn ca_secret_name(&self) -> String {
        self.policy
            .ca_provided_secret
            .clone()
            .unwrap_or_else(|| self.policy.ca_secret_name())
    }

    /// Decide the CA's state and, if warranted, mint a replacement.
    /// Returns whether the CA secret was written this run.
    async fn ensure_ca(&self, mode: &Mode) -> Result<bool> {
        let record = self.ca_record().await?;

        let cert_state = state::evaluate(
            record.as_ref(),
            &CA_KEYS,
            self.policy.ca_duration,
            &self.policy.ca_cron,
            Utc::now(),
        );

        match cert_state {
            CertState::Missing => {
                let ca = certs::issue_ca(
                    &self.policy.cluster_name,
                    self.policy.ca_duration,
                    Utc::now(),
                )?;
                self.write_ca(&ca.material).await?;
                info!("minted new CA");
                Ok(true)
            }
            CertState::RotationRequired(reason) if mode.requests_ca_rotation() => {
                let old_cert_pem = record
                    .as_ref()
                    .and_then(|r| r.data.get("ca.crt"))
                    .map(|bytes| String::from_utf8_lossy(bytes).to_string())
                    .unwrap_or_default();

                let ca = certs::issue_ca(
                    &self.policy.cluster_name,
                    self.policy.ca_duration,
                    Utc::now(),
                )?;
                let bundle = trust_bundle(&ca.material.cert_pem, &old_cert_pem);
                let mut material = ca.material;
                material.cert_pem = bundle;
                self.write_ca(&material).await?;
                info!(%reason, "rotated CA, wrote trust bundle");
                Ok(true)
            }
            CertState::RotationRequired(reason) => {
                info!(%reason, "CA due for rotation but not requested this run");
                Ok(false)
            }
            CertState::Ready => Ok(false),
        }
    }

    async fn write_ca(&self, material: &CertMaterial) -> Result<()> {
        let mut data = BTreeMap::new();
        data.insert("ca.crt".to_string(), material.cert_pem.as_bytes().to_vec());
        data.insert("ca.key".to_string(), material.key_pem.as_bytes().to_vec());
        let record = SecretRecord::for_certificate(
            data,
            material.not_before,
            material.not_after,
            self.policy.ca_duration,
            SECRET_TYPE_OPAQUE,
        );
        self.repo
            .create_or_update_secret(&self.policy.namespace, &self.ca_secret_name(), record)
            .await
    }

    /// Reconstruct the CA currently able to sign new leaves. When the
    /// stored `ca.crt` is a trust bundle, the signing cert is always the
    /// first PEM block (see [`trust_bundle`]).
    async fn load_signing_ca(&self) -> Result<CaContext> {
        let record = self
            .ca_record()
            .await?
            .ok_or_else(|| Error::state("CA secret is missing"))?;
        let cert_pem = record
            .data
            .get("ca.crt")
            .ok_or_else(|| Error::state("CA secret has no ca.crt"))?;
        let key_pem = record
            .data
            .get("ca.key")
            .ok_or_else(|| Error::state("CA secret has no ca.key"))?;
        let bundle_pem = String::from_utf8_lossy(cert_pem).to_string();
        let current_cert_pem = first_pem_block(&bundle_pem);
        let ca = certs::load_ca(&current_cert_pem, &String::from_utf8_lossy(key_pem))?;
        Ok(CaContext { ca, bundle_pem })
    }

    async fn ensure_node(&self, mode: &Mode, ca: &CaContext) -> Result<bool> {
        let name = self.policy.node_secret_name();
        let record = self.repo.load_secret(&self.policy.namespace, &name).await?;

        let cert_state = state::evaluate(
            record.as_ref(),
            &LEAF_KEYS,
            self.policy.node_duration,
            &self.policy.node_client_cron,
            Utc::now(),
        );

        let should_issue = match cert_state {
            CertState::Missing => true,
            CertState::RotationRequired(_) => mode.requests_node_rotation(),
            CertState::Ready => false,
        };

        if should_issue {
            self.issue_node(ca, false).await?;
        }
        Ok(should_issue)
    }

    async fn issue_node(&self, ca: &CaContext, migrate: bool) -> Result<()> {
        let mut sans = self.node_sans();
        if migrate {
            sans.push(self.join_service_san());
        }
        let material = certs::issue_leaf(
            "node",
            sans,
            self.policy.node_duration,
            Utc::now(),
            &ca.ca,
            vec![
                ExtendedKeyUsagePurpose::ServerAuth,
                ExtendedKeyUsagePurpose::ClientAuth,
            ],
        )?;
        self.write_leaf(
            &self.policy.node_secret_name(),
            &material,
            &ca.bundle_pem,
            self.policy.node_duration,
        )
        .await
    }

    async fn ensure_client(&self, mode: &Mode, ca: &CaContext) -> Result<bool> {
        let name = self.policy.client_secret_name();
        let record = self.repo.load_secret(&self.policy.namespace, &name).await?;

        let cert_state = state::evaluate(
            record.as_ref(),
            &LEAF_KEYS,
            self.policy.client_duration,
            &self.policy.node_client_cron,
            Utc::now(),
        );

        let should_issue = match cert_state {
            CertState::Missing => true,
            CertState::RotationRequired(_) => mode.requests_client_rotation(),
            CertState::Ready => false,
        };

        if should_issue {
            self.issue_client(ca).await?;
        }
        Ok(should_issue)
    }

    async fn issue_client(&self, ca: &CaContext) -> Result<()> {
        let username = self.policy.client_username();
        let material = certs::issue_leaf(
            username,
            vec![],
            self.policy.client_duration,
            Utc::now(),
            &ca.ca,
            vec![ExtendedKeyUsagePurpose::ClientAuth],
        )?;
        self.write_leaf(
            &self.policy.client_secret_name(),
            &material,
            &ca.bundle_pem,
            self.policy.client_duration,
        )
        .await
    }

    /// Write a node/client secret carrying its own `tls.crt`/`tls.key` plus
    /// the CA bundle currently needed to validate it.
    async fn write_leaf(
        &self,
        name: &str,
        material: &CertMaterial,
        ca_bundle_pem: &str,
        duration: chrono::Duration,
    ) -> Result<()> {
        let mut data = BTreeMap::new();
        data.insert("ca.crt".to_string(), ca_bundle_pem.as_bytes().to_vec());
        data.insert("tls.crt".to_string(), material.cert_pem.as_bytes().to_vec());
        data.insert("tls.key".to_string(), material.key_pem.as_bytes().to_vec());
        let record = SecretRecord::for_certificate(
            data,
            material.not_before,
            material.not_after,
            duration,
            SECRET_TYPE_TLS,
        );
        self.repo
            .create_or_update_secret(&self.policy.namespace, name, record)
            .await
    }

    async fn mirror_ca_config_map(&self, ca: &IssuedCa) -> Result<()> {
        let mut data = BTreeMap::new();
        data.insert("ca.crt".to_string(), ca.material.cert_pem.clone());
        self.repo
            .create_or_update_config_map(
                &self.policy.namespace,
                &format!("{}-ca", self.policy.cluster_name),
                data,
            )
            .await
    }

    fn node_sans(&self) -> Vec<String> {
        let p = &self.policy;
        vec![
            "localhost".to_string(),
            "127.0.0.1".to_string(),
            "node".to_string(),
            p.public_service_name.clone(),
            format!("{}.{}", p.public_service_name, p.namespace),
            format!(
                "{}.{}.svc.{}",
                p.public_service_name, p.namespace, p.cluster_domain
            ),
            p.discovery_service_name.clone(),
            format!("{}.{}", p.discovery_service_name, p.namespace),
            format!(
                "{}.{}.svc.{}",
                p.discovery_service_name, p.namespace, p.cluster_domain
            ),
            format!(
                "*.{}.{}.svc.{}",
                p.discovery_service_name, p.namespace, p.cluster_domain
            ),
        ]
    }

    fn join_service_san(&self) -> String {
        format!(
            "{}-join.{}.svc.{}",
            self.policy.cluster_name, self.policy.namespace, self.policy.cluster_domain
        )
    }
}

/// Build a trust bundle: the new cert first (so it's the block reloaded
/// as the signing cert on the next run), the previous cert appended so
/// leaves issued under it keep validating until they're reissued.
fn trust_bundle(new_cert_pem: &str, old_cert_pem: &str) -> String {
    if old_cert_pem.trim().is_empty() {
        return new_cert_pem.to_string();
    }
    format!("{}\n{}", new_cert_pem.trim_end(), old_cert_pem.trim_end())
}

fn first_pem_block(bundle: &str) -> String {
    match bundle.find("-----END CERTIFICATE-----") {
        Some(idx) => bundle[..idx + "-----END CERTIFICATE-----".len()].to_string(),
        None => bundle.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secret_repo::FakeSecretRepository;

    fn policy() -> Policy {
        let common = crate::policy::CommonCertArgs {
            ca_secret: None,
            ca_duration: std::time::Duration::from_secs(3600 * 24 * 365 * 5),
            ca_expiry_window: std::time::Duration::from_secs(3600 * 24 * 27),
            node_duration: std::time::Duration::from_secs(3600 * 24 * 365),
            node_expiry_window: std::time::Duration::from_secs(3600 * 24 * 7),
            client_duration: std::time::Duration::from_secs(3600 * 24 * 28),
            client_expiry_window: std::time::Duration::from_secs(3600 * 2),
            statefulset_name: "db".to_string(),
            namespace: "default".to_string(),
            cluster_domain: "cluster.local".to_string(),
            user_name: None,
        };
        Policy::from_common(&common)
    }

    #[tokio::test]
    async fn cold_install_mints_all_three_secrets() {
        let repo = Arc::new(FakeSecretRepository::new());
        let gen = Generator::new(repo.clone(), policy());
        let summary = gen.run(Mode::GenerateAll).await.unwrap();
        assert!(summary.ca_rotated && summary.node_rotated && summary.client_rotated);

        assert!(repo.load_secret("default", "db-ca-secret").await.unwrap().is_some());
        assert!(repo.load_secret("default", "db-node-secret").await.unwrap().is_some());
        assert!(repo.load_secret("default", "db-client-secret").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn leaf_secrets_carry_the_current_ca_bundle() {
        let repo = Arc::new(FakeSecretRepository::new());
        let gen = Generator::new(repo.clone(), policy());
        gen.run(Mode::GenerateAll).await.unwrap();

        let ca = repo.load_secret("default", "db-ca-secret").await.unwrap().unwrap();
        let node = repo.load_secret("default", "db-node-secret").await.unwrap().unwrap();
        let client = repo.load_secret("default", "db-client-secret").await.unwrap().unwrap();

        assert_eq!(node.data.get("ca.crt"), ca.data.get("ca.crt"));
        assert_eq!(client.data.get("ca.crt"), ca.data.get("ca.crt"));
    }

    #[tokio::test]
    async fn rerun_is_idempotent_when_everything_is_ready() {
        let repo = Arc::new(FakeSecretRepository::new());
        let gen = Generator::new(repo.clone(), policy());
        gen.run(Mode::GenerateAll).await.unwrap();

        let summary = gen.run(Mode::GenerateAll).await.unwrap();
        assert!(!summary.any_change());
    }

    #[tokio::test]
    async fn client_only_mode_only_touches_the_client_secret() {
        let repo = Arc::new(FakeSecretRepository::new());
        let gen = Generator::new(repo.clone(), policy());
        gen.run(Mode::GenerateAll).await.unwrap();

        let summary = gen.run(Mode::GenerateClientOnly).await.unwrap();
        assert!(summary.client_rotated && !summary.ca_rotated && !summary.node_rotated);
    }

    #[tokio::test]
    async fn tampered_node_secret_is_detected_as_rotation_required() {
        let repo = Arc::new(FakeSecretRepository::new());
        let gen = Generator::new(repo.clone(), policy());
        gen.run(Mode::GenerateAll).await.unwrap();

        repo.tamper(
            "default",
            "db-node-secret",
            BTreeMap::from([
                ("ca.crt".to_string(), b"tampered".to_vec()),
                ("tls.crt".to_string(), b"tampered".to_vec()),
                ("tls.key".to_string(), b"tampered".to_vec()),
            ]),
        )
        .await;

        let mode = Mode::Rotate(crate::policy::RotateTargets::parse(false, true, false).unwrap());
        let summary = gen.run(mode).await.unwrap();
        assert!(summary.node_rotated);
    }
}
