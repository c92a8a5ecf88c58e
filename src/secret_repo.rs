//! Access to the Secrets and ConfigMaps this tool reads and writes.
//!
//! [`SecretRepository`] is the seam the Design Notes call for: every
//! Kubernetes read/write goes through it, so the generator, rotation
//! coordinator and cleanup can be exercised against [`FakeSecretRepository`]
//! without a cluster.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::ByteString;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;

use crate::error::{Error, Result};

pub const FIELD_MANAGER: &str = "cockroach-cert-manager";

/// Annotation keys this tool stamps on every certificate Secret it writes.
pub const DATA_HASH_ANNOTATION: &str = "secret-data-hash";
pub const VALID_FROM_ANNOTATION: &str = "certificate-valid-from";
pub const VALID_UPTO_ANNOTATION: &str = "certificate-valid-upto";
pub const DURATION_ANNOTATION: &str = "certificate-duration";

pub const SECRET_TYPE_OPAQUE: &str = "Opaque";
pub const SECRET_TYPE_TLS: &str = "kubernetes.io/tls";

/// A fully materialized Secret: binary data, the annotations this tool
/// uses to decide whether it needs attention, and the Kubernetes Secret
/// `type`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SecretRecord {
    pub data: BTreeMap<String, Vec<u8>>,
    pub annotations: BTreeMap<String, String>,
    pub secret_type: String,
}

impl SecretRecord {
    /// A plain secret with only the tamper-detection hash stamped —
    /// no certificate metadata. Used for non-certificate data.
    pub fn new(data: BTreeMap<String, Vec<u8>>) -> Self {
        let mut record = SecretRecord {
            data,
            annotations: BTreeMap::new(),
            secret_type: SECRET_TYPE_OPAQUE.to_string(),
        };
        record.refresh_hash();
        record
    }

    /// A certificate Secret, stamped with all four required annotations:
    /// `secret-data-hash`, `certificate-valid-from`, `certificate-valid-upto`,
    /// `certificate-duration`.
    pub fn for_certificate(
        data: BTreeMap<String, Vec<u8>>,
        valid_from: DateTime<Utc>,
        valid_upto: DateTime<Utc>,
        duration: Duration,
        secret_type: impl Into<String>,
    ) -> Self {
        let mut annotations = BTreeMap::new();
        annotations.insert(VALID_FROM_ANNOTATION.to_string(), valid_from.to_rfc3339());
        annotations.insert(VALID_UPTO_ANNOTATION.to_string(), valid_upto.to_rfc3339());
        annotations.insert(
            DURATION_ANNOTATION.to_string(),
            duration.num_seconds().to_string(),
        );
        let mut record = SecretRecord {
            data,
            annotations,
            secret_type: secret_type.into(),
        };
        record.refresh_hash();
        record
    }

    /// Replace a single data entry and recompute the hash annotation,
    /// leaving every other annotation (certificate validity, duration)
    /// untouched.
    pub fn set_data(&mut self, key: impl Into<String>, value: Vec<u8>) {
        self.data.insert(key.into(), value);
        self.refresh_hash();
    }

    pub fn refresh_hash(&mut self) {
        let hash = structural_hash(&self.data);
        self.annotations
            .insert(DATA_HASH_ANNOTATION.to_string(), hash.to_string());
    }

    /// Whether the stored `secret-data-hash` annotation still matches
    /// `self.data`.
    ///
    /// False if the annotation is missing, malformed, or stale — any of
    /// which means the secret was edited outside this tool.
    pub fn hash_matches(&self) -> bool {
        match self.annotations.get(DATA_HASH_ANNOTATION) {
            Some(stored) => match stored.parse::<u64>() {
                Ok(stored) => stored == structural_hash(&self.data),
                Err(_) => false,
            },
            None => false,
        }
    }
}

/// Deterministic structural hash of a Secret's data, rendered as decimal
/// `u64` text for use as an annotation value.
///
/// Hashes sorted `(key, value)` pairs from a `BTreeMap` so iteration order
/// never affects the result.
pub fn structural_hash(data: &BTreeMap<String, Vec<u8>>) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    for (k, v) in data {
        k.hash(&mut hasher);
        v.hash(&mut hasher);
    }
    hasher.finish()
}

#[async_trait]
pub trait SecretRepository: Send + Sync {
    async fn load_secret(&self, namespace: &str, name: &str) -> Result<Option<SecretRecord>>;

    /// Server-side-apply upsert. Always re-stamps the `secret-data-hash`
    /// annotation from `record.data`.
    async fn create_or_update_secret(
        &self,
        namespace: &str,
        name: &str,
        record: SecretRecord,
    ) -> Result<()>;

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()>;

    async fn load_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>>;

    async fn create_or_update_config_map(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Result<()>;
}

/// Real implementation, backed by the Kubernetes API.
pub struct KubeSecretRepository {
    client: Client,
}

impl KubeSecretRepository {
    pub fn new(client: Client) -> Self {
        KubeSecretRepository { client }
    }

    fn secrets(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn config_maps(&self, namespace: &str) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl SecretRepository for KubeSecretRepository {
    async fn load_secret(&self, namespace: &str, name: &str) -> Result<Option<SecretRecord>> {
        match self.secrets(namespace).get_opt(name).await? {
            None => Ok(None),
            Some(secret) => {
                let data: BTreeMap<String, Vec<u8>> = secret
                    .data
                    .unwrap_or_default()
                    .into_iter()
                    .map(|(k, v)| (k, v.0))
                    .collect();
                let annotations = secret
                    .metadata
                    .annotations
                    .unwrap_or_default()
                    .into_iter()
                    .collect();
                let secret_type = secret.type_.unwrap_or_else(|| SECRET_TYPE_OPAQUE.to_string());
                Ok(Some(SecretRecord {
                    data,
                    annotations,
                    secret_type,
                }))
            }
        }
    }

    async fn create_or_update_secret(
        &self,
        namespace: &str,
        name: &str,
        mut record: SecretRecord,
    ) -> Result<()> {
        record.refresh_hash();

        let secret = Secret {
            metadata: kube::api::ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                annotations: Some(record.annotations.into_iter().collect()),
                ..Default::default()
            },
            data: Some(
                record
                    .data
                    .into_iter()
                    .map(|(k, v)| (k, ByteString(v)))
                    .collect(),
            ),
            type_: Some(record.secret_type),
            ..Default::default()
        };

        self.secrets(namespace)
            .patch(
                name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&secret),
            )
            .await?;
        Ok(())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()> {
        match self
            .secrets(namespace)
            .delete(name, &Default::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(Error::from(e)),
        }
    }

    async fn load_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>> {
        match self.config_maps(namespace).get_opt(name).await? {
            None => Ok(None),
            Some(cm) => Ok(Some(cm.data.unwrap_or_default().into_iter().collect())),
        }
    }

    async fn create_or_update_config_map(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Result<()> {
        let cm = ConfigMap {
            metadata: kube::api::ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            data: Some(data.into_iter().collect()),
            ..Default::default()
        };
        self.config_maps(namespace)
            .patch(
                name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&cm),
            )
            .await?;
        Ok(())
    }
}

/// In-memory repository for the end-to-end scenarios — no cluster needed.
#[derive(Default)]
pub struct FakeSecretRepository {
    secrets: tokio::sync::Mutex<BTreeMap<(String, String), SecretRecord>>,
    config_maps: tokio::sync::Mutex<BTreeMap<(String, String), BTreeMap<String, String>>>,
}

impl FakeSecretRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test hook: overwrite a stored secret's data without updating its
    /// hash annotation, simulating an out-of-band edit.
    pub async fn tamper(&self, namespace: &str, name: &str, data: BTreeMap<String, Vec<u8>>) {
        let mut secrets = self.secrets.lock().await;
        if let Some(record) = secrets.get_mut(&(namespace.to_string(), name.to_string())) {
            record.data = data;
        }
    }
}

#[async_trait]
impl SecretRepository for FakeSecretRepository {
    async fn load_secret(&self, namespace: &str, name: &str) -> Result<Option<SecretRecord>> {
        let secrets = self.secrets.lock().await;
        Ok(secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn create_or_update_secret(
        &self,
        namespace: &str,
        name: &str,
        mut record: SecretRecord,
    ) -> Result<()> {
        record.refresh_hash();
        let mut secrets = self.secrets.lock().await;
        secrets.insert((namespace.to_string(), name.to_string()), record);
        Ok(())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()> {
        let mut secrets = self.secrets.lock().await;
        secrets.remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }

    async fn load_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>> {
        let config_maps = self.config_maps.lock().await;
        Ok(config_maps
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn create_or_update_config_map(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Result<()> {
        let mut config_maps = self.config_maps.lock().await;
        config_maps.insert((namespace.to_string(), name.to_string()), data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(pairs: &[(&str, &str)]) -> BTreeMap<String, Vec<u8>> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
            .collect()
    }

    #[test]
    fn structural_hash_is_order_independent() {
        let a = data(&[("ca.crt", "aaa"), ("ca.key", "bbb")]);
        let b = data(&[("ca.key", "bbb"), ("ca.crt", "aaa")]);
        assert_eq!(structural_hash(&a), structural_hash(&b));
    }

    #[test]
    fn structural_hash_changes_with_content() {
        let a = data(&[("ca.crt", "aaa")]);
        let b = data(&[("ca.crt", "zzz")]);
        assert_ne!(structural_hash(&a), structural_hash(&b));
    }

    #[test]
    fn secret_record_detects_tampering() {
        let record = SecretRecord::new(data(&[("ca.crt", "aaa")]));
        assert!(record.hash_matches());

        let mut tampered = record.clone();
        tampered.data = data(&[("ca.crt", "zzz")]);
        assert!(!tampered.hash_matches());
    }

    #[test]
    fn for_certificate_stamps_all_four_annotations() {
        let now = DateTime::parse_from_rfc3339("2026-07-27T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let record = SecretRecord::for_certificate(
            data(&[("tls.crt", "x"), ("tls.key", "y")]),
            now,
            now + Duration::days(30),
            Duration::days(30),
            SECRET_TYPE_TLS,
        );
        assert!(record.hash_matches());
        assert_eq!(record.secret_type, SECRET_TYPE_TLS);
        assert!(record.annotations.contains_key(VALID_FROM_ANNOTATION));
        assert!(record.annotations.contains_key(VALID_UPTO_ANNOTATION));
        assert_eq!(
            record.annotations.get(DURATION_ANNOTATION).unwrap(),
            &(Duration::days(30).num_seconds().to_string())
        );
    }

    #[test]
    fn set_data_preserves_other_annotations_and_refreshes_hash() {
        let now = Utc::now();
        let mut record = SecretRecord::for_certificate(
            data(&[("tls.crt", "x"), ("tls.key", "y"), ("ca.crt", "old")]),
            now,
            now + Duration::days(30),
            Duration::days(30),
            SECRET_TYPE_TLS,
        );
        let valid_upto_before = record.annotations.get(VALID_UPTO_ANNOTATION).cloned();

        record.set_data("ca.crt", b"new".to_vec());

        assert!(record.hash_matches());
        assert_eq!(
            record.annotations.get(VALID_UPTO_ANNOTATION).cloned(),
            valid_upto_before
        );
    }

    #[tokio::test]
    async fn fake_repo_round_trips_a_secret() {
        let repo = FakeSecretRepository::new();
        let record = SecretRecord::new(data(&[("ca.crt", "aaa")]));
        repo.create_or_update_secret("ns", "db-ca-secret", record)
            .await
            .unwrap();

        let loaded = repo.load_secret("ns", "db-ca-secret").await.unwrap();
        assert!(loaded.unwrap().hash_matches());
        assert!(repo.load_secret("ns", "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fake_repo_tamper_breaks_the_hash() {
        let repo = FakeSecretRepository::new();
        let record = SecretRecord::new(data(&[("ca.crt", "aaa")]));
        repo.create_or_update_secret("ns", "db-ca-secret", record)
            .await
            .unwrap();
        repo.tamper("ns", "db-ca-secret", data(&[("ca.crt", "zzz")]))
            .await;

        let loaded = repo.load_secret("ns", "db-ca-secret").await.unwrap().unwrap();
        assert!(!loaded.hash_matches());
    }
}
