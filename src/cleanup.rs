//! Deletes the certificate secrets a cluster owns.
//!
//! Best-effort and NotFound-tolerant: a secret that never existed, or was
//! already removed, is not an error. Deletions are attempted independently
//! so a failure on one secret doesn't block the others.

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::Result;
use crate::secret_repo::SecretRepository;

#[derive(Debug, Default)]
pub struct CleanupResult {
    pub deleted: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl CleanupResult {
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}

pub async fn clean(
    repo: &Arc<dyn SecretRepository>,
    namespace: &str,
    cluster_name: &str,
) -> Result<CleanupResult> {
    let secret_names = [
        format!("{cluster_name}-ca-secret"),
        format!("{cluster_name}-node-secret"),
        format!("{cluster_name}-client-secret"),
    ];

    let mut result = CleanupResult::default();
    for name in secret_names {
        match repo.delete_secret(namespace, &name).await {
            Ok(()) => {
                info!(secret = %name, "deleted");
                result.deleted.push(name);
            }
            Err(e) => {
                warn!(secret = %name, error = %e, "failed to delete");
                result.failed.push((name, e.to_string()));
            }
        }
    }
    Ok(result)
}
