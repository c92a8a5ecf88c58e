//! Orchestrates bringing a running CockroachDB StatefulSet onto freshly
//! minted certificate material: a pod-by-pod rolling restart, or (for
//! deployments that support it) a live SIGHUP reload with no restart.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams, DeleteParams};
use kube::Client;
use tokio::time::sleep;
use tracing::{info, instrument, warn};

use crate::error::{Error, Result};
use crate::generator::{Generator, RunSummary};
use crate::policy::{Mode, Policy, RotateTargets};
use crate::secret_repo::SecretRepository;

const POD_DELETE_DWELL: Duration = Duration::from_secs(5);
const SIGHUP_DWELL: Duration = Duration::from_secs(1);

pub struct RotationCoordinator {
    client: Client,
    policy: Policy,
    repo: Arc<dyn SecretRepository>,
}

impl RotationCoordinator {
    pub fn new(client: Client, policy: Policy, repo: Arc<dyn SecretRepository>) -> Self {
        RotationCoordinator { client, policy, repo }
    }

    fn statefulsets(&self) -> Api<StatefulSet> {
        Api::namespaced(self.client.clone(), &self.policy.namespace)
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.policy.namespace)
    }

    fn ca_secret_name(&self) -> String {
        self.policy
            .ca_provided_secret
            .clone()
            .unwrap_or_else(|| self.policy.ca_secret_name())
    }

    /// Run `generator` against the requested rotate `targets`. If the CA
    /// was rotated, the node and client secrets' `ca.crt` are rewritten to
    /// the new trust bundle (their own `tls.crt`/`tls.key` untouched)
    /// before anything is restarted, so every pod that comes back up can
    /// already validate its peers against the new CA.
    pub async fn update_new_ca(
        &self,
        generator: &Generator,
        targets: RotateTargets,
        statefulset_name: &str,
    ) -> Result<RunSummary> {
        let summary = generator.run(Mode::Rotate(targets)).await?;
        if summary.ca_rotated {
            self.refresh_leaf_ca_bundles().await?;
        }
        if summary.any_change() {
            self.rolling_restart(statefulset_name).await?;
        }
        Ok(summary)
    }

    /// Rewrite `{cluster}-node-secret` and `{cluster}-client-secret` with
    /// the CA secret's current `ca.crt` bundle, leaving every other data
    /// key and their own certificate-validity annotations untouched.
    async fn refresh_leaf_ca_bundles(&self) -> Result<()> {
        let ca_record = self
            .repo
            .load_secret(&self.policy.namespace, &self.ca_secret_name())
            .await?
            .ok_or_else(|| Error::state("CA secret is missing"))?;
        let bundle = ca_record
            .data
            .get("ca.crt")
            .cloned()
            .ok_or_else(|| Error::state("CA secret has no ca.crt"))?;

        for name in [self.policy.node_secret_name(), self.policy.client_secret_name()] {
            if let Some(mut record) = self.repo.load_secret(&self.policy.namespace, &name).await? {
                record.set_data("ca.crt", bundle.clone());
                self.repo
                    .create_or_update_secret(&self.policy.namespace, &name, record)
                    .await?;
                info!(secret = %name, "refreshed ca.crt bundle after CA rotation");
            }
        }
        Ok(())
    }

    /// Delete each pod in strict ascending ordinal order, waiting for it
    /// to become Ready before moving on. No rollback on failure: an error
    /// here aborts the in-flight restart, leaving whatever pods have
    /// already rolled onto the new certificates as they are.
    #[instrument(skip(self), fields(statefulset = %statefulset_name))]
    pub async fn rolling_restart(&self, statefulset_name: &str) -> Result<()> {
        let sts_api = self.statefulsets();
        let sts = sts_api.get(statefulset_name).await?;
        let replicas = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
        let pods = self.pods();

        for ordinal in 0..replicas {
            let pod_name = format!("{statefulset_name}-{ordinal}");
            info!(pod = %pod_name, "restarting pod for certificate reload");

            match pods.delete(&pod_name, &DeleteParams::default()).await {
                Ok(_) => {}
                Err(kube::Error::Api(e)) if e.code == 404 => {}
                Err(e) => return Err(Error::from(e)),
            }

            sleep(POD_DELETE_DWELL).await;
            self.wait_for_ready(&pods, &pod_name).await?;
            sleep(self.policy.readiness_wait).await;
        }

        let sts = sts_api.get(statefulset_name).await?;
        let ready = sts.status.as_ref().and_then(|s| s.ready_replicas).unwrap_or(0);
        if ready < replicas {
            return Err(Error::orchestration(format!(
                "statefulset {statefulset_name} has {ready}/{replicas} ready replicas after rolling restart"
            )));
        }
        Ok(())
    }

    async fn wait_for_ready(&self, pods: &Api<Pod>, pod_name: &str) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.policy.pod_update_timeout;
        let mut attempt: u32 = 0;

        loop {
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::orchestration(format!(
                    "pod {pod_name} did not become ready within the configured timeout"
                )));
            }

            match pods.get_opt(pod_name).await? {
                Some(pod) if is_ready(&pod) => return Ok(()),
                _ => {
                    let backoff = calculate_backoff(attempt, 1, 5);
                    warn!(pod = %pod_name, attempt, ?backoff, "pod not ready yet, backing off");
                    sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Send SIGHUP to each pod's `cockroach` process instead of a rolling
    /// restart, so already-established client connections survive the
    /// certificate reload. No readiness polling: the process is expected
    /// to keep serving through the reload.
    #[instrument(skip(self), fields(statefulset = %statefulset_name))]
    pub async fn sighup_pods(&self, statefulset_name: &str) -> Result<()> {
        let sts_api = self.statefulsets();
        let sts = sts_api.get(statefulset_name).await?;
        let replicas = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
        let pods = self.pods();

        for ordinal in 0..replicas {
            let pod_name = format!("{statefulset_name}-{ordinal}");
            info!(pod = %pod_name, "sending SIGHUP");
            let attach_params = AttachParams::default().container("cockroachdb");
            let mut process = pods
                .exec(&pod_name, vec!["pkill", "-HUP", "cockroach"], &attach_params)
                .await?;
            process
                .join()
                .await
                .map_err(|e| Error::orchestration(e.to_string()))?;
            sleep(SIGHUP_DWELL).await;
        }
        Ok(())
    }
}

fn is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

/// Exponential backoff, doubling from `base_delay_secs` each attempt and
/// capped at `max_delay_secs`.
pub fn calculate_backoff(attempt: u32, base_delay_secs: u64, max_delay_secs: u64) -> Duration {
    let capped_attempt = attempt.min(32);
    let delay = base_delay_secs.saturating_mul(1u64 << capped_attempt.min(16));
    Duration::from_secs(delay.min(max_delay_secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_capped() {
        assert_eq!(calculate_backoff(0, 1, 5), Duration::from_secs(1));
        assert_eq!(calculate_backoff(1, 1, 5), Duration::from_secs(2));
        assert_eq!(calculate_backoff(2, 1, 5), Duration::from_secs(4));
        assert_eq!(calculate_backoff(3, 1, 5), Duration::from_secs(5));
        assert_eq!(calculate_backoff(10, 1, 5), Duration::from_secs(5));
    }

    #[test]
    fn backoff_respects_a_larger_base() {
        assert_eq!(calculate_backoff(0, 2, 30), Duration::from_secs(2));
        assert_eq!(calculate_backoff(2, 2, 30), Duration::from_secs(8));
    }
}
