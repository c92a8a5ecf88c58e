//! Command-line entry point.
//!
//! Parses one of `generate` / `rotate` / `cleanup` / `migrate-certs`,
//! builds the immutable [`Policy`] for that invocation, and dispatches
//! into the library. Any error is printed as a single line to stderr and
//! the process exits non-zero; nothing here retries.

use std::sync::Arc;

use clap::Parser;
use tracing::info;

use cockroach_cert_manager::cleanup;
use cockroach_cert_manager::generator::Generator;
use cockroach_cert_manager::policy::{Cli, Command, Mode, Policy, RotateTargets};
use cockroach_cert_manager::rotation::RotationCoordinator;
use cockroach_cert_manager::secret_repo::{KubeSecretRepository, SecretRepository};
use cockroach_cert_manager::{telemetry, Error};

#[tokio::main]
async fn main() {
    telemetry::init();
    if let Err(e) = run().await {
        eprintln!("cockroach-cert-manager: {e}");
        std::process::exit(1);
    }
}

async fn run() -> cockroach_cert_manager::Result<()> {
    let cli = Cli::parse();
    let client = kube::Client::try_default().await?;
    let repo: Arc<dyn SecretRepository> = Arc::new(KubeSecretRepository::new(client.clone()));

    match cli.command {
        Command::Generate(args) => {
            let policy = Policy::from_common(&args.common);
            let mode = if args.client_only {
                Mode::GenerateClientOnly
            } else {
                Mode::GenerateAll
            };
            let summary = Generator::new(repo, policy).run(mode).await?;
            info!(?summary, "generate complete");
        }

        Command::Rotate(args) => {
            let targets = RotateTargets::parse(args.ca, args.node, args.client)?;
            let policy = Policy::from_rotate(&args);
            let statefulset_name = policy.cluster_name.clone();

            let generator = Generator::new(repo.clone(), policy.clone());
            let coordinator = RotationCoordinator::new(client, policy, repo);
            let summary = coordinator
                .update_new_ca(&generator, targets, &statefulset_name)
                .await?;
            info!(?summary, "rotate complete");
        }

        Command::Cleanup(args) => {
            let result = cleanup::clean(&repo, &args.namespace, &args.statefulset_name).await?;
            if !result.all_succeeded() {
                return Err(Error::orchestration(format!(
                    "{} of {} secret deletions failed",
                    result.failed.len(),
                    result.failed.len() + result.deleted.len()
                )));
            }
            info!(deleted = ?result.deleted, "cleanup complete");
        }

        Command::MigrateCerts(args) => {
            let policy = Policy::from_common(&args.common);
            let summary = Generator::new(repo, policy).migrate().await?;
            info!(?summary, "migrate-certs complete");
        }
    }

    Ok(())
}
