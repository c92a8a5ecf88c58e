//! CLI surface and the immutable [`Policy`] it resolves into.
//!
//! `clap` derives the `generate`/`rotate`/`cleanup`/`migrate-certs`
//! sub-commands; [`Policy`] is the validated, immutable value every other
//! module is handed — no module reaches back into `std::env` or re-parses a
//! flag (Design Notes: replace package-level flag globals with an explicit
//! `Policy` value).

use std::time::Duration as StdDuration;

use chrono::Duration as ChronoDuration;
use clap::{Parser, Subcommand};

use crate::error::{Error, Result};

pub const DEFAULT_CA_DURATION: &str = "43800h";
pub const DEFAULT_CA_EXPIRY_WINDOW: &str = "648h";
pub const DEFAULT_NODE_DURATION: &str = "8760h";
pub const DEFAULT_NODE_EXPIRY_WINDOW: &str = "168h";
pub const DEFAULT_CLIENT_DURATION: &str = "672h";
pub const DEFAULT_CLIENT_EXPIRY_WINDOW: &str = "48h";
pub const DEFAULT_READINESS_WAIT: &str = "30s";
pub const DEFAULT_POD_UPDATE_TIMEOUT: &str = "5m";

fn parse_std_duration(s: &str) -> std::result::Result<StdDuration, String> {
    humantime::parse_duration(s).map_err(|e| e.to_string())
}

/// Top-level CLI, mirroring the `generate` / `rotate` / `cleanup` /
/// `migrate-certs` sub-commands in the external interface.
#[derive(Parser, Debug)]
#[command(
    name = "cockroach-cert-manager",
    about = "Self-signing TLS certificate lifecycle manager for CockroachDB on Kubernetes"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Generate any certificate material that is missing or not Ready.
    Generate(GenerateArgs),
    /// Rotate the CA and/or node+client certificates.
    Rotate(RotateArgs),
    /// Delete the three certificate secrets owned by a cluster.
    Cleanup(CleanupArgs),
    /// Generate certificates in the layout expected by the CockroachDB operator.
    MigrateCerts(GenerateArgs),
}

/// Flags shared between `generate` and `rotate`.
#[derive(Parser, Debug, Clone)]
pub struct CommonCertArgs {
    #[arg(long, env = "CA_SECRET")]
    pub ca_secret: Option<String>,

    #[arg(long, value_parser = parse_std_duration, default_value = DEFAULT_CA_DURATION)]
    pub ca_duration: StdDuration,

    #[arg(long = "ca-expiry", value_parser = parse_std_duration, default_value = DEFAULT_CA_EXPIRY_WINDOW)]
    pub ca_expiry_window: StdDuration,

    #[arg(long, value_parser = parse_std_duration, default_value = DEFAULT_NODE_DURATION)]
    pub node_duration: StdDuration,

    #[arg(long = "node-expiry", value_parser = parse_std_duration, default_value = DEFAULT_NODE_EXPIRY_WINDOW)]
    pub node_expiry_window: StdDuration,

    #[arg(long, value_parser = parse_std_duration, default_value = DEFAULT_CLIENT_DURATION)]
    pub client_duration: StdDuration,

    #[arg(long = "client-expiry", value_parser = parse_std_duration, default_value = DEFAULT_CLIENT_EXPIRY_WINDOW)]
    pub client_expiry_window: StdDuration,

    #[arg(long, env = "STATEFULSET_NAME")]
    pub statefulset_name: String,

    #[arg(long, env = "NAMESPACE")]
    pub namespace: String,

    #[arg(long, env = "CLUSTER_DOMAIN", default_value = "cluster.local")]
    pub cluster_domain: String,

    #[arg(long, env = "USER_NAME")]
    pub user_name: Option<String>,
}

#[derive(Parser, Debug)]
pub struct GenerateArgs {
    #[command(flatten)]
    pub common: CommonCertArgs,

    /// Only (re)generate the client certificate for `USER_NAME` (or `root`).
    #[arg(long)]
    pub client_only: bool,
}

#[derive(Parser, Debug)]
pub struct RotateArgs {
    #[command(flatten)]
    pub common: CommonCertArgs,

    #[arg(long)]
    pub ca: bool,
    #[arg(long)]
    pub node: bool,
    #[arg(long)]
    pub client: bool,

    #[arg(long, default_value = "0 0 1 * *")]
    pub ca_cron: String,
    #[arg(long, default_value = "0 0 * * 0")]
    pub node_client_cron: String,

    #[arg(long, value_parser = parse_std_duration, default_value = DEFAULT_READINESS_WAIT)]
    pub readiness_wait: StdDuration,
}

#[derive(Parser, Debug)]
pub struct CleanupArgs {
    #[arg(long, env = "STATEFULSET_NAME")]
    pub statefulset_name: String,
    #[arg(long, env = "NAMESPACE")]
    pub namespace: String,
}

/// Which leaves of the CA/node/client tree an invocation should (re)mint.
///
/// `GenerateAll`/`GenerateClientOnly` cover the `generate` sub-command;
/// `Rotate` covers `rotate`, carrying exactly the flags the operator passed
/// (any non-empty subset of `{ca, node, client}` except all three at once —
/// enforced by [`RotateTargets::parse`]).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    GenerateAll,
    GenerateClientOnly,
    Rotate(RotateTargets),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RotateTargets {
    pub ca: bool,
    pub node: bool,
    pub client: bool,
}

impl RotateTargets {
    /// Enforces: not all three, not none.
    pub fn parse(ca: bool, node: bool, client: bool) -> Result<Self> {
        if ca && node && client {
            return Err(Error::config(
                "rotate: --ca, --node, and --client cannot all be set at once",
            ));
        }
        if !ca && !node && !client {
            return Err(Error::config(
                "rotate: at least one of --ca, --node, --client is required",
            ));
        }
        Ok(RotateTargets { ca, node, client })
    }
}

impl Mode {
    pub fn requests_ca_rotation(&self) -> bool {
        matches!(self, Mode::Rotate(t) if t.ca)
    }

    /// Node leaf regeneration happens on a fresh `GenerateAll` pass (if the
    /// predicate requires it) or when `rotate --node` was explicitly asked
    /// for.
    pub fn requests_node_rotation(&self) -> bool {
        matches!(self, Mode::GenerateAll) || matches!(self, Mode::Rotate(t) if t.node)
    }

    pub fn requests_client_rotation(&self) -> bool {
        matches!(self, Mode::GenerateAll | Mode::GenerateClientOnly)
            || matches!(self, Mode::Rotate(t) if t.client)
    }

    pub fn is_client_only(&self) -> bool {
        matches!(self, Mode::GenerateClientOnly)
    }
}

/// Immutable, validated configuration for one invocation of the tool.
///
/// Built once from CLI flags/environment and handed by reference (or
/// cloned) into the generator, rotation coordinator, and cleanup — no
/// component re-reads the environment.
#[derive(Clone, Debug)]
pub struct Policy {
    pub cluster_name: String,
    pub namespace: String,
    pub cluster_domain: String,
    pub public_service_name: String,
    pub discovery_service_name: String,

    pub ca_duration: ChronoDuration,
    pub ca_expiry_window: ChronoDuration,
    pub node_duration: ChronoDuration,
    pub node_expiry_window: ChronoDuration,
    pub client_duration: ChronoDuration,
    pub client_expiry_window: ChronoDuration,

    pub ca_cron: String,
    pub node_client_cron: String,

    pub ca_provided_secret: Option<String>,
    pub user_name: Option<String>,

    pub readiness_wait: StdDuration,
    pub pod_update_timeout: StdDuration,
}

fn to_chrono(d: StdDuration) -> ChronoDuration {
    ChronoDuration::from_std(d).unwrap_or(ChronoDuration::zero())
}

impl Policy {
    pub fn from_common(common: &CommonCertArgs) -> Self {
        // Fixed convention (Design Notes): publicServiceName = {sts}-public,
        // discoveryServiceName = {sts}.
        let public_service_name = format!("{}-public", common.statefulset_name);
        let discovery_service_name = common.statefulset_name.clone();

        Policy {
            cluster_name: common.statefulset_name.clone(),
            namespace: common.namespace.clone(),
            cluster_domain: common.cluster_domain.clone(),
            public_service_name,
            discovery_service_name,
            ca_duration: to_chrono(common.ca_duration),
            ca_expiry_window: to_chrono(common.ca_expiry_window),
            node_duration: to_chrono(common.node_duration),
            node_expiry_window: to_chrono(common.node_expiry_window),
            client_duration: to_chrono(common.client_duration),
            client_expiry_window: to_chrono(common.client_expiry_window),
            ca_cron: "0 0 1 * *".to_string(),
            node_client_cron: "0 0 * * 0".to_string(),
            ca_provided_secret: common.ca_secret.clone(),
            user_name: common.user_name.clone(),
            readiness_wait: humantime::parse_duration(DEFAULT_READINESS_WAIT).unwrap(),
            pod_update_timeout: humantime::parse_duration(DEFAULT_POD_UPDATE_TIMEOUT).unwrap(),
        }
    }

    pub fn from_rotate(args: &RotateArgs) -> Self {
        let mut policy = Policy::from_common(&args.common);
        policy.ca_cron = args.ca_cron.clone();
        policy.node_client_cron = args.node_client_cron.clone();
        policy.readiness_wait = args.readiness_wait;
        policy
    }

    /// Name of the client secret for the configured user.
    ///
    /// Pure function per the Design Notes — the only place the
    /// root-vs-non-root conditional is allowed to live.
    pub fn client_secret_name(&self) -> String {
        client_secret_name(&self.cluster_name, self.user_name.as_deref())
    }

    pub fn ca_secret_name(&self) -> String {
        format!("{}-ca-secret", self.cluster_name)
    }

    pub fn node_secret_name(&self) -> String {
        format!("{}-node-secret", self.cluster_name)
    }

    pub fn client_username(&self) -> &str {
        self.user_name.as_deref().unwrap_or("root")
    }
}

/// `clientSecretName(cluster, user) = user != "" ? "{user}-client-secret" : "{cluster}-client-secret"`
pub fn client_secret_name(cluster_name: &str, user_name: Option<&str>) -> String {
    match user_name {
        Some(user) if !user.is_empty() => format!("{user}-client-secret"),
        _ => format!("{cluster_name}-client-secret"),
    }
}
