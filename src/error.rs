//! Crate-wide error type.
//!
//! Mirrors the five error kinds from the design: configuration errors abort
//! immediately, repository errors are retried by the caller where noted,
//! crypto/state errors are (mostly) fatal to the current phase, and
//! orchestration errors abort the in-flight rolling restart without rolling
//! back already-written secrets.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Missing required environment variable, malformed duration/cron,
    /// contradictory `rotate` flags.
    #[error("configuration error: {0}")]
    Config(String),

    /// A Kubernetes API call failed. May be transient.
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// The certificate primitive failed, a PEM could not be parsed, or a
    /// loaded CA secret was missing a required key.
    #[error("certificate error: {0}")]
    Crypto(String),

    /// A loaded secret was partially present, or a user-provided CA secret
    /// lacked `ca.crt`/`ca.key`.
    #[error("secret state error: {0}")]
    State(String),

    /// A pod failed to reach Ready in time, the StatefulSet disappeared
    /// mid-restart, or a pod-exec channel failed.
    #[error("orchestration error: {0}")]
    Orchestration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for errors worth retrying soon rather than surfacing as final.
    ///
    /// Repository errors are transient Kubernetes hiccups; orchestration
    /// errors (a pod that briefly failed to come ready) are often transient
    /// too. Config/Crypto/State errors are not retriable without operator
    /// intervention.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::Kube(_) | Error::Orchestration(_))
    }

    pub fn crypto(msg: impl Into<String>) -> Self {
        Error::Crypto(msg.into())
    }

    pub fn state(msg: impl Into<String>) -> Self {
        Error::State(msg.into())
    }

    pub fn orchestration(msg: impl Into<String>) -> Self {
        Error::Orchestration(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }
}

impl From<rcgen::Error> for Error {
    fn from(e: rcgen::Error) -> Self {
        Error::Crypto(e.to_string())
    }
}

impl From<x509_parser::error::X509Error> for Error {
    fn from(e: x509_parser::error::X509Error) -> Self {
        Error::Crypto(e.to_string())
    }
}

impl From<cron::error::Error> for Error {
    fn from(e: cron::error::Error) -> Self {
        Error::Config(format!("invalid cron expression: {e}"))
    }
}

impl From<humantime::DurationError> for Error {
    fn from(e: humantime::DurationError) -> Self {
        Error::Config(format!("invalid duration: {e}"))
    }
}
