//! Error types for the runtime operator
//!
//! Every failure mode the reconciler can hit is a distinct variant so the
//! phase machine can map errors to reasons without inspecting message text.

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors produced by the operator.
#[derive(Error, Debug)]
pub enum Error {
    /// Error from the Kubernetes API
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Declaration failed validation (duplicate component names, etc.)
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// A builder strategy rejected or failed to materialize a component
    #[error("build failed for component {component}: {message}")]
    BuildError { component: String, message: String },

    /// Server-side apply of a desired resource failed
    #[error("ApplyFailed: {kind} {namespace}/{name}: {message}")]
    ApplyError {
        kind: String,
        namespace: String,
        name: String,
        message: String,
        /// Optimistic-concurrency conflict (HTTP 409); expected, requeue soon
        conflict: bool,
    },

    /// A desired resource is already controlled by a foreign owner
    #[error("owner reference conflict on {kind} {name}: {message}")]
    OwnerRefError {
        kind: String,
        name: String,
        message: String,
    },

    /// The health check itself failed (transport or conversion)
    #[error("health check failed for {component}: {message}")]
    HealthError { component: String, message: String },

    /// Writing the status subresource failed after retries
    #[error("status update failed: {0}")]
    StatusError(String),

    /// Adding or removing the finalizer failed after retries
    #[error("finalizer update failed: {0}")]
    FinalizerError(String),

    /// Webhook event delivery failed (logged, never fatal)
    #[error("webhook delivery failed: {0}")]
    WebhookError(String),

    /// Operator misconfiguration
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl Error {
    /// Whether a short retry is likely to succeed.
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::KubeError(kube::Error::Api(e)) => e.code == 409 || e.code >= 500,
            Error::KubeError(_) => true,
            Error::ApplyError { conflict, .. } => *conflict,
            Error::HealthError { .. } => true,
            Error::StatusError(_) => true,
            Error::FinalizerError(_) => true,
            Error::WebhookError(_) => true,
            _ => false,
        }
    }

    /// Whether this is an optimistic-concurrency conflict.
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::KubeError(kube::Error::Api(e)) => e.code == 409,
            Error::ApplyError { conflict, .. } => *conflict,
            _ => false,
        }
    }

    /// Machine-readable reason for the `Failed` phase and its condition.
    pub fn phase_reason(&self) -> &'static str {
        match self {
            Error::BuildError { .. } | Error::ValidationError(_) => "ProcessingFailed",
            Error::ApplyError { .. } | Error::OwnerRefError { .. } => "ApplyFailed",
            Error::HealthError { .. } => "HealthCheckFailed",
            Error::StatusError(_) => "StatusUpdateFailed",
            Error::FinalizerError(_) => "FinalizerFailed",
            _ => "ReconcileFailed",
        }
    }
}
