//! Error taxonomy for diagnostic runs.

use thiserror::Error;

/// Errors a diagnostic step can fail with.
///
/// Transient errors are retried with backoff inside the cluster client;
/// everything else surfaces immediately and is attached to the step's
/// `DiagnosticResult`.
#[derive(Debug, Error)]
pub enum DiagnosticError {
    #[error("transient API error: {0}")]
    Transient(String),

    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    #[error("ambiguous ConfigMap match for \"{query}\": candidates {candidates:?}")]
    AmbiguousMatch {
        query: String,
        candidates: Vec<String>,
    },

    #[error("rollout of {namespace}/{deployment} not ready after {timeout_secs}s; pods: {pods:?}")]
    RolloutTimeout {
        namespace: String,
        deployment: String,
        timeout_secs: u64,
        pods: Vec<String>,
    },

    #[error("probe failed: {0}")]
    Probe(String),
}

impl DiagnosticError {
    /// Fatal errors abort the run with exit code 2; the rest are findings
    /// the run reports and carries on from.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Transient(_) | Self::NotFound { .. } | Self::AmbiguousMatch { .. }
        )
    }

    /// Whether the cluster client should retry the operation.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Map a kube API error onto the taxonomy.
///
/// 404 is fatal and never retried; server-side failures and transport
/// errors are transient.
pub fn classify_kube_error(
    err: &kube::Error,
    kind: &'static str,
    namespace: &str,
    name: &str,
) -> DiagnosticError {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => DiagnosticError::NotFound {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        },
        other => DiagnosticError::Transient(other.to_string()),
    }
}
