//! Cluster access seam.
//!
//! The runner talks to the cluster exclusively through [`ClusterOps`], so the
//! sequencing logic can be exercised against fakes. The kube-backed
//! implementation lives in the `kube` submodule.

pub mod forward;
pub mod kube;

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::DiagnosticError;

pub use self::kube::KubeCluster;

/// Readiness of a Flux Kustomization, derived from its `Ready` condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    NotReady,
    /// Condition missing or `Unknown`; treated as blocked.
    Unknown,
}

/// Snapshot of a Kustomization's reconciliation state.
#[derive(Debug, Clone)]
pub struct KustomizationState {
    pub readiness: Readiness,
    pub reason: Option<String>,
    pub message: Option<String>,
    /// `status.lastHandledReconcileAt`, used to acknowledge a triggered
    /// reconcile.
    pub last_handled_reconcile_at: Option<String>,
}

impl KustomizationState {
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.readiness == Readiness::Ready
    }

    /// One-line rendering for the step detail.
    #[must_use]
    pub fn describe(&self) -> String {
        match self.readiness {
            Readiness::Ready => "Ready=True".to_string(),
            Readiness::NotReady => format!(
                "Ready=False reason={} message={}",
                self.reason.as_deref().unwrap_or("-"),
                self.message.as_deref().unwrap_or("-"),
            ),
            Readiness::Unknown => "Ready=Unknown".to_string(),
        }
    }
}

/// Snapshot of a Deployment's rollout progress.
#[derive(Debug, Clone, Copy)]
pub struct RolloutState {
    pub generation: i64,
    pub observed_generation: i64,
    pub desired: i32,
    pub updated: i32,
    pub available: i32,
}

impl RolloutState {
    /// The rollout is done once the controller has seen the latest spec and
    /// every desired replica is updated and available.
    #[must_use]
    pub fn complete(&self) -> bool {
        self.observed_generation >= self.generation
            && self.updated == self.desired
            && self.available == self.desired
    }
}

/// Response of the single HTTP smoke probe.
#[derive(Debug, Clone)]
pub struct ProbeResponse {
    pub status: u16,
    pub body: String,
}

/// A live port-forward. Dropping the handle releases the forward
/// unconditionally, whatever the probe did with it.
#[async_trait]
pub trait ForwardHandle: Send {
    /// Issue one HTTP GET over the forwarded connection.
    async fn http_get(&mut self, path: &str) -> Result<ProbeResponse, DiagnosticError>;
}

/// Everything the diagnostic runner needs from the cluster.
#[async_trait]
pub trait ClusterOps: Send + Sync {
    async fn kustomization(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<KustomizationState, DiagnosticError>;

    /// Set `reconcile.fluxcd.io/requestedAt` to `token`, asking Flux to
    /// reconcile now.
    async fn annotate_reconcile(
        &self,
        namespace: &str,
        name: &str,
        token: &str,
    ) -> Result<(), DiagnosticError>;

    async fn list_config_maps(&self, namespace: &str) -> Result<Vec<String>, DiagnosticError>;

    async fn config_map_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, String>, DiagnosticError>;

    /// Patch the pod template's `kubectl.kubernetes.io/restartedAt`
    /// annotation, triggering a rollout restart.
    async fn restart_deployment(&self, namespace: &str, name: &str)
        -> Result<(), DiagnosticError>;

    async fn rollout_state(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<RolloutState, DiagnosticError>;

    /// One line per pod of the deployment, for timeout reporting.
    async fn pod_statuses(
        &self,
        namespace: &str,
        deployment: &str,
    ) -> Result<Vec<String>, DiagnosticError>;

    /// Open a port-forward to a ready pod of the deployment.
    async fn open_forward(
        &self,
        namespace: &str,
        deployment: &str,
        port: u16,
    ) -> Result<Box<dyn ForwardHandle>, DiagnosticError>;
}
