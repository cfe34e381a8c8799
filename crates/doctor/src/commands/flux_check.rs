//! flux-check command - diagnose blocked Flux reconciliation.

use std::time::Duration;

use anyhow::Result;
use clap::Args;
use tracing::info;

use crate::cluster::KubeCluster;
use crate::runner::{self, FluxCheckPlan};

/// Per-call budget for individual Kubernetes API requests.
const CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Diagnose Flux reconciliation for a namespace.
#[derive(Args)]
pub struct FluxCheckCommand {
    /// Namespace holding the Flux Kustomizations.
    namespace: String,

    /// Name of the apps Kustomization.
    #[arg(long, default_value = "flux-sync-apps")]
    apps_kustomization: String,

    /// Name of the namespaces Kustomization, reconciled first.
    #[arg(long, default_value = "flux-sync-namespaces")]
    namespaces_kustomization: String,

    /// Seconds to wait for reconcile acknowledgement and readiness.
    #[arg(long, default_value_t = 60)]
    ack_timeout: u64,

    /// Output the run timeline as JSON.
    #[arg(long, default_value = "false")]
    json: bool,
}

impl FluxCheckCommand {
    /// Run the check and return the process exit code.
    ///
    /// # Errors
    ///
    /// Returns an error if the Kubernetes client cannot be constructed.
    pub async fn run(&self) -> Result<i32> {
        info!(
            namespace = %self.namespace,
            kustomization = %self.apps_kustomization,
            "checking Flux reconciliation"
        );

        let cluster = KubeCluster::connect(CALL_TIMEOUT).await?;
        let plan = FluxCheckPlan {
            namespace: self.namespace.clone(),
            apps_kustomization: self.apps_kustomization.clone(),
            namespaces_kustomization: self.namespaces_kustomization.clone(),
            ack_timeout: Duration::from_secs(self.ack_timeout),
            poll_interval: Duration::from_secs(3),
        };

        let report = runner::run_flux_check(&cluster, &plan).await;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            report.print_summary();
        }

        Ok(report.exit_code())
    }
}
