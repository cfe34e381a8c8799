//! config-check command - verify ConfigMap propagation to a workload.

use std::time::Duration;

use anyhow::Result;
use clap::Args;
use tracing::info;

use crate::cluster::KubeCluster;
use crate::runner::{self, ConfigCheckPlan};

const CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Inspect an app's ConfigMap, restart its Deployment and verify the rollout.
#[derive(Args)]
pub struct ConfigCheckCommand {
    /// Namespace the app runs in.
    namespace: String,

    /// App name, used to locate the ConfigMap.
    app_name: String,

    /// Deployment to restart (defaults to the app name).
    #[arg(long)]
    deployment: Option<String>,

    /// HTTP path to probe over a port-forward once the rollout finished.
    #[arg(long)]
    probe_path: Option<String>,

    /// Container port the probe targets.
    #[arg(long, default_value_t = 8080)]
    probe_port: u16,

    /// Seconds to wait for the rollout to complete.
    #[arg(long, default_value_t = 120)]
    rollout_timeout: u64,

    /// Output the run timeline as JSON.
    #[arg(long, default_value = "false")]
    json: bool,
}

impl ConfigCheckCommand {
    /// Run the check and return the process exit code.
    ///
    /// # Errors
    ///
    /// Returns an error if the Kubernetes client cannot be constructed.
    pub async fn run(&self) -> Result<i32> {
        let deployment = self
            .deployment
            .clone()
            .unwrap_or_else(|| self.app_name.clone());

        info!(
            namespace = %self.namespace,
            app = %self.app_name,
            deployment = %deployment,
            "checking ConfigMap propagation"
        );

        let cluster = KubeCluster::connect(CALL_TIMEOUT).await?;
        let plan = ConfigCheckPlan {
            namespace: self.namespace.clone(),
            app_name: self.app_name.clone(),
            deployment,
            probe_path: self.probe_path.clone(),
            probe_port: self.probe_port,
            rollout_timeout: Duration::from_secs(self.rollout_timeout),
            poll_interval: Duration::from_secs(3),
        };

        let report = runner::run_config_check(&cluster, &plan).await;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            report.print_summary();
        }

        Ok(report.exit_code())
    }
}
