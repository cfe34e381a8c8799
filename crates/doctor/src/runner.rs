//! The diagnostic runner.
//!
//! Sequences the runbook's steps as ordered, blocking calls. Ordering is a
//! correctness requirement: the namespaces Kustomization must be reconciled
//! before the apps one, and the rollout must finish before the probe runs.
//! Every step appends exactly one result to the run timeline.

use std::time::Duration;

use chrono::Utc;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

use crate::cluster::ClusterOps;
use crate::error::DiagnosticError;
use crate::report::{Outcome, RunReport};

/// Inputs for a `flux-check` run, fixed at invocation.
#[derive(Debug, Clone)]
pub struct FluxCheckPlan {
    pub namespace: String,
    pub apps_kustomization: String,
    pub namespaces_kustomization: String,
    pub ack_timeout: Duration,
    pub poll_interval: Duration,
}

/// Inputs for a `config-check` run, fixed at invocation.
#[derive(Debug, Clone)]
pub struct ConfigCheckPlan {
    pub namespace: String,
    pub app_name: String,
    pub deployment: String,
    pub probe_path: Option<String>,
    pub probe_port: u16,
    pub rollout_timeout: Duration,
    pub poll_interval: Duration,
}

/// Record a step failure and set the run outcome from the error class:
/// fatal errors abort with exit 2, the rest leave a diagnosed-but-degraded
/// run (exit 1).
fn fail(report: &mut RunReport, step: &str, err: &DiagnosticError) {
    report.record_error(step, err);
    report.outcome = if err.is_fatal() {
        Outcome::Fatal
    } else {
        Outcome::Degraded
    };
}

/// Run the Flux reconciliation diagnosis.
///
/// Checks the apps Kustomization's `Ready` condition; when blocked, triggers
/// a reconcile of the namespaces Kustomization, waits for acknowledgement,
/// triggers the apps Kustomization, then re-verifies readiness.
pub async fn run_flux_check(ops: &dyn ClusterOps, plan: &FluxCheckPlan) -> RunReport {
    let mut report = RunReport::new(&format!("flux-check {}", plan.namespace));

    let initial = match ops
        .kustomization(&plan.namespace, &plan.apps_kustomization)
        .await
    {
        Ok(state) => state,
        Err(err) => {
            fail(&mut report, "kustomization-status", &err);
            return report;
        }
    };

    if initial.is_ready() {
        report.record_ok("kustomization-status", initial.describe());
        info!(
            kustomization = %plan.apps_kustomization,
            "reconciliation healthy, nothing to do"
        );
        return report;
    }

    report.record_blocked("kustomization-status", initial.describe());
    info!(
        kustomization = %plan.apps_kustomization,
        reason = initial.reason.as_deref().unwrap_or("-"),
        "reconciliation blocked, triggering reconcile"
    );

    // Namespaces must converge before the apps Kustomization is retried;
    // the apps manifests depend on them existing.
    match trigger_and_ack(ops, &plan.namespace, &plan.namespaces_kustomization, plan).await {
        Ok(Ack::Acknowledged) => {
            report.record_ok("reconcile-namespaces", "reconcile acknowledged");
        }
        Ok(Ack::TimedOut) => {
            report.record_blocked(
                "reconcile-namespaces",
                format!(
                    "no acknowledgement within {}s",
                    plan.ack_timeout.as_secs()
                ),
            );
        }
        Err(err) => {
            fail(&mut report, "reconcile-namespaces", &err);
            return report;
        }
    }

    match trigger_and_ack(ops, &plan.namespace, &plan.apps_kustomization, plan).await {
        Ok(Ack::Acknowledged) => {
            report.record_ok("reconcile-apps", "reconcile acknowledged");
        }
        Ok(Ack::TimedOut) => {
            report.record_blocked(
                "reconcile-apps",
                format!(
                    "no acknowledgement within {}s",
                    plan.ack_timeout.as_secs()
                ),
            );
        }
        Err(err) => {
            fail(&mut report, "reconcile-apps", &err);
            return report;
        }
    }

    // Re-verify: poll until Ready or the acknowledgement window closes.
    let deadline = Instant::now() + plan.ack_timeout;
    loop {
        let state = match ops
            .kustomization(&plan.namespace, &plan.apps_kustomization)
            .await
        {
            Ok(state) => state,
            Err(err) => {
                fail(&mut report, "final-status", &err);
                return report;
            }
        };

        if state.is_ready() {
            report.record_ok("final-status", state.describe());
            return report;
        }
        if Instant::now() >= deadline {
            warn!(
                kustomization = %plan.apps_kustomization,
                "still not ready after reconcile"
            );
            report.record_blocked("final-status", state.describe());
            report.outcome = Outcome::Degraded;
            return report;
        }
        sleep(plan.poll_interval).await;
    }
}

enum Ack {
    Acknowledged,
    TimedOut,
}

/// Annotate a Kustomization with a fresh reconcile request token and poll
/// `status.lastHandledReconcileAt` until Flux acknowledges it.
async fn trigger_and_ack(
    ops: &dyn ClusterOps,
    namespace: &str,
    name: &str,
    plan: &FluxCheckPlan,
) -> Result<Ack, DiagnosticError> {
    let token = Utc::now().to_rfc3339();
    ops.annotate_reconcile(namespace, name, &token).await?;

    let deadline = Instant::now() + plan.ack_timeout;
    loop {
        let state = ops.kustomization(namespace, name).await?;
        if state.last_handled_reconcile_at.as_deref() == Some(token.as_str()) {
            return Ok(Ack::Acknowledged);
        }
        if Instant::now() >= deadline {
            return Ok(Ack::TimedOut);
        }
        sleep(plan.poll_interval).await;
    }
}

/// Run the ConfigMap propagation diagnosis.
///
/// Locates the app's ConfigMap, inspects it, rollout-restarts the
/// Deployment, waits for the rollout, then optionally smoke-probes the app
/// over a port-forward.
pub async fn run_config_check(ops: &dyn ClusterOps, plan: &ConfigCheckPlan) -> RunReport {
    let mut report = RunReport::new(&format!(
        "config-check {}/{}",
        plan.namespace, plan.app_name
    ));

    let names = match ops.list_config_maps(&plan.namespace).await {
        Ok(names) => names,
        Err(err) => {
            fail(&mut report, "configmap-lookup", &err);
            return report;
        }
    };

    let cm_name = match select_config_map(&plan.namespace, &plan.app_name, &names) {
        Ok(name) => name,
        Err(err) => {
            fail(&mut report, "configmap-lookup", &err);
            return report;
        }
    };
    report.record_ok("configmap-lookup", format!("matched {cm_name}"));

    match ops.config_map_data(&plan.namespace, &cm_name).await {
        Ok(data) => {
            let keys: Vec<&str> = data.keys().map(String::as_str).collect();
            report.record_ok(
                "configmap-content",
                format!("{} keys: {}", keys.len(), keys.join(", ")),
            );
        }
        Err(err) => {
            fail(&mut report, "configmap-content", &err);
            return report;
        }
    }

    if let Err(err) = ops
        .restart_deployment(&plan.namespace, &plan.deployment)
        .await
    {
        fail(&mut report, "rollout-restart", &err);
        return report;
    }
    report.record_ok(
        "rollout-restart",
        format!("restart annotation set on {}", plan.deployment),
    );

    let deadline = Instant::now() + plan.rollout_timeout;
    loop {
        let state = match ops.rollout_state(&plan.namespace, &plan.deployment).await {
            Ok(state) => state,
            Err(err) => {
                fail(&mut report, "rollout-status", &err);
                return report;
            }
        };

        if state.complete() {
            report.record_ok(
                "rollout-status",
                format!("{}/{} replicas available", state.available, state.desired),
            );
            break;
        }
        if Instant::now() >= deadline {
            // Best effort: the pod statuses explain what the rollout is
            // stuck on.
            let pods = ops
                .pod_statuses(&plan.namespace, &plan.deployment)
                .await
                .unwrap_or_default();
            let err = DiagnosticError::RolloutTimeout {
                namespace: plan.namespace.clone(),
                deployment: plan.deployment.clone(),
                timeout_secs: plan.rollout_timeout.as_secs(),
                pods,
            };
            fail(&mut report, "rollout-status", &err);
            return report;
        }
        sleep(plan.poll_interval).await;
    }

    if let Some(path) = &plan.probe_path {
        match ops
            .open_forward(&plan.namespace, &plan.deployment, plan.probe_port)
            .await
        {
            Ok(mut forward) => {
                // The forward handle drops at the end of this arm, releasing
                // the port-forward whatever the probe returned.
                match forward.http_get(path).await {
                    Ok(resp) => report.record_ok(
                        "probe",
                        format!("GET {path} -> {} ({})", resp.status, truncate(&resp.body, 80)),
                    ),
                    Err(err) => report.record_warn("probe", format!("GET {path}"), &err),
                }
            }
            Err(err) => report.record_warn("probe", format!("GET {path}"), &err),
        }
    }

    report
}

/// Pick the ConfigMap the app name refers to. An exact name match always
/// wins; otherwise a unique substring match is accepted.
fn select_config_map(
    namespace: &str,
    query: &str,
    names: &[String],
) -> Result<String, DiagnosticError> {
    if names.iter().any(|n| n == query) {
        return Ok(query.to_string());
    }

    let matches: Vec<&String> = names.iter().filter(|n| n.contains(query)).collect();
    match matches.as_slice() {
        [] => Err(DiagnosticError::NotFound {
            kind: "ConfigMap",
            namespace: namespace.to_string(),
            name: query.to_string(),
        }),
        [single] => Ok((*single).clone()),
        many => Err(DiagnosticError::AmbiguousMatch {
            query: query.to_string(),
            candidates: many.iter().map(|n| (*n).clone()).collect(),
        }),
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    let trimmed = s.trim_end();
    if trimmed.len() <= max_len {
        return trimmed.to_string();
    }
    // Cut on a char boundary; response bodies are arbitrary UTF-8.
    let cut = trimmed
        .char_indices()
        .map(|(i, _)| i)
        .take_while(|i| *i <= max_len)
        .last()
        .unwrap_or(0);
    format!("{}...", &trimmed[..cut])
}
