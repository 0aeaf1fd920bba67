//! StorageCluster Controller
//!
//! Watches StorageCluster objects and runs one orchestrator pass per
//! reconcile. The pass result is written back as the object's status.

use crate::controlplane::orchestrator::Orchestrator;
use crate::crd::StorageCluster;
use crate::error::{Error, ErrorAction, Result};
use futures::StreamExt;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Client, ResourceExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Shared state handed to every reconcile
pub struct OperatorContext {
    pub client: Client,
    pub orchestrator: Arc<Orchestrator>,
    pub cancel: CancellationToken,
}

async fn reconcile(cluster: Arc<StorageCluster>, ctx: Arc<OperatorContext>) -> Result<Action> {
    let name = cluster.name_any();
    let namespace = cluster
        .namespace()
        .ok_or_else(|| Error::Configuration(format!("StorageCluster {} has no namespace", name)))?;
    debug!("Reconciling StorageCluster {}/{}", namespace, name);

    let report = ctx
        .orchestrator
        .reconcile(&namespace, &cluster.spec, &ctx.cancel)
        .await?;

    let status = report.status(cluster.metadata.generation);
    let patch = serde_json::json!({ "status": status });
    let api: Api<StorageCluster> = Api::namespaced(ctx.client.clone(), &namespace);
    api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;

    let requeue = report.requeue_after(ctx.orchestrator.config());
    info!(
        "StorageCluster {}/{} is {}, next pass in {:?}",
        namespace, name, status.phase, requeue
    );
    Ok(Action::requeue(requeue))
}

fn error_policy(cluster: Arc<StorageCluster>, error: &Error, ctx: Arc<OperatorContext>) -> Action {
    warn!("Reconcile of {} failed: {}", cluster.name_any(), error);
    match error.action() {
        ErrorAction::RequeueWithBackoff => {
            Action::requeue(ctx.orchestrator.config().retry_interval)
        }
        ErrorAction::RequeueAfter(after) => Action::requeue(after),
        ErrorAction::NoRequeue => Action::await_change(),
    }
}

/// Run the controller until a shutdown signal arrives
pub async fn run(ctx: Arc<OperatorContext>, namespace: Option<&str>) -> Result<()> {
    let api: Api<StorageCluster> = match namespace {
        Some(ns) => Api::namespaced(ctx.client.clone(), ns),
        None => Api::all(ctx.client.clone()),
    };

    info!(
        "Watching StorageClusters in {}",
        namespace.unwrap_or("all namespaces")
    );

    Controller::new(api, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((object, _)) => debug!("Reconciled {}", object.name),
                Err(e) => warn!("Controller error: {}", e),
            }
        })
        .await;

    info!("Controller stopped");
    Ok(())
}
