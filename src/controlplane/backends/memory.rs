//! In-Memory Cluster Backend
//!
//! Tracks claims, daemon workloads, prepare jobs and storage cluster
//! membership in process. Used by tests, benches and `--standalone` runs.
//! Faults can be injected per claim prefix, admin command or resource kind.

use crate::deviceset::labels::{Selector, SELECTED_NODE_ANNOTATION};
use crate::domain::ports::{
    AdminCommand, ClaimStore, DaemonId, DaemonMembership, StorageAdmin, WorkloadStore,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

type ObjectKey = (String, String);

/// Kinds of objects whose deletion can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ResourceKind {
    Claim,
    Daemon,
    PrepareJob,
}

#[derive(Default)]
struct ClusterState {
    claims: BTreeMap<ObjectKey, PersistentVolumeClaim>,
    daemons: BTreeMap<ObjectKey, Deployment>,
    jobs: BTreeMap<ObjectKey, Job>,
    storage_classes: BTreeSet<String>,

    daemon_keys: BTreeMap<String, DaemonId>,
    membership: BTreeMap<DaemonId, DaemonMembership>,
    next_daemon_id: u32,
    reuse_daemon_ids: bool,

    claim_failures: Vec<(String, String)>,
    admin_failures: BTreeMap<AdminCommand, String>,
    delete_failures: BTreeSet<ResourceKind>,
    stuck_up: BTreeSet<DaemonId>,

    journal: Vec<String>,
}

/// In-process stand-in for the cluster API and the storage admin endpoint
#[derive(Default)]
pub struct InMemoryCluster {
    state: RwLock<ClusterState>,
    name_counter: AtomicU64,
    create_claim_calls: AtomicUsize,
}

impl InMemoryCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_storage_classes<I, S>(classes: I) -> Arc<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let cluster = Self::default();
        cluster
            .state
            .write()
            .storage_classes
            .extend(classes.into_iter().map(Into::into));
        Arc::new(cluster)
    }

    // =========================================================================
    // Fault Injection
    // =========================================================================

    /// Fail creation of claims whose generated name starts with `prefix`
    pub fn fail_claims_with_prefix(&self, prefix: &str, reason: &str) {
        self.state
            .write()
            .claim_failures
            .push((prefix.to_string(), reason.to_string()));
    }

    pub fn clear_claim_failures(&self) {
        self.state.write().claim_failures.clear();
    }

    pub fn fail_admin(&self, command: AdminCommand, reason: &str) {
        self.state
            .write()
            .admin_failures
            .insert(command, reason.to_string());
    }

    pub fn clear_admin_failure(&self, command: AdminCommand) {
        self.state.write().admin_failures.remove(&command);
    }

    pub fn fail_deletes(&self, kind: ResourceKind) {
        self.state.write().delete_failures.insert(kind);
    }

    pub fn clear_delete_failure(&self, kind: ResourceKind) {
        self.state.write().delete_failures.remove(&kind);
    }

    /// Hand out the lowest free daemon id, as storage clusters do once a
    /// daemon has been purged
    pub fn reuse_daemon_ids(&self) {
        self.state.write().reuse_daemon_ids = true;
    }

    /// Keep a daemon reporting up after it is marked down
    pub fn keep_daemon_up(&self, id: DaemonId) {
        self.state.write().stuck_up.insert(id);
    }

    pub fn release_daemon(&self, id: DaemonId) {
        self.state.write().stuck_up.remove(&id);
    }

    // =========================================================================
    // Simulated Cluster Behaviour
    // =========================================================================

    /// Report every daemon workload in `namespace` as ready
    pub fn mark_daemons_ready(&self, namespace: &str) {
        let mut state = self.state.write();
        for ((ns, _), daemon) in state.daemons.iter_mut() {
            if ns == namespace {
                daemon.status = Some(DeploymentStatus {
                    replicas: Some(1),
                    ready_replicas: Some(1),
                    available_replicas: Some(1),
                    ..Default::default()
                });
            }
        }
    }

    /// Bind every claim in `namespace` to `node`, as a local-volume scheduler would
    pub fn bind_claims_to_node(&self, namespace: &str, node: &str) {
        let mut state = self.state.write();
        for ((ns, _), claim) in state.claims.iter_mut() {
            if ns == namespace {
                claim
                    .metadata
                    .annotations
                    .get_or_insert_with(BTreeMap::new)
                    .insert(SELECTED_NODE_ANNOTATION.to_string(), node.to_string());
            }
        }
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    pub fn claim_count(&self, namespace: &str) -> usize {
        self.state
            .read()
            .claims
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .count()
    }

    pub fn create_claim_calls(&self) -> usize {
        self.create_claim_calls.load(Ordering::SeqCst)
    }

    pub fn daemon_names(&self, namespace: &str) -> Vec<String> {
        self.state
            .read()
            .daemons
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn job_count(&self, namespace: &str) -> usize {
        self.state
            .read()
            .jobs
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .count()
    }

    pub fn membership(&self, id: DaemonId) -> Option<DaemonMembership> {
        self.state.read().membership.get(&id).copied()
    }

    /// Mutating calls in the order they were applied
    pub fn journal(&self) -> Vec<String> {
        self.state.read().journal.clone()
    }

    pub fn clear_journal(&self) {
        self.state.write().journal.clear();
    }

    fn generated_suffix(&self) -> String {
        let n = self.name_counter.fetch_add(1, Ordering::SeqCst);
        format!("{:05x}", n)
    }

    fn admin_check(state: &ClusterState, command: AdminCommand) -> Result<()> {
        match state.admin_failures.get(&command) {
            Some(reason) => Err(Error::AdminCommand {
                command: command.to_string(),
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    fn delete_check(state: &ClusterState, kind: ResourceKind, name: &str) -> Result<()> {
        if state.delete_failures.contains(&kind) {
            return Err(Error::ClusterApi {
                operation: format!("delete {:?} {}", kind, name),
                reason: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

fn key(namespace: &str, name: &str) -> ObjectKey {
    (namespace.to_string(), name.to_string())
}

fn object_name(meta_name: &Option<String>, kind: &str) -> Result<String> {
    meta_name
        .clone()
        .ok_or_else(|| Error::Internal(format!("{} without a name", kind)))
}

// =============================================================================
// ClaimStore
// =============================================================================

#[async_trait]
impl ClaimStore for InMemoryCluster {
    async fn create_claim(
        &self,
        namespace: &str,
        mut claim: PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim> {
        self.create_claim_calls.fetch_add(1, Ordering::SeqCst);

        let prefix = claim.metadata.generate_name.clone().unwrap_or_default();
        let name = match &claim.metadata.name {
            Some(name) => name.clone(),
            None => format!("{}{}", prefix, self.generated_suffix()),
        };

        let mut state = self.state.write();
        if let Some((_, reason)) = state
            .claim_failures
            .iter()
            .find(|(p, _)| prefix.starts_with(p.as_str()) || name.starts_with(p.as_str()))
        {
            return Err(Error::ClusterApi {
                operation: format!("create claim {}", prefix),
                reason: reason.clone(),
            });
        }

        if let Some(existing) = state.claims.get(&key(namespace, &name)) {
            return Ok(existing.clone());
        }

        claim.metadata.name = Some(name.clone());
        claim.metadata.namespace = Some(namespace.to_string());
        state.claims.insert(key(namespace, &name), claim.clone());
        state.journal.push(format!("create claim {}", name));
        debug!("In-memory claim created: {}/{}", namespace, name);
        Ok(claim)
    }

    async fn list_claims(
        &self,
        namespace: &str,
        selector: &Selector,
    ) -> Result<Vec<PersistentVolumeClaim>> {
        let state = self.state.read();
        Ok(state
            .claims
            .iter()
            .filter(|((ns, _), c)| ns == namespace && selector.matches(c.metadata.labels.as_ref()))
            .map(|(_, c)| c.clone())
            .collect())
    }

    async fn patch_claim_labels(
        &self,
        namespace: &str,
        name: &str,
        labels: BTreeMap<String, String>,
    ) -> Result<PersistentVolumeClaim> {
        let mut state = self.state.write();
        let claim = state
            .claims
            .get_mut(&key(namespace, name))
            .ok_or_else(|| Error::ResourceNotFound {
                kind: "PersistentVolumeClaim".into(),
                name: name.into(),
            })?;
        claim
            .metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .extend(labels);
        Ok(claim.clone())
    }

    async fn delete_claim(&self, namespace: &str, name: &str) -> Result<bool> {
        let mut state = self.state.write();
        Self::delete_check(&state, ResourceKind::Claim, name)?;
        let removed = state.claims.remove(&key(namespace, name)).is_some();
        if removed {
            state.journal.push(format!("delete claim {}", name));
        }
        Ok(removed)
    }

    async fn storage_class_exists(&self, name: &str) -> Result<bool> {
        Ok(self.state.read().storage_classes.contains(name))
    }
}

// =============================================================================
// WorkloadStore
// =============================================================================

#[async_trait]
impl WorkloadStore for InMemoryCluster {
    async fn create_daemon(&self, namespace: &str, mut daemon: Deployment) -> Result<Deployment> {
        let name = object_name(&daemon.metadata.name, "Deployment")?;
        let mut state = self.state.write();
        if let Some(existing) = state.daemons.get(&key(namespace, &name)) {
            return Ok(existing.clone());
        }
        daemon.metadata.namespace = Some(namespace.to_string());
        state.daemons.insert(key(namespace, &name), daemon.clone());
        state.journal.push(format!("create daemon {}", name));
        Ok(daemon)
    }

    async fn list_daemons(&self, namespace: &str, selector: &Selector) -> Result<Vec<Deployment>> {
        let state = self.state.read();
        Ok(state
            .daemons
            .iter()
            .filter(|((ns, _), d)| ns == namespace && selector.matches(d.metadata.labels.as_ref()))
            .map(|(_, d)| d.clone())
            .collect())
    }

    async fn delete_daemon(&self, namespace: &str, name: &str) -> Result<bool> {
        let mut state = self.state.write();
        Self::delete_check(&state, ResourceKind::Daemon, name)?;
        let removed = state.daemons.remove(&key(namespace, name)).is_some();
        if removed {
            state.journal.push(format!("delete daemon {}", name));
        }
        Ok(removed)
    }

    async fn pin_daemon(
        &self,
        namespace: &str,
        name: &str,
        node_selector: BTreeMap<String, String>,
    ) -> Result<Deployment> {
        let mut state = self.state.write();
        let daemon = state
            .daemons
            .get_mut(&key(namespace, name))
            .ok_or_else(|| Error::ResourceNotFound {
                kind: "Deployment".into(),
                name: name.into(),
            })?;
        let nodes: Vec<String> = node_selector.values().cloned().collect();
        if let Some(pod) = daemon
            .spec
            .as_mut()
            .and_then(|s| s.template.spec.as_mut())
        {
            pod.node_selector
                .get_or_insert_with(BTreeMap::new)
                .extend(node_selector);
        }
        let pinned = daemon.clone();
        state
            .journal
            .push(format!("pin daemon {} {}", name, nodes.join(",")));
        Ok(pinned)
    }

    async fn create_prepare_job(&self, namespace: &str, mut job: Job) -> Result<Job> {
        let name = object_name(&job.metadata.name, "Job")?;
        let mut state = self.state.write();
        if let Some(existing) = state.jobs.get(&key(namespace, &name)) {
            return Ok(existing.clone());
        }
        job.metadata.namespace = Some(namespace.to_string());
        state.jobs.insert(key(namespace, &name), job.clone());
        state.journal.push(format!("create job {}", name));
        Ok(job)
    }

    async fn list_prepare_jobs(&self, namespace: &str, selector: &Selector) -> Result<Vec<Job>> {
        let state = self.state.read();
        Ok(state
            .jobs
            .iter()
            .filter(|((ns, _), j)| ns == namespace && selector.matches(j.metadata.labels.as_ref()))
            .map(|(_, j)| j.clone())
            .collect())
    }

    async fn delete_prepare_jobs(&self, namespace: &str, selector: &Selector) -> Result<usize> {
        let mut state = self.state.write();
        Self::delete_check(&state, ResourceKind::PrepareJob, &selector.to_string())?;
        let doomed: Vec<ObjectKey> = state
            .jobs
            .iter()
            .filter(|((ns, _), j)| ns == namespace && selector.matches(j.metadata.labels.as_ref()))
            .map(|(k, _)| k.clone())
            .collect();
        for k in &doomed {
            state.jobs.remove(k);
            state.journal.push(format!("delete job {}", k.1));
        }
        Ok(doomed.len())
    }
}

// =============================================================================
// StorageAdmin
// =============================================================================

#[async_trait]
impl StorageAdmin for InMemoryCluster {
    async fn register_daemon(&self, replica_key: &str) -> Result<DaemonId> {
        let mut state = self.state.write();
        Self::admin_check(&state, AdminCommand::Register)?;
        if let Some(id) = state.daemon_keys.get(replica_key) {
            return Ok(*id);
        }
        let id = if state.reuse_daemon_ids {
            let taken: BTreeSet<DaemonId> = state
                .membership
                .keys()
                .chain(state.daemon_keys.values())
                .copied()
                .collect();
            let mut n = 0;
            while taken.contains(&DaemonId(n)) {
                n += 1;
            }
            DaemonId(n)
        } else {
            let id = DaemonId(state.next_daemon_id);
            state.next_daemon_id += 1;
            id
        };
        state.daemon_keys.insert(replica_key.to_string(), id);
        state.membership.insert(
            id,
            DaemonMembership {
                up: true,
                in_cluster: true,
            },
        );
        state.journal.push(format!("register {} {}", replica_key, id));
        Ok(id)
    }

    async fn lookup_daemon(&self, replica_key: &str) -> Result<Option<DaemonId>> {
        let state = self.state.read();
        Self::admin_check(&state, AdminCommand::Lookup)?;
        Ok(state.daemon_keys.get(replica_key).copied())
    }

    async fn daemon_status(&self, id: DaemonId) -> Result<Option<DaemonMembership>> {
        let state = self.state.read();
        Self::admin_check(&state, AdminCommand::Status)?;
        Ok(state.membership.get(&id).copied())
    }

    async fn mark_down(&self, id: DaemonId) -> Result<()> {
        let mut state = self.state.write();
        Self::admin_check(&state, AdminCommand::MarkDown)?;
        let stuck = state.stuck_up.contains(&id);
        if let Some(member) = state.membership.get_mut(&id) {
            if !stuck {
                member.up = false;
            }
        }
        state.journal.push(format!("mark down {}", id));
        Ok(())
    }

    async fn mark_out(&self, id: DaemonId) -> Result<()> {
        let mut state = self.state.write();
        Self::admin_check(&state, AdminCommand::MarkOut)?;
        if let Some(member) = state.membership.get_mut(&id) {
            member.in_cluster = false;
        }
        state.journal.push(format!("mark out {}", id));
        Ok(())
    }

    async fn purge(&self, id: DaemonId, _force: bool) -> Result<()> {
        let mut state = self.state.write();
        Self::admin_check(&state, AdminCommand::Purge)?;
        state.membership.remove(&id);
        state.daemon_keys.retain(|_, v| *v != id);
        state.journal.push(format!("purge {}", id));
        Ok(())
    }
}
