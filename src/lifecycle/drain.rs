//! Replica Drain Chain
//!
//! Removes one replica in a fixed order:
//!
//! ```text
//! mark down -> mark out -> purge -> delete prepare jobs -> delete daemon -> delete claims
//! ```
//!
//! Nothing is remembered between invocations. Every step first looks at the
//! storage cluster or the object store and only acts when its postcondition
//! is not already met, so a chain interrupted at any point resumes from the
//! first unfinished step on the next pass.

use crate::config::OperatorConfig;
use crate::deviceset::labels::{daemon_name, Selector, CLAIM_APP, DAEMON_APP, PREPARE_APP};
use crate::domain::ports::{
    ClaimStoreRef, DaemonId, DaemonMembership, StorageAdminRef, WorkloadStoreRef,
};
use crate::error::{with_timeout, Error, Result};
use crate::lifecycle::state::ReplicaId;
use crate::lifecycle::workload::daemon_id_of;
use crate::metrics::OperatorMetrics;
use serde::Serialize;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// =============================================================================
// Steps and Outcomes
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DrainStep {
    MarkDown,
    MarkOut,
    Purge,
    DeletePrepareJobs,
    DeleteDaemon,
    DeleteClaims,
}

impl DrainStep {
    pub const ORDER: [DrainStep; 6] = [
        DrainStep::MarkDown,
        DrainStep::MarkOut,
        DrainStep::Purge,
        DrainStep::DeletePrepareJobs,
        DrainStep::DeleteDaemon,
        DrainStep::DeleteClaims,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DrainStep::MarkDown => "mark-down",
            DrainStep::MarkOut => "mark-out",
            DrainStep::Purge => "purge",
            DrainStep::DeletePrepareJobs => "delete-prepare-jobs",
            DrainStep::DeleteDaemon => "delete-daemon",
            DrainStep::DeleteClaims => "delete-claims",
        }
    }

    /// Whether a failure of this step stops the rest of the chain.
    ///
    /// Prepare jobs hold no state the later steps depend on.
    pub fn blocks_successors(&self) -> bool {
        !matches!(self, DrainStep::DeletePrepareJobs)
    }
}

impl std::fmt::Display for DrainStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "kebab-case")]
pub enum StepOutcome {
    /// The step changed external state
    Done,
    /// The postcondition already held
    AlreadySatisfied,
    /// The step does not apply to this replica
    Skipped(String),
    Failed(String),
}

impl StepOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, StepOutcome::Failed(_))
    }

    fn label(&self) -> &'static str {
        match self {
            StepOutcome::Done => "done",
            StepOutcome::AlreadySatisfied => "already-satisfied",
            StepOutcome::Skipped(_) => "skipped",
            StepOutcome::Failed(_) => "failed",
        }
    }
}

/// Outcome of one drain invocation
#[derive(Debug, Clone, Serialize)]
pub struct DrainReport {
    pub replica: ReplicaId,
    pub daemon_id: Option<DaemonId>,
    pub steps: Vec<(DrainStep, StepOutcome)>,
    pub completed: bool,
}

impl DrainReport {
    fn new(replica: ReplicaId) -> Self {
        Self {
            replica,
            daemon_id: None,
            steps: Vec::with_capacity(DrainStep::ORDER.len()),
            completed: false,
        }
    }

    pub fn outcome(&self, step: DrainStep) -> Option<&StepOutcome> {
        self.steps.iter().find(|(s, _)| *s == step).map(|(_, o)| o)
    }

    pub fn first_failure(&self) -> Option<(DrainStep, &str)> {
        self.steps.iter().find_map(|(step, outcome)| match outcome {
            StepOutcome::Failed(reason) => Some((*step, reason.as_str())),
            _ => None,
        })
    }

    /// Turn an incomplete drain into [`Error::DrainIncomplete`]
    pub fn into_result(self) -> Result<Self> {
        if self.completed {
            return Ok(self);
        }
        let (step, reason) = match self.first_failure() {
            Some((step, reason)) => (step.to_string(), reason.to_string()),
            None => ("unknown".to_string(), "chain did not finish".to_string()),
        };
        Err(Error::DrainIncomplete {
            replica: self.replica.key(),
            step,
            reason,
        })
    }
}

// =============================================================================
// Chain
// =============================================================================

/// How the storage cluster knows a replica's daemon
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum Identity {
    /// The key registry maps the replica to this id
    Registered(DaemonId),
    /// The replica's labels name an id the registry no longer maps to it.
    /// The daemon was purged and the id may since belong to another replica.
    Released(DaemonId),
    #[default]
    Unregistered,
}

impl Identity {
    fn id(&self) -> Option<DaemonId> {
        match self {
            Identity::Registered(id) | Identity::Released(id) => Some(*id),
            Identity::Unregistered => None,
        }
    }
}

/// What the admin steps have observed so far in this invocation
#[derive(Debug, Default)]
struct AdminView {
    identity: Identity,
    membership: Option<DaemonMembership>,
    confirmed_down: bool,
}

impl AdminView {
    /// Daemon the admin steps act on, or the outcome of a step when there
    /// is none
    fn target(&self) -> std::result::Result<DaemonId, StepOutcome> {
        match self.identity {
            Identity::Registered(id) => Ok(id),
            Identity::Released(_) => Err(StepOutcome::AlreadySatisfied),
            Identity::Unregistered => Err(StepOutcome::Skipped(
                "no daemon identity registered".into(),
            )),
        }
    }
}

pub struct DrainChain {
    claims: ClaimStoreRef,
    workloads: WorkloadStoreRef,
    admin: StorageAdminRef,
    timeout: Duration,
    force_purge: bool,
    metrics: OperatorMetrics,
}

impl DrainChain {
    pub fn new(
        claims: ClaimStoreRef,
        workloads: WorkloadStoreRef,
        admin: StorageAdminRef,
        config: &OperatorConfig,
        metrics: OperatorMetrics,
    ) -> Self {
        Self {
            claims,
            workloads,
            admin,
            timeout: config.call_timeout,
            force_purge: config.force_purge,
            metrics,
        }
    }

    /// Run the chain for one replica.
    ///
    /// Step failures are recorded in the report. Only cancellation is
    /// returned as an error, and it is only observed between steps.
    pub async fn run(
        &self,
        replica: &ReplicaId,
        cancel: &CancellationToken,
    ) -> Result<DrainReport> {
        info!("Draining replica {}", replica);
        let mut report = DrainReport::new(replica.clone());

        checkpoint(cancel)?;
        let mut view = AdminView::default();
        match self.resolve_identity(replica).await {
            Ok(identity) => view.identity = identity,
            Err(e) => {
                let outcome = StepOutcome::Failed(format!("resolve daemon id: {}", e));
                self.note(&mut report, DrainStep::MarkDown, outcome);
                return Ok(report);
            }
        }
        report.daemon_id = view.identity.id();

        for step in DrainStep::ORDER {
            checkpoint(cancel)?;
            let outcome = match step {
                DrainStep::MarkDown => self.mark_down(&mut view).await,
                DrainStep::MarkOut => self.mark_out(&mut view).await,
                DrainStep::Purge => self.purge(&mut view).await,
                DrainStep::DeletePrepareJobs => self.delete_prepare_jobs(replica).await,
                DrainStep::DeleteDaemon => self.delete_daemon(replica).await,
                DrainStep::DeleteClaims => self.delete_claims(replica).await,
            };
            let halt = outcome.is_failed() && step.blocks_successors();
            self.note(&mut report, step, outcome);
            if halt {
                warn!("Drain of {} halted at {}", replica, step);
                return Ok(report);
            }
        }

        report.completed = report.first_failure().is_none();
        if report.completed {
            info!("Replica {} drained", replica);
        }
        Ok(report)
    }

    fn note(&self, report: &mut DrainReport, step: DrainStep, outcome: StepOutcome) {
        debug!("Drain {} step {}: {:?}", report.replica, step, outcome);
        self.metrics
            .drain_steps
            .with_label_values(&[step.as_str(), outcome.label()])
            .inc();
        report.steps.push((step, outcome));
    }

    /// Resolve the replica's daemon. The storage cluster's key registry is
    /// authoritative; the daemon id label on the replica's workload or claims
    /// only tells a purged daemon apart from one that was never registered.
    async fn resolve_identity(&self, replica: &ReplicaId) -> Result<Identity> {
        let registered = with_timeout(
            "lookup daemon",
            self.timeout,
            self.admin.lookup_daemon(&replica.key()),
        )
        .await?;
        let labeled = self.labeled_daemon_id(replica).await?;

        Ok(match (registered, labeled) {
            (Some(id), labeled) => {
                if let Some(stale) = labeled.filter(|l| *l != id) {
                    warn!(
                        "Replica {} is labeled with daemon {} but registered as {}",
                        replica, stale, id
                    );
                }
                Identity::Registered(id)
            }
            (None, Some(released)) => {
                info!(
                    "Daemon {} of replica {} is no longer registered to it",
                    released, replica
                );
                Identity::Released(released)
            }
            (None, None) => Identity::Unregistered,
        })
    }

    /// Daemon id recorded on the replica's workload, else on its claims
    async fn labeled_daemon_id(&self, replica: &ReplicaId) -> Result<Option<DaemonId>> {
        let daemons = with_timeout(
            "list daemons",
            self.timeout,
            self.workloads.list_daemons(
                &replica.namespace,
                &Selector::replica(DAEMON_APP, &replica.device_set, replica.index),
            ),
        )
        .await?;
        if let Some(id) = daemons
            .iter()
            .find_map(|d| daemon_id_of(d.metadata.labels.as_ref()))
        {
            return Ok(Some(id));
        }

        let claims = with_timeout(
            "list claims",
            self.timeout,
            self.claims.list_claims(
                &replica.namespace,
                &Selector::replica(CLAIM_APP, &replica.device_set, replica.index),
            ),
        )
        .await?;
        Ok(claims
            .iter()
            .find_map(|c| daemon_id_of(c.metadata.labels.as_ref())))
    }

    async fn status(&self, id: DaemonId) -> Result<Option<DaemonMembership>> {
        with_timeout(
            "daemon status",
            self.timeout,
            self.admin.daemon_status(id),
        )
        .await
    }

    async fn mark_down(&self, view: &mut AdminView) -> StepOutcome {
        let id = match view.target() {
            Ok(id) => id,
            Err(outcome) => return outcome,
        };
        let before = match self.status(id).await {
            Ok(status) => status,
            Err(e) => return StepOutcome::Failed(e.to_string()),
        };
        view.membership = before;
        match before {
            None => {
                view.confirmed_down = true;
                StepOutcome::AlreadySatisfied
            }
            Some(m) if !m.up => {
                view.confirmed_down = true;
                StepOutcome::AlreadySatisfied
            }
            Some(_) => {
                if let Err(e) =
                    with_timeout("mark down", self.timeout, self.admin.mark_down(id)).await
                {
                    return StepOutcome::Failed(e.to_string());
                }
                match self.status(id).await {
                    Ok(after) => {
                        view.membership = after;
                        view.confirmed_down = after.map_or(true, |m| !m.up);
                    }
                    Err(e) => warn!("Could not confirm daemon {} is down: {}", id, e),
                }
                if !view.confirmed_down {
                    warn!("Daemon {} still reported up after mark down", id);
                }
                StepOutcome::Done
            }
        }
    }

    async fn mark_out(&self, view: &mut AdminView) -> StepOutcome {
        let id = match view.target() {
            Ok(id) => id,
            Err(outcome) => return outcome,
        };
        match view.membership {
            None => StepOutcome::AlreadySatisfied,
            Some(m) if !m.in_cluster => StepOutcome::AlreadySatisfied,
            Some(m) => {
                if let Err(e) =
                    with_timeout("mark out", self.timeout, self.admin.mark_out(id)).await
                {
                    return StepOutcome::Failed(e.to_string());
                }
                view.membership = Some(DaemonMembership {
                    in_cluster: false,
                    ..m
                });
                StepOutcome::Done
            }
        }
    }

    async fn purge(&self, view: &mut AdminView) -> StepOutcome {
        let id = match view.target() {
            Ok(id) => id,
            Err(outcome) => return outcome,
        };
        if view.membership.is_none() {
            return StepOutcome::AlreadySatisfied;
        }
        if !view.confirmed_down && !self.force_purge {
            return StepOutcome::Failed(format!(
                "daemon {} is not confirmed down, refusing to purge",
                id
            ));
        }
        if let Err(e) = with_timeout(
            "purge",
            self.timeout,
            self.admin.purge(id, self.force_purge),
        )
        .await
        {
            return StepOutcome::Failed(e.to_string());
        }
        view.membership = None;
        info!("Purged daemon {}", id);
        StepOutcome::Done
    }

    async fn delete_prepare_jobs(&self, replica: &ReplicaId) -> StepOutcome {
        let selector = Selector::replica(PREPARE_APP, &replica.device_set, replica.index);
        match with_timeout(
            "delete prepare jobs",
            self.timeout,
            self.workloads
                .delete_prepare_jobs(&replica.namespace, &selector),
        )
        .await
        {
            Ok(0) => StepOutcome::AlreadySatisfied,
            Ok(_) => StepOutcome::Done,
            Err(e) => StepOutcome::Failed(e.to_string()),
        }
    }

    async fn delete_daemon(&self, replica: &ReplicaId) -> StepOutcome {
        let selector = Selector::replica(DAEMON_APP, &replica.device_set, replica.index);
        let listed = match with_timeout(
            "list daemons",
            self.timeout,
            self.workloads.list_daemons(&replica.namespace, &selector),
        )
        .await
        {
            Ok(listed) => listed,
            Err(e) => return StepOutcome::Failed(e.to_string()),
        };

        let mut names: BTreeSet<String> =
            listed.into_iter().filter_map(|d| d.metadata.name).collect();
        names.insert(daemon_name(&replica.device_set, replica.index));

        let mut removed = false;
        for name in names {
            match with_timeout(
                "delete daemon",
                self.timeout,
                self.workloads.delete_daemon(&replica.namespace, &name),
            )
            .await
            {
                Ok(true) => removed = true,
                Ok(false) => {}
                Err(e) => return StepOutcome::Failed(e.to_string()),
            }
        }

        if removed {
            StepOutcome::Done
        } else {
            StepOutcome::AlreadySatisfied
        }
    }

    async fn delete_claims(&self, replica: &ReplicaId) -> StepOutcome {
        let selector = Selector::replica(CLAIM_APP, &replica.device_set, replica.index);
        let claims = match with_timeout(
            "list claims",
            self.timeout,
            self.claims.list_claims(&replica.namespace, &selector),
        )
        .await
        {
            Ok(claims) => claims,
            Err(e) => return StepOutcome::Failed(e.to_string()),
        };
        if claims.is_empty() {
            return StepOutcome::AlreadySatisfied;
        }

        for name in claims.into_iter().filter_map(|c| c.metadata.name) {
            if let Err(e) = with_timeout(
                "delete claim",
                self.timeout,
                self.claims.delete_claim(&replica.namespace, &name),
            )
            .await
            {
                return StepOutcome::Failed(e.to_string());
            }
            debug!("Deleted claim {} of replica {}", name, replica);
        }
        StepOutcome::Done
    }
}

fn checkpoint(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    Ok(())
}
