//! Device Set Expander
//!
//! Expands every device set of a desired storage spec into per-replica volume
//! claims and emits one [`VolumeSource`] per device set that has at least one
//! claim in place.
//!
//! Failures are recorded in the [`ErrorSink`] and never stop sibling claims,
//! replicas or device sets. Claims that were created before a failure are left
//! as they are: the next pass fills in what is missing, and rolling back could
//! destroy data on claims that already succeeded.

use crate::config::OperatorConfig;
use crate::crd::{StorageClassDeviceSet, StorageScopeSpec};
use crate::deviceset::claim::{ClaimRenderer, GeneratedClaim};
use crate::deviceset::labels::{
    Selector, CLAIM_APP, SELECTED_NODE_ANNOTATION, SOURCE_TYPE_LABEL,
};
use crate::deviceset::sink::ErrorSink;
use crate::domain::ports::ClaimStoreRef;
use crate::error::{with_timeout, Error, Result};
use crate::metrics::OperatorMetrics;
use futures::{stream, StreamExt};
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::Display;
use tracing::{debug, info, warn};

// =============================================================================
// Output Types
// =============================================================================

/// Volumes of one device set, consumed by daemon placement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSource {
    pub name: String,
    pub source_type: String,
    pub portable: bool,
    pub scheduler_name: Option<String>,
    /// Claims in place, ordered by replica then template
    pub claims: Vec<ClaimRef>,
}

/// A claim that exists in the cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRef {
    pub replica_index: u32,
    pub source_type: String,
    pub claim_name: String,
    /// Node the claim's volume was bound to by the scheduler
    pub selected_node: Option<String>,
}

impl ClaimRef {
    fn from_claim(
        claim: &PersistentVolumeClaim,
        replica_index: u32,
        source_type: &str,
    ) -> Result<Self> {
        let claim_name = claim.metadata.name.clone().ok_or_else(|| {
            Error::Internal(format!(
                "claim for replica {} ({}) has no name",
                replica_index, source_type
            ))
        })?;
        let selected_node = claim
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(SELECTED_NODE_ANNOTATION))
            .cloned();
        Ok(Self {
            replica_index,
            source_type: source_type.to_string(),
            claim_name,
            selected_node,
        })
    }
}

/// How a claim was put in place
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Created,
    Existing,
}

impl ClaimOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            ClaimOutcome::Created => "created",
            ClaimOutcome::Existing => "existing",
        }
    }
}

// =============================================================================
// Expander
// =============================================================================

pub struct DeviceSetExpander {
    claims: ClaimStoreRef,
    config: OperatorConfig,
    metrics: OperatorMetrics,
}

impl DeviceSetExpander {
    pub fn new(claims: ClaimStoreRef, config: OperatorConfig, metrics: OperatorMetrics) -> Self {
        Self {
            claims,
            config,
            metrics,
        }
    }

    /// Expand all device sets, in spec order.
    ///
    /// Device sets run concurrently up to `expand_parallelism`; the claims of
    /// one device set are ensured sequentially, so each device set has a
    /// single writer for its volume source.
    pub async fn expand(
        &self,
        desired: &StorageScopeSpec,
        namespace: &str,
        sink: &ErrorSink,
    ) -> Vec<VolumeSource> {
        info!(
            "Expanding {} device sets in namespace {}",
            desired.storage_class_device_sets.len(),
            namespace
        );

        let mut seen = BTreeSet::new();
        let mut unique = Vec::new();
        for device_set in &desired.storage_class_device_sets {
            if seen.insert(device_set.name.as_str()) {
                unique.push(device_set);
            } else {
                self.record(sink, &device_set.name, "validate", &"duplicate device set name");
            }
        }

        // Built up front so the stream owns concrete futures and stays `Send`
        let units: Vec<_> = unique
            .into_iter()
            .map(|device_set| self.expand_device_set(device_set, namespace, sink))
            .collect();
        let sources: Vec<Option<VolumeSource>> = stream::iter(units)
            .buffered(self.config.expand_parallelism.max(1))
            .collect()
            .await;

        sources.into_iter().flatten().collect()
    }

    /// Expand a single device set. Returns `None` when no claim of the set
    /// could be put in place.
    pub async fn expand_device_set(
        &self,
        device_set: &StorageClassDeviceSet,
        namespace: &str,
        sink: &ErrorSink,
    ) -> Option<VolumeSource> {
        let name = &device_set.name;
        let renderer = match ClaimRenderer::new(device_set, namespace) {
            Ok(renderer) => renderer,
            Err(e) => {
                self.record(sink, name, "validate", &e);
                return None;
            }
        };
        if let Err(e) = self.check_storage_classes(device_set).await {
            self.record(sink, name, "validate", &e);
            return None;
        }

        let mut claims = Vec::new();
        for replica in 0..renderer.count() {
            for template_index in 0..renderer.templates().len() {
                let generated = match renderer.render(replica, template_index) {
                    Ok(generated) => generated,
                    Err(e) => {
                        self.record(sink, name, "render claim", &e);
                        continue;
                    }
                };
                let operation = format!("create claim \"{}\"", generated.generate_name);
                match self.ensure_claim(namespace, generated).await {
                    Ok((_, claim)) => claims.push(claim),
                    Err(e) => self.record(sink, name, &operation, &e),
                }
            }
        }

        if claims.is_empty() {
            debug!("Device set {} has no claims in place", name);
            return None;
        }

        debug!("Device set {} has {} claims in place", name, claims.len());
        Some(VolumeSource {
            name: name.clone(),
            source_type: renderer.primary_source_type().to_string(),
            portable: device_set.portable,
            scheduler_name: device_set.scheduler_name.clone(),
            claims,
        })
    }

    /// Ensure every claim of one replica exists, stopping at the first failure
    pub async fn ensure_replica_claims(
        &self,
        device_set: &StorageClassDeviceSet,
        namespace: &str,
        replica_index: u32,
    ) -> Result<Vec<ClaimRef>> {
        let renderer = ClaimRenderer::new(device_set, namespace)?;
        self.check_storage_classes(device_set).await?;

        let mut claims = Vec::with_capacity(renderer.templates().len());
        for template_index in 0..renderer.templates().len() {
            let generated = renderer.render(replica_index, template_index)?;
            let (_, claim) = self.ensure_claim(namespace, generated).await?;
            claims.push(claim);
        }
        Ok(claims)
    }

    /// Create a claim unless one with the same identity labels exists
    pub async fn ensure_claim(
        &self,
        namespace: &str,
        generated: GeneratedClaim,
    ) -> Result<(ClaimOutcome, ClaimRef)> {
        let timeout = self.config.call_timeout;
        let selector = Selector::replica(CLAIM_APP, &generated.device_set, generated.replica_index)
            .with(SOURCE_TYPE_LABEL, generated.source_type.as_str());

        let existing = with_timeout(
            "list claims",
            timeout,
            self.claims.list_claims(namespace, &selector),
        )
        .await?;

        if existing.len() > 1 {
            warn!(
                "Found {} claims for {} in {}, using the first by name",
                existing.len(),
                generated.generate_name,
                namespace
            );
        }

        let (outcome, claim) = match existing
            .into_iter()
            .min_by(|a, b| a.metadata.name.cmp(&b.metadata.name))
        {
            Some(claim) => (ClaimOutcome::Existing, claim),
            None => {
                let created = with_timeout(
                    "create claim",
                    timeout,
                    self.claims.create_claim(namespace, generated.claim),
                )
                .await?;
                info!(
                    "Created claim {} for device set {} replica {}",
                    created.metadata.name.as_deref().unwrap_or(&generated.generate_name),
                    generated.device_set,
                    generated.replica_index
                );
                (ClaimOutcome::Created, created)
            }
        };

        self.metrics
            .claims_ensured
            .with_label_values(&[generated.device_set.as_str(), outcome.as_str()])
            .inc();

        let claim_ref =
            ClaimRef::from_claim(&claim, generated.replica_index, &generated.source_type)?;
        Ok((outcome, claim_ref))
    }

    async fn check_storage_classes(&self, device_set: &StorageClassDeviceSet) -> Result<()> {
        if !self.config.validate_storage_classes {
            return Ok(());
        }
        let classes: BTreeSet<&str> = device_set
            .volume_claim_templates
            .iter()
            .filter_map(|t| t.storage_class())
            .collect();
        for class in classes {
            let exists = with_timeout(
                "get storage class",
                self.config.call_timeout,
                self.claims.storage_class_exists(class),
            )
            .await?;
            if !exists {
                return Err(Error::StorageClassNotFound {
                    storage_class: class.to_string(),
                });
            }
        }
        Ok(())
    }

    fn record(&self, sink: &ErrorSink, device_set: &str, operation: &str, cause: &dyn Display) {
        warn!("Device set {}: {} failed: {}", device_set, operation, cause);
        self.metrics
            .expansion_errors
            .with_label_values(&[device_set])
            .inc();
        sink.record(device_set, operation, cause);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::backends::InMemoryCluster;
    use crate::crd::DeviceSetClaimTemplate;
    use crate::domain::ports::ClaimStore;
    use k8s_openapi::api::core::v1::PersistentVolumeClaimSpec;
    use std::sync::Arc;

    fn template(source_type: Option<&str>, class: &str) -> DeviceSetClaimTemplate {
        DeviceSetClaimTemplate {
            source_type: source_type.map(str::to_string),
            spec: PersistentVolumeClaimSpec {
                storage_class_name: Some(class.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn device_set(
        name: &str,
        count: i32,
        templates: Vec<DeviceSetClaimTemplate>,
    ) -> StorageClassDeviceSet {
        StorageClassDeviceSet {
            name: name.into(),
            count,
            volume_claim_templates: templates,
            ..Default::default()
        }
    }

    fn expander(cluster: &Arc<InMemoryCluster>) -> DeviceSetExpander {
        DeviceSetExpander::new(
            cluster.clone(),
            OperatorConfig::default(),
            OperatorMetrics::default(),
        )
    }

    #[tokio::test]
    async fn test_prepare_device_sets_scenario() {
        let cluster = InMemoryCluster::with_storage_classes(["mysource"]);
        let mut set = device_set("mydata", 1, vec![template(None, "mysource")]);
        set.portable = true;
        set.scheduler_name = Some("custom-scheduler".into());
        let desired = StorageScopeSpec {
            storage_class_device_sets: vec![set],
        };

        let sink = ErrorSink::new();
        let sources = expander(&cluster).expand(&desired, "testns", &sink).await;

        assert_eq!(sources.len(), 1);
        assert!(sink.is_empty());
        assert_eq!(sources[0].name, "mydata");
        assert_eq!(sources[0].source_type, "data");
        assert!(sources[0].portable);
        assert_eq!(sources[0].scheduler_name.as_deref(), Some("custom-scheduler"));

        let claims = cluster.list_claims("testns", &Selector::new()).await.unwrap();
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].metadata.generate_name.as_deref(), Some("mydata-data-0-"));
        assert_eq!(claims[0].metadata.namespace.as_deref(), Some("testns"));
    }

    #[tokio::test]
    async fn test_claim_count_is_replicas_times_templates() {
        let cluster = InMemoryCluster::with_storage_classes(["slow", "fast"]);
        let desired = StorageScopeSpec {
            storage_class_device_sets: vec![device_set(
                "set1",
                3,
                vec![template(None, "slow"), template(Some("wal"), "fast")],
            )],
        };

        let sink = ErrorSink::new();
        let sources = expander(&cluster).expand(&desired, "ns", &sink).await;

        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].claims.len(), 6);
        assert_eq!(cluster.create_claim_calls(), 6);
        let prefixes: Vec<_> = cluster
            .list_claims("ns", &Selector::new())
            .await
            .unwrap()
            .into_iter()
            .filter_map(|c| c.metadata.generate_name)
            .collect();
        assert!(prefixes.contains(&"set1-wal-2-".to_string()));
        assert!(prefixes.contains(&"set1-data-0-".to_string()));
    }

    #[tokio::test]
    async fn test_failure_in_one_device_set_does_not_stop_siblings() {
        let cluster = InMemoryCluster::with_storage_classes(["good", "bad"]);
        cluster.fail_claims_with_prefix("broken-data-", "quota exceeded");
        let desired = StorageScopeSpec {
            storage_class_device_sets: vec![
                device_set("broken", 1, vec![template(None, "bad")]),
                device_set("healthy", 1, vec![template(None, "good")]),
            ],
        };

        let sink = ErrorSink::new();
        let sources = expander(&cluster).expand(&desired, "ns", &sink).await;

        assert_eq!(sink.len(), 1);
        assert!(sink.snapshot()[0].starts_with("device set \"broken\": create claim"));
        assert!(sink.snapshot()[0].contains("quota exceeded"));
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].name, "healthy");
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_created_claims() {
        let cluster = InMemoryCluster::with_storage_classes(["x"]);
        cluster.fail_claims_with_prefix("set1-data-1-", "api unavailable");
        let desired = StorageScopeSpec {
            storage_class_device_sets: vec![device_set("set1", 3, vec![template(None, "x")])],
        };

        let sink = ErrorSink::new();
        let sources = expander(&cluster).expand(&desired, "ns", &sink).await;

        assert_eq!(sink.len(), 1);
        assert_eq!(sources.len(), 1);
        let indices: Vec<_> = sources[0].claims.iter().map(|c| c.replica_index).collect();
        assert_eq!(indices, vec![0, 2]);
        assert_eq!(cluster.claim_count("ns"), 2);
    }

    #[tokio::test]
    async fn test_expansion_is_idempotent() {
        let cluster = InMemoryCluster::with_storage_classes(["x"]);
        let desired = StorageScopeSpec {
            storage_class_device_sets: vec![
                device_set("set1", 2, vec![template(None, "x")]),
                device_set("set2", 1, vec![template(Some("metadata"), "x")]),
            ],
        };
        let expander = expander(&cluster);

        let first = expander.expand(&desired, "ns", &ErrorSink::new()).await;
        let second_sink = ErrorSink::new();
        let second = expander.expand(&desired, "ns", &second_sink).await;

        assert!(second_sink.is_empty());
        assert_eq!(first, second);
        assert_eq!(cluster.claim_count("ns"), 3);
        assert_eq!(cluster.create_claim_calls(), 3);
    }

    #[tokio::test]
    async fn test_validation_errors_create_nothing() {
        let cluster = InMemoryCluster::with_storage_classes(["x"]);
        let desired = StorageScopeSpec {
            storage_class_device_sets: vec![
                device_set("negative", -1, vec![template(None, "x")]),
                device_set("missing-class", 1, vec![template(None, "nope")]),
            ],
        };

        let sink = ErrorSink::new();
        let sources = expander(&cluster).expand(&desired, "ns", &sink).await;

        assert!(sources.is_empty());
        assert_eq!(sink.len(), 2);
        assert!(sink.messages_for("missing-class")[0].contains("Storage class not found: nope"));
        assert_eq!(cluster.claim_count("ns"), 0);
    }

    #[tokio::test]
    async fn test_zero_count_emits_nothing_without_error() {
        let cluster = InMemoryCluster::with_storage_classes(["x"]);
        let desired = StorageScopeSpec {
            storage_class_device_sets: vec![device_set("idle", 0, vec![template(None, "x")])],
        };
        let sink = ErrorSink::new();
        let sources = expander(&cluster).expand(&desired, "ns", &sink).await;
        assert!(sources.is_empty());
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_device_set_names_are_reported() {
        let cluster = InMemoryCluster::with_storage_classes(["x"]);
        let desired = StorageScopeSpec {
            storage_class_device_sets: vec![
                device_set("set1", 1, vec![template(None, "x")]),
                device_set("set1", 2, vec![template(None, "x")]),
            ],
        };
        let sink = ErrorSink::new();
        let sources = expander(&cluster).expand(&desired, "ns", &sink).await;
        assert_eq!(sources.len(), 1);
        assert_eq!(sink.len(), 1);
        assert_eq!(cluster.claim_count("ns"), 1);
    }

    #[tokio::test]
    async fn test_output_preserves_spec_order() {
        let cluster = InMemoryCluster::with_storage_classes(["x"]);
        let names = ["c", "a", "e", "b", "d", "f"];
        let desired = StorageScopeSpec {
            storage_class_device_sets: names
                .iter()
                .map(|n| device_set(n, 1, vec![template(None, "x")]))
                .collect(),
        };
        let sources = expander(&cluster)
            .expand(&desired, "ns", &ErrorSink::new())
            .await;
        let got: Vec<_> = sources.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(got, names);
    }
}
