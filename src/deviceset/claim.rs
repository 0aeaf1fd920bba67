//! Volume Claim Renderer
//!
//! Turns a device set, a replica index and a claim-template index into a
//! concrete claim with a deterministic generated-name prefix of the form
//! `{name}-{sourceType}-{index}-`. The cluster appends a random suffix at
//! creation time. Rendering never talks to the cluster.

use crate::crd::{DeviceSetClaimTemplate, StorageClassDeviceSet};
use crate::deviceset::labels::{self, CLAIM_APP};
use crate::error::{Error, Result};
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

/// Source type of templates that do not declare one
pub const DEFAULT_SOURCE_TYPE: &str = "data";

/// Job and workload names must fit in a label value
const MAX_WORKLOAD_NAME: usize = 63;

/// Generated-name prefix of a replica's claim
pub fn generate_name_prefix(device_set: &str, source_type: &str, replica_index: u32) -> String {
    format!("{}-{}-{}-", device_set, source_type, replica_index)
}

/// A claim template with its defaults applied
#[derive(Debug, Clone)]
pub struct ResolvedTemplate<'a> {
    pub source_type: String,
    pub template: &'a DeviceSetClaimTemplate,
}

impl<'a> ResolvedTemplate<'a> {
    pub fn resolve(template: &'a DeviceSetClaimTemplate) -> Self {
        let source_type = template
            .source_type
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_SOURCE_TYPE)
            .to_string();
        Self {
            source_type,
            template,
        }
    }
}

/// A rendered claim and the identity it was rendered for
#[derive(Debug, Clone)]
pub struct GeneratedClaim {
    pub device_set: String,
    pub replica_index: u32,
    pub source_type: String,
    pub generate_name: String,
    pub claim: PersistentVolumeClaim,
}

/// Renders the claims of one device set
#[derive(Debug)]
pub struct ClaimRenderer<'a> {
    device_set: &'a StorageClassDeviceSet,
    namespace: String,
    templates: Vec<ResolvedTemplate<'a>>,
}

impl<'a> ClaimRenderer<'a> {
    /// Validate the device set and resolve its templates once
    pub fn new(device_set: &'a StorageClassDeviceSet, namespace: &str) -> Result<Self> {
        validate_device_set(device_set)?;
        let templates: Vec<_> = device_set
            .volume_claim_templates
            .iter()
            .map(ResolvedTemplate::resolve)
            .collect();

        for (i, resolved) in templates.iter().enumerate() {
            if !is_dns_label(&resolved.source_type) {
                return Err(Error::validation(
                    &device_set.name,
                    format!(
                        "claim template {} has invalid source type {:?}",
                        i, resolved.source_type
                    ),
                ));
            }
            if templates[..i]
                .iter()
                .any(|t| t.source_type == resolved.source_type)
            {
                return Err(Error::validation(
                    &device_set.name,
                    format!("duplicate source type {:?}", resolved.source_type),
                ));
            }
        }

        Ok(Self {
            device_set,
            namespace: namespace.to_string(),
            templates,
        })
    }

    pub fn templates(&self) -> &[ResolvedTemplate<'a>] {
        &self.templates
    }

    /// Desired replica count, validated non-negative
    pub fn count(&self) -> u32 {
        self.device_set.count.max(0) as u32
    }

    /// Source type of the first template
    pub fn primary_source_type(&self) -> &str {
        self.templates
            .first()
            .map(|t| t.source_type.as_str())
            .unwrap_or(DEFAULT_SOURCE_TYPE)
    }

    /// Render the claim for one (replica, template) pair
    pub fn render(&self, replica_index: u32, template_index: usize) -> Result<GeneratedClaim> {
        let name = &self.device_set.name;
        if replica_index >= self.count() {
            return Err(Error::validation(
                name,
                format!(
                    "replica index {} outside [0, {})",
                    replica_index,
                    self.count()
                ),
            ));
        }
        let resolved = self.templates.get(template_index).ok_or_else(|| {
            Error::validation(
                name,
                format!(
                    "claim template index {} outside [0, {})",
                    template_index,
                    self.templates.len()
                ),
            )
        })?;

        let generate_name = generate_name_prefix(name, &resolved.source_type, replica_index);

        let mut claim_labels = resolved.template.labels.clone();
        claim_labels.extend(labels::replica_labels(CLAIM_APP, name, replica_index));
        claim_labels.insert(
            labels::SOURCE_TYPE_LABEL.to_string(),
            resolved.source_type.clone(),
        );

        let annotations = if resolved.template.annotations.is_empty() {
            None
        } else {
            Some(resolved.template.annotations.clone())
        };

        let claim = PersistentVolumeClaim {
            metadata: ObjectMeta {
                generate_name: Some(generate_name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(claim_labels),
                annotations,
                ..Default::default()
            },
            spec: Some(resolved.template.spec.clone()),
            ..Default::default()
        };

        Ok(GeneratedClaim {
            device_set: name.clone(),
            replica_index,
            source_type: resolved.source_type.clone(),
            generate_name,
            claim,
        })
    }
}

/// Structural checks that need no cluster access
pub fn validate_device_set(device_set: &StorageClassDeviceSet) -> Result<()> {
    if !is_dns_label(&device_set.name) {
        return Err(Error::validation(
            &device_set.name,
            "name must be a lowercase DNS label",
        ));
    }
    if device_set.count < 0 {
        return Err(Error::validation(
            &device_set.name,
            format!("count {} is negative", device_set.count),
        ));
    }
    if device_set.volume_claim_templates.is_empty() {
        return Err(Error::validation(
            &device_set.name,
            "at least one volume claim template is required",
        ));
    }
    // The prepare job of the highest replica has the longest workload name
    let highest = device_set.count.max(1) as u32 - 1;
    let job_name = labels::prepare_job_name(&device_set.name, highest);
    if job_name.len() > MAX_WORKLOAD_NAME {
        return Err(Error::validation(
            &device_set.name,
            format!(
                "workload name {:?} exceeds {} characters",
                job_name, MAX_WORKLOAD_NAME
            ),
        ));
    }
    Ok(())
}

fn is_dns_label(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 63
        && s.bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        && !s.starts_with('-')
        && !s.ends_with('-')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deviceset::labels::{DEVICE_SET_LABEL, REPLICA_INDEX_LABEL, SOURCE_TYPE_LABEL};
    use k8s_openapi::api::core::v1::PersistentVolumeClaimSpec;

    fn template(source_type: Option<&str>, class: &str) -> DeviceSetClaimTemplate {
        DeviceSetClaimTemplate {
            source_type: source_type.map(str::to_string),
            spec: PersistentVolumeClaimSpec {
                storage_class_name: Some(class.to_string()),
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                volume_mode: Some("Block".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn device_set(count: i32, templates: Vec<DeviceSetClaimTemplate>) -> StorageClassDeviceSet {
        StorageClassDeviceSet {
            name: "mydata".into(),
            count,
            portable: true,
            volume_claim_templates: templates,
            ..Default::default()
        }
    }

    #[test]
    fn test_default_source_type_in_generated_name() {
        let set = device_set(1, vec![template(None, "mysource")]);
        let renderer = ClaimRenderer::new(&set, "testns").unwrap();
        let claim = renderer.render(0, 0).unwrap();

        assert_eq!(claim.generate_name, "mydata-data-0-");
        assert_eq!(claim.source_type, "data");
        assert_eq!(
            claim.claim.metadata.generate_name.as_deref(),
            Some("mydata-data-0-")
        );
        assert_eq!(claim.claim.metadata.namespace.as_deref(), Some("testns"));
        assert!(claim.claim.metadata.name.is_none());
    }

    #[test]
    fn test_spec_is_copied_verbatim() {
        let set = device_set(1, vec![template(None, "mysource")]);
        let renderer = ClaimRenderer::new(&set, "testns").unwrap();
        let spec = renderer.render(0, 0).unwrap().claim.spec.unwrap();
        assert_eq!(spec, set.volume_claim_templates[0].spec);
    }

    #[test]
    fn test_explicit_source_types_and_labels() {
        let set = device_set(
            3,
            vec![template(None, "slow"), template(Some("wal"), "fast")],
        );
        let renderer = ClaimRenderer::new(&set, "ns").unwrap();
        let claim = renderer.render(2, 1).unwrap();
        assert_eq!(claim.generate_name, "mydata-wal-2-");

        let labels = claim.claim.metadata.labels.unwrap();
        assert_eq!(labels[DEVICE_SET_LABEL], "mydata");
        assert_eq!(labels[REPLICA_INDEX_LABEL], "2");
        assert_eq!(labels[SOURCE_TYPE_LABEL], "wal");
        assert_eq!(renderer.primary_source_type(), "data");
    }

    #[test]
    fn test_rendering_is_deterministic() {
        let set = device_set(2, vec![template(Some("metadata"), "fast")]);
        let renderer = ClaimRenderer::new(&set, "ns").unwrap();
        let a = renderer.render(1, 0).unwrap();
        let b = renderer.render(1, 0).unwrap();
        assert_eq!(a.generate_name, b.generate_name);
        assert_eq!(a.claim, b.claim);
    }

    #[test]
    fn test_out_of_range_indices_are_rejected() {
        let set = device_set(1, vec![template(None, "x")]);
        let renderer = ClaimRenderer::new(&set, "ns").unwrap();
        assert!(matches!(renderer.render(1, 0), Err(Error::Validation { .. })));
        assert!(matches!(renderer.render(0, 1), Err(Error::Validation { .. })));
    }

    #[test]
    fn test_validation_failures() {
        let negative = device_set(-1, vec![template(None, "x")]);
        assert!(matches!(
            ClaimRenderer::new(&negative, "ns"),
            Err(Error::Validation { .. })
        ));

        let empty = device_set(1, vec![]);
        assert!(ClaimRenderer::new(&empty, "ns").is_err());

        let duplicate = device_set(1, vec![template(None, "x"), template(Some("data"), "y")]);
        assert!(ClaimRenderer::new(&duplicate, "ns").is_err());

        let bad_type = device_set(1, vec![template(Some("Data_1"), "x")]);
        assert!(ClaimRenderer::new(&bad_type, "ns").is_err());
    }

    #[test]
    fn test_name_too_long_for_workloads_is_rejected() {
        // 40 characters: a valid label, but the prepare job name is not
        let long = StorageClassDeviceSet {
            name: "a".repeat(40),
            ..device_set(1, vec![template(None, "x")])
        };
        assert_matches::assert_matches!(
            ClaimRenderer::new(&long, "ns"),
            Err(Error::Validation { ref reason, .. }) if reason.contains("exceeds 63")
        );

        // Fits at count 10 but not once the index gains a digit
        let edge = StorageClassDeviceSet {
            name: "b".repeat(38),
            ..device_set(10, vec![template(None, "x")])
        };
        assert!(ClaimRenderer::new(&edge, "ns").is_ok());
        let grown = StorageClassDeviceSet {
            count: 11,
            ..edge
        };
        assert!(ClaimRenderer::new(&grown, "ns").is_err());
    }

    #[test]
    fn test_empty_source_type_falls_back_to_default() {
        let set = device_set(1, vec![template(Some(""), "x")]);
        let renderer = ClaimRenderer::new(&set, "ns").unwrap();
        assert_eq!(renderer.render(0, 0).unwrap().generate_name, "mydata-data-0-");
    }
}
