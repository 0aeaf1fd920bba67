//! Kubernetes Object Store Adapter
//!
//! Claims, daemon Deployments and prepare Jobs through the cluster API.
//! `409 Conflict` on create and `404 Not Found` on delete are successes.

use crate::deviceset::labels::Selector;
use crate::domain::ports::{ClaimStore, WorkloadStore};
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Debug;
use tracing::{debug, info};

/// Adapter over a live cluster
#[derive(Clone)]
pub struct KubeClusterAdapter {
    client: Client,
}

impl KubeClusterAdapter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn list_params(selector: &Selector) -> ListParams {
    ListParams::default().labels(&selector.to_string())
}

fn kind_of<K: Resource>() -> String
where
    <K as Resource>::DynamicType: Default,
{
    K::kind(&Default::default()).to_string()
}

/// Create a named object, returning the existing one on conflict
async fn create_named<K>(api: &Api<K>, object: &K) -> Result<K>
where
    K: Resource + Clone + Debug + Serialize + DeserializeOwned,
    <K as Resource>::DynamicType: Default,
{
    let name = object
        .meta()
        .name
        .clone()
        .ok_or_else(|| Error::Internal(format!("{} without a name", kind_of::<K>())))?;
    match api.create(&PostParams::default(), object).await {
        Ok(created) => {
            info!("Created {} {}", kind_of::<K>(), name);
            Ok(created)
        }
        Err(kube::Error::Api(ae)) if ae.code == 409 => {
            debug!("{} {} already exists", kind_of::<K>(), name);
            Ok(api.get(&name).await?)
        }
        Err(e) => Err(e.into()),
    }
}

/// Delete an object, returning false when it was already gone
async fn delete_named<K>(api: &Api<K>, name: &str, params: &DeleteParams) -> Result<bool>
where
    K: Resource + Clone + Debug + DeserializeOwned,
    <K as Resource>::DynamicType: Default,
{
    match api.delete(name, params).await {
        Ok(_) => {
            info!("Deleted {} {}", kind_of::<K>(), name);
            Ok(true)
        }
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
        Err(e) => Err(e.into()),
    }
}

// =============================================================================
// ClaimStore
// =============================================================================

#[async_trait]
impl ClaimStore for KubeClusterAdapter {
    async fn create_claim(
        &self,
        namespace: &str,
        claim: PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim> {
        let api: Api<PersistentVolumeClaim> = self.api(namespace);
        if claim.metadata.name.is_some() {
            return create_named(&api, &claim).await;
        }
        let created = api.create(&PostParams::default(), &claim).await?;
        info!(
            "Created claim {}/{}",
            namespace,
            created.metadata.name.as_deref().unwrap_or_default()
        );
        Ok(created)
    }

    async fn list_claims(
        &self,
        namespace: &str,
        selector: &Selector,
    ) -> Result<Vec<PersistentVolumeClaim>> {
        let api: Api<PersistentVolumeClaim> = self.api(namespace);
        Ok(api.list(&list_params(selector)).await?.items)
    }

    async fn patch_claim_labels(
        &self,
        namespace: &str,
        name: &str,
        labels: BTreeMap<String, String>,
    ) -> Result<PersistentVolumeClaim> {
        let api: Api<PersistentVolumeClaim> = self.api(namespace);
        let patch = serde_json::json!({ "metadata": { "labels": labels } });
        match api
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(claim) => Ok(claim),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Err(Error::ResourceNotFound {
                kind: "PersistentVolumeClaim".into(),
                name: name.into(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_claim(&self, namespace: &str, name: &str) -> Result<bool> {
        let api: Api<PersistentVolumeClaim> = self.api(namespace);
        delete_named(&api, name, &DeleteParams::default()).await
    }

    async fn storage_class_exists(&self, name: &str) -> Result<bool> {
        let api: Api<StorageClass> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?.is_some())
    }
}

// =============================================================================
// WorkloadStore
// =============================================================================

#[async_trait]
impl WorkloadStore for KubeClusterAdapter {
    async fn create_daemon(&self, namespace: &str, daemon: Deployment) -> Result<Deployment> {
        let api: Api<Deployment> = self.api(namespace);
        create_named(&api, &daemon).await
    }

    async fn list_daemons(&self, namespace: &str, selector: &Selector) -> Result<Vec<Deployment>> {
        let api: Api<Deployment> = self.api(namespace);
        Ok(api.list(&list_params(selector)).await?.items)
    }

    async fn delete_daemon(&self, namespace: &str, name: &str) -> Result<bool> {
        let api: Api<Deployment> = self.api(namespace);
        delete_named(&api, name, &DeleteParams::foreground()).await
    }

    async fn pin_daemon(
        &self,
        namespace: &str,
        name: &str,
        node_selector: BTreeMap<String, String>,
    ) -> Result<Deployment> {
        let api: Api<Deployment> = self.api(namespace);
        let patch = serde_json::json!({
            "spec": { "template": { "spec": { "nodeSelector": node_selector } } }
        });
        match api
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(daemon) => {
                info!("Pinned Deployment {}/{}", namespace, name);
                Ok(daemon)
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => Err(Error::ResourceNotFound {
                kind: "Deployment".into(),
                name: name.into(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_prepare_job(&self, namespace: &str, job: Job) -> Result<Job> {
        let api: Api<Job> = self.api(namespace);
        create_named(&api, &job).await
    }

    async fn list_prepare_jobs(&self, namespace: &str, selector: &Selector) -> Result<Vec<Job>> {
        let api: Api<Job> = self.api(namespace);
        Ok(api.list(&list_params(selector)).await?.items)
    }

    async fn delete_prepare_jobs(&self, namespace: &str, selector: &Selector) -> Result<usize> {
        let api: Api<Job> = self.api(namespace);
        let jobs = api.list(&list_params(selector)).await?.items;
        let mut removed = 0;
        // Background propagation also removes the job's pods
        for name in jobs.into_iter().filter_map(|j| j.metadata.name) {
            if delete_named(&api, &name, &DeleteParams::background()).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}
