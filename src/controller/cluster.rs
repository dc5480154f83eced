//! Cluster access through the Kubernetes API

use crate::domain::ports::ClusterApi;
use crate::error::Result;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::Client;

/// [`ClusterApi`] backed by a `kube` client
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn volumes(&self) -> Api<PersistentVolume> {
        Api::all(self.client.clone())
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn get_claim(&self, namespace: &str, name: &str) -> Result<Option<PersistentVolumeClaim>> {
        let claims = Api::<PersistentVolumeClaim>::namespaced(self.client.clone(), namespace);
        Ok(claims.get_opt(name).await?)
    }

    async fn list_claims(&self) -> Result<Vec<PersistentVolumeClaim>> {
        let claims = Api::<PersistentVolumeClaim>::all(self.client.clone());
        Ok(claims.list(&ListParams::default()).await?.items)
    }

    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClass>> {
        let classes = Api::<StorageClass>::all(self.client.clone());
        Ok(classes.get_opt(name).await?)
    }

    async fn get_volume(&self, name: &str) -> Result<Option<PersistentVolume>> {
        Ok(self.volumes().get_opt(name).await?)
    }

    async fn list_volumes(&self) -> Result<Vec<PersistentVolume>> {
        Ok(self.volumes().list(&ListParams::default()).await?.items)
    }

    async fn create_volume(&self, volume: &PersistentVolume) -> Result<()> {
        self.volumes().create(&PostParams::default(), volume).await?;
        Ok(())
    }

    async fn delete_volume(&self, name: &str) -> Result<()> {
        ignore_not_found(self.volumes().delete(name, &DeleteParams::default()).await)?;
        Ok(())
    }
}

/// Turn a 404 from the API server into `None`
pub fn ignore_not_found<T>(result: kube::Result<T>) -> kube::Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(kube::Error::Api(response)) if response.code == 404 => Ok(None),
        Err(e) => Err(e),
    }
}
