//! In-memory cluster for controller tests

use crate::domain::ports::{claim_key, ClusterApi};
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use k8s_openapi::api::storage::v1::StorageClass;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Claims, classes and volumes kept in maps keyed like the API server keys them
#[derive(Debug, Default)]
pub(crate) struct FakeCluster {
    claims: Mutex<BTreeMap<String, PersistentVolumeClaim>>,
    classes: Mutex<BTreeMap<String, StorageClass>>,
    volumes: Mutex<BTreeMap<String, PersistentVolume>>,
    reject_creates: Mutex<bool>,
    deleted: Mutex<Vec<String>>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_class(self, class: StorageClass) -> Self {
        let name = class.metadata.name.clone().unwrap_or_default();
        self.classes.lock().unwrap().insert(name, class);
        self
    }

    pub fn with_claim(self, claim: PersistentVolumeClaim) -> Self {
        self.claims.lock().unwrap().insert(claim_key(&claim), claim);
        self
    }

    pub fn with_volume(self, volume: PersistentVolume) -> Self {
        let name = volume.metadata.name.clone().unwrap_or_default();
        self.volumes.lock().unwrap().insert(name, volume);
        self
    }

    /// Make every volume create fail like a rejected API request
    pub fn reject_creates(self) -> Self {
        *self.reject_creates.lock().unwrap() = true;
        self
    }

    pub fn volume(&self, name: &str) -> Option<PersistentVolume> {
        self.volumes.lock().unwrap().get(name).cloned()
    }

    /// Names passed to `delete_volume`, in order
    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn get_claim(&self, namespace: &str, name: &str) -> Result<Option<PersistentVolumeClaim>> {
        let key = format!("{}/{}", namespace, name);
        Ok(self.claims.lock().unwrap().get(&key).cloned())
    }

    async fn list_claims(&self) -> Result<Vec<PersistentVolumeClaim>> {
        Ok(self.claims.lock().unwrap().values().cloned().collect())
    }

    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClass>> {
        Ok(self.classes.lock().unwrap().get(name).cloned())
    }

    async fn get_volume(&self, name: &str) -> Result<Option<PersistentVolume>> {
        Ok(self.volume(name))
    }

    async fn list_volumes(&self) -> Result<Vec<PersistentVolume>> {
        Ok(self.volumes.lock().unwrap().values().cloned().collect())
    }

    async fn create_volume(&self, volume: &PersistentVolume) -> Result<()> {
        let name = volume.metadata.name.clone().unwrap_or_default();
        if *self.reject_creates.lock().unwrap() {
            return Err(Error::Internal(format!("volume {} rejected by admission", name)));
        }
        let mut volumes = self.volumes.lock().unwrap();
        if volumes.contains_key(&name) {
            return Err(Error::Internal(format!("volume {} already exists", name)));
        }
        volumes.insert(name, volume.clone());
        Ok(())
    }

    async fn delete_volume(&self, name: &str) -> Result<()> {
        self.deleted.lock().unwrap().push(name.to_string());
        self.volumes.lock().unwrap().remove(name);
        Ok(())
    }
}
