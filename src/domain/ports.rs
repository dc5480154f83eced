//! Domain Ports - Core trait definitions for the provisioner
//!
//! These traits define the boundaries between the provisioning logic and
//! external systems. The targetd client implements [`TargetdApi`], the
//! provisioner implements [`VolumeProvisioner`] for the controller loop and
//! the controller reads and writes cluster objects through [`ClusterApi`].

use crate::error::Result;
use crate::targetd::Export;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use k8s_openapi::api::storage::v1::StorageClass;
use std::sync::Arc;

// =============================================================================
// Provisioning Request
// =============================================================================

/// Everything known about a claim that needs a volume
#[derive(Debug, Clone)]
pub struct ProvisionOptions {
    /// Name the new volume must have
    pub pv_name: String,
    /// Claim being satisfied
    pub pvc: PersistentVolumeClaim,
    /// Class the claim asked for
    pub storage_class: StorageClass,
}

/// `namespace/name` of a claim
pub fn claim_key(pvc: &PersistentVolumeClaim) -> String {
    format!(
        "{}/{}",
        pvc.metadata.namespace.as_deref().unwrap_or_default(),
        pvc.metadata.name.as_deref().unwrap_or_default()
    )
}

// =============================================================================
// targetd Port
// =============================================================================

/// Port for the storage daemon's volume and export operations
#[async_trait]
pub trait TargetdApi: Send + Sync {
    /// Create a volume of `size` bytes in `pool`
    async fn create_volume(&self, pool: &str, name: &str, size: u64) -> Result<()>;

    /// Destroy a volume
    async fn destroy_volume(&self, pool: &str, name: &str) -> Result<()>;

    /// List every export the daemon knows, in daemon order
    async fn list_exports(&self) -> Result<Vec<Export>>;

    /// Export a volume to an initiator at `lun`
    async fn create_export(&self, pool: &str, volume: &str, initiator: &str, lun: i32) -> Result<()>;

    /// Remove a volume's export for an initiator
    async fn destroy_export(&self, pool: &str, volume: &str, initiator: &str) -> Result<()>;
}

// =============================================================================
// Provisioner Port
// =============================================================================

/// Port the controller loop drives
#[async_trait]
pub trait VolumeProvisioner: Send + Sync {
    /// Create backing storage for a claim and describe it as a volume
    async fn provision(&self, options: ProvisionOptions) -> Result<PersistentVolume>;

    /// Tear down the storage behind a volume this provisioner created
    async fn delete(&self, volume: &PersistentVolume) -> Result<()>;

    /// Release whatever a failed `provision` of `options` left behind
    async fn compensate(&self, _options: &ProvisionOptions) -> Result<()> {
        Ok(())
    }

    /// Whether raw block claims can be served
    fn supports_block(&self) -> bool;
}

// =============================================================================
// Cluster Port
// =============================================================================

/// Port for the cluster objects the controller loop reads and writes
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get_claim(&self, namespace: &str, name: &str) -> Result<Option<PersistentVolumeClaim>>;

    async fn list_claims(&self) -> Result<Vec<PersistentVolumeClaim>>;

    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClass>>;

    async fn get_volume(&self, name: &str) -> Result<Option<PersistentVolume>>;

    async fn list_volumes(&self) -> Result<Vec<PersistentVolume>>;

    async fn create_volume(&self, volume: &PersistentVolume) -> Result<()>;

    /// Remove a volume object; one that is already gone counts as removed
    async fn delete_volume(&self, name: &str) -> Result<()>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type TargetdApiRef = Arc<dyn TargetdApi>;
pub type VolumeProvisionerRef = Arc<dyn VolumeProvisioner>;
pub type ClusterApiRef = Arc<dyn ClusterApi>;
