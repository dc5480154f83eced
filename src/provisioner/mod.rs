//! targetd Provisioner
//!
//! Provision and Delete against the targetd daemon:
//! - Provision: resolve parameters, pick a LUN, create the volume, export
//!   it to each initiator, describe it as a `PersistentVolume`
//! - Delete: tear down every recorded export (best effort), then the volume
//!
//! Provision itself rolls nothing back when a step fails part way. The
//! controller calls [`VolumeProvisioner::compensate`] after an export
//! failure, which tears down the exports the daemon reports for the volume
//! and then the volume.

pub mod descriptor;
pub mod lun;
pub mod params;

#[cfg(test)]
pub(crate) mod fixtures;

pub use descriptor::{build_volume, RecoveryState};
pub use lun::{first_free_lun, next_lun};
pub use params::{resolve, ParameterOverrides, VolumeSpec};

use crate::config::Options;
use crate::domain::ports::{claim_key, ProvisionOptions, TargetdApiRef, VolumeProvisioner};
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Access modes an iSCSI volume can honour
pub const SUPPORTED_ACCESS_MODES: [&str; 2] = ["ReadWriteOnce", "ReadOnlyMany"];

/// Provisioner backed by a targetd daemon
pub struct TargetdProvisioner {
    targetd: TargetdApiRef,
    options: Arc<Options>,
}

impl TargetdProvisioner {
    pub fn new(targetd: TargetdApiRef, options: Arc<Options>) -> Self {
        Self { targetd, options }
    }

    fn check_access_modes(pvc: &PersistentVolumeClaim) -> Result<()> {
        let requested = pvc
            .spec
            .as_ref()
            .and_then(|spec| spec.access_modes.clone())
            .unwrap_or_default();

        if requested
            .iter()
            .all(|mode| SUPPORTED_ACCESS_MODES.contains(&mode.as_str()))
        {
            return Ok(());
        }

        error!("Unsupported volume access modes specified: {:?}", requested);
        Err(Error::Validation(format!(
            "access modes must be a subset of {:?}",
            SUPPORTED_ACCESS_MODES
        )))
    }

    /// Destroy the exports of `state` (best effort), then its volume
    async fn teardown(&self, state: &RecoveryState) -> Result<()> {
        for initiator in &state.initiators {
            if let Err(e) = self
                .targetd
                .destroy_export(&state.pool, &state.volume, initiator)
                .await
            {
                warn!(
                    "Failed to destroy volume {} export from pool {} for initiator {}: {}",
                    state.volume, state.pool, initiator, e
                );
            }
        }

        self.targetd
            .destroy_volume(&state.pool, &state.volume)
            .await
            .map_err(|e| {
                error!("Failed to destroy volume {}: {}", state.volume, e);
                Error::VolumeDestroy {
                    volume: state.volume.clone(),
                    reason: e.to_string(),
                }
            })
    }
}

#[async_trait]
impl VolumeProvisioner for TargetdProvisioner {
    async fn provision(&self, request: ProvisionOptions) -> Result<PersistentVolume> {
        Self::check_access_modes(&request.pvc)?;

        let spec = resolve(&self.options, &request)?;
        info!(
            "Received provisioning request from claim {} for volume {} size {}",
            claim_key(&request.pvc),
            spec.volume,
            spec.capacity
        );
        let size = spec.capacity.to_daemon_size()?;

        let lun = next_lun(self.targetd.as_ref()).await.map_err(|e| {
            error!("Failed to select viable LUN for volume {}: {}", spec.volume, e);
            Error::LunAllocation(e.to_string())
        })?;
        debug!("Selected LUN {} for volume {}", lun, spec.volume);

        self.targetd
            .create_volume(&spec.pool, &spec.volume, size)
            .await
            .map_err(|e| {
                error!("Failed to create storage asset for volume {}: {}", spec.volume, e);
                Error::StorageAsset {
                    volume: spec.volume.clone(),
                    reason: e.to_string(),
                }
            })?;

        for initiator in &spec.initiators {
            self.targetd
                .create_export(&spec.pool, &spec.volume, initiator, lun)
                .await
                .map_err(|e| {
                    error!(
                        "Failed to export volume {} from pool {} for initiator {}: {}",
                        spec.volume, spec.pool, initiator, e
                    );
                    Error::Export {
                        volume: spec.volume.clone(),
                        initiator: initiator.clone(),
                        reason: e.to_string(),
                    }
                })?;
        }

        info!("Volume {} successfully provisioned", spec.volume);
        Ok(build_volume(&spec, lun, &request))
    }

    async fn delete(&self, volume: &PersistentVolume) -> Result<()> {
        let state = RecoveryState::from_volume(volume)?;
        let claim = volume
            .spec
            .as_ref()
            .and_then(|spec| spec.claim_ref.as_ref())
            .map(|r| {
                format!(
                    "{}/{}",
                    r.namespace.as_deref().unwrap_or_default(),
                    r.name.as_deref().unwrap_or_default()
                )
            })
            .unwrap_or_else(|| "<unbound>".to_string());
        info!(
            "Received deletion request from claim {} for volume {}",
            claim, state.volume
        );

        self.teardown(&state).await?;

        info!("Volume {} destroyed", state.volume);
        Ok(())
    }

    async fn compensate(&self, request: &ProvisionOptions) -> Result<()> {
        let spec = resolve(&self.options, request)?;

        // Only the exports that made it onto the daemon
        let initiators = self
            .targetd
            .list_exports()
            .await?
            .into_iter()
            .filter(|e| e.pool == spec.pool && e.vol_name == spec.volume)
            .map(|e| e.initiator_wwn)
            .collect();
        let state = RecoveryState {
            initiators,
            ..RecoveryState::from_spec(&spec)
        };

        warn!(
            "Releasing partially provisioned volume {} with {} export(s)",
            state.volume,
            state.initiators.len()
        );
        self.teardown(&state).await
    }

    fn supports_block(&self) -> bool {
        true
    }
}
