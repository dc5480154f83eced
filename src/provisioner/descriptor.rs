//! Volume descriptor and recovery state
//!
//! The `PersistentVolume` handed back to the controller is the only state
//! the provisioner keeps. Its annotations record what Delete needs.

use super::params::{split_list, VolumeSpec};
use crate::domain::ports::ProvisionOptions;
use crate::error::{Error, Result};
use k8s_openapi::api::core::v1::{ISCSIPersistentVolumeSource, PersistentVolume, PersistentVolumeSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;

pub const ANNOTATION_VOLUME: &str = "volume";
pub const ANNOTATION_POOL: &str = "pool";
pub const ANNOTATION_INITIATORS: &str = "initiators";

const DEFAULT_RECLAIM_POLICY: &str = "Delete";

/// What Delete needs to undo a provisioning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryState {
    pub volume: String,
    pub pool: String,
    pub initiators: Vec<String>,
}

impl RecoveryState {
    pub fn from_spec(spec: &VolumeSpec) -> Self {
        Self {
            volume: spec.volume.clone(),
            pool: spec.pool.clone(),
            initiators: spec.initiators.clone(),
        }
    }

    pub fn to_annotations(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (ANNOTATION_VOLUME.to_string(), self.volume.clone()),
            (ANNOTATION_POOL.to_string(), self.pool.clone()),
            (ANNOTATION_INITIATORS.to_string(), self.initiators.join(",")),
        ])
    }

    /// Read the recovery state back from a volume's annotations
    pub fn from_volume(pv: &PersistentVolume) -> Result<Self> {
        let annotations = pv.metadata.annotations.clone().unwrap_or_default();
        let missing = |key: &str| Error::MissingRecoveryState {
            volume: pv.metadata.name.clone().unwrap_or_default(),
            key: key.to_string(),
        };

        let volume = annotations
            .get(ANNOTATION_VOLUME)
            .cloned()
            .ok_or_else(|| missing(ANNOTATION_VOLUME))?;
        let pool = annotations
            .get(ANNOTATION_POOL)
            .cloned()
            .ok_or_else(|| missing(ANNOTATION_POOL))?;
        let initiators = annotations
            .get(ANNOTATION_INITIATORS)
            .map(|list| split_list(list))
            .unwrap_or_default();

        Ok(Self {
            volume,
            pool,
            initiators,
        })
    }
}

/// Describe a provisioned volume as a `PersistentVolume`
pub fn build_volume(spec: &VolumeSpec, lun: i32, request: &ProvisionOptions) -> PersistentVolume {
    let claim = request.pvc.spec.as_ref();
    let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());

    let iscsi = ISCSIPersistentVolumeSource {
        target_portal: spec.target_portal.clone(),
        portals: (!spec.portals.is_empty()).then(|| spec.portals.clone()),
        iqn: spec.iqn.clone(),
        iscsi_interface: non_empty(&spec.iscsi_interface),
        lun,
        read_only: Some(spec.read_only),
        fs_type: non_empty(&spec.fs_type),
        chap_auth_discovery: Some(spec.discovery_chap_auth),
        chap_auth_session: Some(spec.session_chap_auth),
        secret_ref: spec.secret_ref.clone(),
        ..Default::default()
    };

    let reclaim_policy = request
        .storage_class
        .reclaim_policy
        .clone()
        .unwrap_or_else(|| DEFAULT_RECLAIM_POLICY.to_string());

    PersistentVolume {
        metadata: ObjectMeta {
            name: Some(spec.volume.clone()),
            annotations: Some(RecoveryState::from_spec(spec).to_annotations()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeSpec {
            access_modes: claim.and_then(|c| c.access_modes.clone()),
            volume_mode: claim.and_then(|c| c.volume_mode.clone()),
            persistent_volume_reclaim_policy: Some(reclaim_policy),
            capacity: Some(BTreeMap::from([(
                "storage".to_string(),
                spec.capacity.to_quantity(),
            )])),
            iscsi: Some(iscsi),
            ..Default::default()
        }),
        ..Default::default()
    }
}
