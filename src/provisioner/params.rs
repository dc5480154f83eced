//! Storage class parameter resolution
//!
//! A [`VolumeSpec`] starts from the process defaults and the claim, then the
//! class parameters are merged over it field by field. Keys the provisioner
//! does not know are ignored.

use crate::config::Options;
use crate::domain::ports::ProvisionOptions;
use crate::error::{Error, Result};
use crate::quantity::Capacity;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, SecretReference};
use std::collections::BTreeMap;
use tracing::debug;

pub const PARAM_CHAP_AUTH_DISCOVERY: &str = "chapAuthDiscovery";
pub const PARAM_CHAP_AUTH_SESSION: &str = "chapAuthSession";
pub const PARAM_FS_TYPE: &str = "fsType";
pub const PARAM_INITIATORS: &str = "initiators";
pub const PARAM_IQN: &str = "iqn";
pub const PARAM_ISCSI_INTERFACE: &str = "iscsiInterface";
pub const PARAM_READ_ONLY: &str = "readonly";
pub const PARAM_TARGET_PORTAL: &str = "targetPortal";
pub const PARAM_POOL: &str = "pool";
pub const PARAM_PORTALS: &str = "portals";

const STORAGE_RESOURCE: &str = "storage";

// =============================================================================
// Volume Spec
// =============================================================================

/// Complete description of the volume and exports for one claim
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeSpec {
    pub pool: String,
    pub volume: String,
    pub capacity: Capacity,
    pub fs_type: String,
    pub read_only: bool,
    pub discovery_chap_auth: bool,
    pub session_chap_auth: bool,
    pub target_portal: String,
    pub portals: Vec<String>,
    pub iqn: String,
    pub iscsi_interface: String,
    pub initiators: Vec<String>,
    pub secret_ref: Option<SecretReference>,
}

impl VolumeSpec {
    /// Spec with only process defaults and the claim applied
    pub fn with_defaults(options: &Options, volume: &str, capacity: Capacity) -> Self {
        Self {
            pool: options.default_pool.clone(),
            volume: volume.to_string(),
            capacity,
            fs_type: options.default_fs.clone(),
            read_only: false,
            discovery_chap_auth: false,
            session_chap_auth: false,
            target_portal: String::new(),
            portals: Vec::new(),
            iqn: String::new(),
            iscsi_interface: String::new(),
            initiators: Vec::new(),
            secret_ref: None,
        }
    }

    /// Replace every field the overrides set
    pub fn apply(mut self, overrides: ParameterOverrides) -> Self {
        if let Some(v) = overrides.discovery_chap_auth {
            self.discovery_chap_auth = v;
        }
        if let Some(v) = overrides.session_chap_auth {
            self.session_chap_auth = v;
        }
        if let Some(v) = overrides.fs_type {
            self.fs_type = v;
        }
        if let Some(v) = overrides.initiators {
            self.initiators = v;
        }
        if let Some(v) = overrides.iqn {
            self.iqn = v;
        }
        if let Some(v) = overrides.iscsi_interface {
            self.iscsi_interface = v;
        }
        if let Some(v) = overrides.read_only {
            self.read_only = v;
        }
        if let Some(v) = overrides.target_portal {
            self.target_portal = v;
        }
        if let Some(v) = overrides.pool {
            self.pool = v;
        }
        if let Some(v) = overrides.portals {
            self.portals = v;
        }
        self
    }

    pub fn chap_enabled(&self) -> bool {
        self.discovery_chap_auth || self.session_chap_auth
    }

    fn validate(&self) -> Result<()> {
        let required = [
            (PARAM_TARGET_PORTAL, &self.target_portal),
            (PARAM_IQN, &self.iqn),
        ];
        for (key, value) in required {
            if value.is_empty() {
                return Err(Error::InvalidParameter {
                    key: key.to_string(),
                    value: value.clone(),
                });
            }
        }
        Ok(())
    }
}

// =============================================================================
// Overrides
// =============================================================================

/// Storage class parameters, one optional value per recognised key
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterOverrides {
    pub discovery_chap_auth: Option<bool>,
    pub session_chap_auth: Option<bool>,
    pub fs_type: Option<String>,
    pub initiators: Option<Vec<String>>,
    pub iqn: Option<String>,
    pub iscsi_interface: Option<String>,
    pub read_only: Option<bool>,
    pub target_portal: Option<String>,
    pub pool: Option<String>,
    pub portals: Option<Vec<String>>,
}

impl ParameterOverrides {
    pub fn from_parameters(parameters: &BTreeMap<String, String>) -> Result<Self> {
        let mut overrides = Self::default();

        for (key, value) in parameters {
            match key.as_str() {
                PARAM_CHAP_AUTH_DISCOVERY => overrides.discovery_chap_auth = Some(parse_bool(key, value)?),
                PARAM_CHAP_AUTH_SESSION => overrides.session_chap_auth = Some(parse_bool(key, value)?),
                PARAM_FS_TYPE => overrides.fs_type = Some(value.clone()),
                PARAM_INITIATORS => overrides.initiators = Some(split_list(value)),
                PARAM_IQN => overrides.iqn = Some(value.clone()),
                PARAM_ISCSI_INTERFACE => overrides.iscsi_interface = Some(value.clone()),
                PARAM_READ_ONLY => overrides.read_only = Some(parse_bool(key, value)?),
                PARAM_TARGET_PORTAL => overrides.target_portal = Some(value.clone()),
                PARAM_POOL => overrides.pool = Some(value.clone()),
                PARAM_PORTALS => overrides.portals = Some(split_list(value)),
                _ => debug!("Ignoring unknown storage class parameter {}", key),
            }
        }

        Ok(overrides)
    }
}

/// Accepts the same spellings as Go's `strconv.ParseBool`
fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Ok(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Ok(false),
        _ => Err(Error::InvalidParameter {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

/// Split a comma separated list, dropping blank entries
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// =============================================================================
// Resolution
// =============================================================================

/// Capacity the claim requests
pub fn requested_capacity(pvc: &PersistentVolumeClaim) -> Result<Capacity> {
    let quantity = pvc
        .spec
        .as_ref()
        .and_then(|spec| spec.resources.as_ref())
        .and_then(|resources| resources.requests.as_ref())
        .and_then(|requests| requests.get(STORAGE_RESOURCE))
        .ok_or_else(|| Error::Validation("claim does not request storage capacity".into()))?;

    Capacity::try_from(quantity)
}

/// Turn a provisioning request into a complete volume spec
pub fn resolve(options: &Options, request: &ProvisionOptions) -> Result<VolumeSpec> {
    let capacity = requested_capacity(&request.pvc)?;

    let overrides = match &request.storage_class.parameters {
        Some(parameters) => ParameterOverrides::from_parameters(parameters)?,
        None => ParameterOverrides::default(),
    };

    let mut spec = VolumeSpec::with_defaults(options, &request.pv_name, capacity).apply(overrides);
    if spec.chap_enabled() {
        spec.secret_ref = Some(SecretReference {
            name: Some(options.chap_secret_name()),
            namespace: None,
        });
    }

    spec.validate()?;
    Ok(spec)
}
