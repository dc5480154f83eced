//! Claim and storage class builders shared by the provisioner tests

use crate::config::Options;
use crate::domain::ports::ProvisionOptions;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::api::storage::v1::StorageClass;
use serde_json::{json, Map, Value};
use std::sync::Arc;

pub(crate) const PV_NAME: &str = "pvc-8a1c6f2e";
pub(crate) const PORTAL: &str = "192.168.10.4:3260";
pub(crate) const TARGET_IQN: &str = "iqn.2003-01.org.linux-iscsi.storage:targetd";

pub(crate) fn options() -> Arc<Options> {
    let mut options = Options::default();
    options.targetd.address = "targetd.storage.svc".into();
    Arc::new(options)
}

pub(crate) fn claim(capacity: &str, access_modes: &[&str]) -> PersistentVolumeClaim {
    serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "PersistentVolumeClaim",
        "metadata": {"name": "data", "namespace": "apps", "uid": "8a1c6f2e"},
        "spec": {
            "accessModes": access_modes,
            "storageClassName": "targetd-iscsi",
            "volumeMode": "Filesystem",
            "resources": {"requests": {"storage": capacity}}
        }
    }))
    .unwrap()
}

/// Class with a target portal and IQN plus `extra`
pub(crate) fn storage_class(extra: &[(&str, &str)]) -> StorageClass {
    let mut parameters = Map::new();
    parameters.insert("targetPortal".into(), Value::from(PORTAL));
    parameters.insert("iqn".into(), Value::from(TARGET_IQN));
    for (key, value) in extra {
        parameters.insert(key.to_string(), Value::from(*value));
    }

    serde_json::from_value(json!({
        "apiVersion": "storage.k8s.io/v1",
        "kind": "StorageClass",
        "metadata": {"name": "targetd-iscsi"},
        "provisioner": "targetd",
        "reclaimPolicy": "Retain",
        "parameters": parameters
    }))
    .unwrap()
}

pub(crate) fn request(extra: &[(&str, &str)]) -> ProvisionOptions {
    request_with_claim(claim("10Gi", &["ReadWriteOnce"]), extra)
}

pub(crate) fn request_with_claim(pvc: PersistentVolumeClaim, extra: &[(&str, &str)]) -> ProvisionOptions {
    ProvisionOptions {
        pv_name: PV_NAME.into(),
        pvc,
        storage_class: storage_class(extra),
    }
}
