//! Provision controller
//!
//! Watches claims and volumes, asks the [`VolumeProvisioner`] to create
//! storage for unbound claims of our storage classes and to destroy storage
//! behind released volumes. Every event is handled on the single task that
//! runs [`ProvisionController::run`], so at most one provisioning talks to
//! the daemon at a time. Cluster objects are read and written through a
//! [`ClusterApi`].
//!
//! [`VolumeProvisioner`]: crate::domain::ports::VolumeProvisioner
//! [`ClusterApi`]: crate::domain::ports::ClusterApi

pub mod cluster;
pub mod leader;
pub mod retry;

#[cfg(test)]
pub(crate) mod mock;

pub use cluster::KubeCluster;
pub use leader::{LeaderElection, LeaseConfig};
pub use retry::RetryTracker;

use crate::config::Options;
use crate::domain::ports::{claim_key, ClusterApiRef, ProvisionOptions, VolumeProvisionerRef};
use crate::error::{Error, Result};
use crate::metrics::{Metrics, Outcome};
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{ObjectReference, PersistentVolume, PersistentVolumeClaim};
use kube::api::Api;
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Annotation naming the provisioner that created a volume
pub const ANNOTATION_PROVISIONED_BY: &str = "pv.kubernetes.io/provisioned-by";

/// Legacy claim annotation carrying the storage class name
pub const ANNOTATION_STORAGE_CLASS: &str = "volume.beta.kubernetes.io/storage-class";

const PHASE_RELEASED: &str = "Released";
const RECLAIM_DELETE: &str = "Delete";
const VOLUME_MODE_BLOCK: &str = "Block";

enum Work {
    Claim(PersistentVolumeClaim),
    Volume(PersistentVolume),
}

/// Object to look at again once its retry delay passed
#[derive(Debug)]
enum Requeue {
    Claim { namespace: String, name: String },
    Volume { name: String },
}

/// Drives a [`VolumeProvisioner`](crate::domain::ports::VolumeProvisioner)
/// from cluster state
pub struct ProvisionController {
    cluster: ClusterApiRef,
    provisioner: VolumeProvisionerRef,
    options: Arc<Options>,
    metrics: Arc<Metrics>,
    claim_retries: RetryTracker,
    volume_retries: RetryTracker,
    requeue_tx: mpsc::UnboundedSender<Requeue>,
    requeue_rx: Option<mpsc::UnboundedReceiver<Requeue>>,
}

impl ProvisionController {
    pub fn new(
        cluster: ClusterApiRef,
        provisioner: VolumeProvisionerRef,
        options: Arc<Options>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let controller = &options.controller;
        let claim_retries = RetryTracker::new(
            controller.failed_provision_threshold,
            controller.exponential_backoff,
        );
        let volume_retries = RetryTracker::new(
            controller.failed_delete_threshold,
            controller.exponential_backoff,
        );
        let (requeue_tx, requeue_rx) = mpsc::unbounded_channel();

        Self {
            cluster,
            provisioner,
            options,
            metrics,
            claim_retries,
            volume_retries,
            requeue_tx,
            requeue_rx: Some(requeue_rx),
        }
    }

    /// Watch claims and volumes through `client` until the streams end
    pub async fn run(mut self, client: Client) -> Result<()> {
        let mut requeue_rx = self
            .requeue_rx
            .take()
            .ok_or_else(|| Error::Internal("Controller already running".into()))?;

        let claims = watcher(
            Api::<PersistentVolumeClaim>::all(client.clone()),
            watcher::Config::default(),
        )
        .default_backoff()
        .applied_objects()
        .map_ok(Work::Claim)
        .boxed();
        let volumes = watcher(
            Api::<PersistentVolume>::all(client),
            watcher::Config::default(),
        )
        .default_backoff()
        .applied_objects()
        .map_ok(Work::Volume)
        .boxed();
        let mut events = futures::stream::select(claims, volumes);

        let mut resync = tokio::time::interval(self.options.controller.resync_period);
        // The watchers deliver the initial listing themselves
        resync.tick().await;

        info!(
            "Provision controller started for provisioner {}",
            self.options.provisioner_type
        );

        loop {
            tokio::select! {
                event = events.next() => match event {
                    Some(Ok(Work::Claim(claim))) => self.handle_claim(claim).await,
                    Some(Ok(Work::Volume(pv))) => self.handle_volume(pv).await,
                    Some(Err(e)) => warn!("Watch error: {}", e),
                    None => return Err(Error::Internal("Watch streams ended".into())),
                },
                Some(requeue) = requeue_rx.recv() => self.handle_requeue(requeue).await,
                _ = resync.tick() => self.resync().await,
            }
        }
    }

    async fn handle_claim(&mut self, claim: PersistentVolumeClaim) {
        if let Err(e) = self.sync_claim(claim).await {
            error!("Failed to sync claim: {}", e);
        }
    }

    async fn handle_volume(&mut self, pv: PersistentVolume) {
        if let Err(e) = self.sync_volume(pv).await {
            error!("Failed to sync volume: {}", e);
        }
    }

    async fn handle_requeue(&mut self, requeue: Requeue) {
        debug!("Requeue {:?}", requeue);
        let result = match requeue {
            Requeue::Claim { namespace, name } => {
                match self.cluster.get_claim(&namespace, &name).await {
                    Ok(Some(claim)) => self.sync_claim(claim).await,
                    Ok(None) => Ok(()),
                    Err(e) => Err(e),
                }
            }
            Requeue::Volume { name } => match self.cluster.get_volume(&name).await {
                Ok(Some(pv)) => self.sync_volume(pv).await,
                Ok(None) => Ok(()),
                Err(e) => Err(e),
            },
        };

        if let Err(e) = result {
            error!("Requeued sync failed: {}", e);
        }
    }

    /// Re-list every claim and volume
    async fn resync(&mut self) {
        debug!("Resyncing claims and volumes");

        match self.cluster.list_claims().await {
            Ok(claims) => {
                let live: HashSet<String> = claims.iter().map(claim_key).collect();
                self.claim_retries.retain(|key| live.contains(key));
                for claim in claims {
                    self.handle_claim(claim).await;
                }
            }
            Err(e) => warn!("Failed to list claims: {}", e),
        }

        match self.cluster.list_volumes().await {
            Ok(volumes) => {
                let live: HashSet<String> = volumes
                    .iter()
                    .filter_map(|pv| pv.metadata.name.clone())
                    .collect();
                self.volume_retries.retain(|key| live.contains(key));
                for pv in volumes {
                    self.handle_volume(pv).await;
                }
            }
            Err(e) => warn!("Failed to list volumes: {}", e),
        }
    }

    async fn sync_claim(&mut self, claim: PersistentVolumeClaim) -> Result<()> {
        if is_bound(&claim) || claim.metadata.deletion_timestamp.is_some() {
            return Ok(());
        }
        let Some(class_name) = claim_class(&claim) else {
            return Ok(());
        };
        let Some(uid) = claim.metadata.uid.clone() else {
            return Ok(());
        };

        let Some(storage_class) = self.cluster.get_storage_class(&class_name).await? else {
            debug!("Storage class {} not found", class_name);
            return Ok(());
        };
        if storage_class.provisioner != self.options.provisioner_type {
            return Ok(());
        }

        let key = claim_key(&claim);
        let pv_name = format!("pvc-{}", uid);
        if self.cluster.get_volume(&pv_name).await?.is_some() {
            self.claim_retries.record_success(&key);
            return Ok(());
        }

        let block = claim
            .spec
            .as_ref()
            .and_then(|s| s.volume_mode.as_deref())
            == Some(VOLUME_MODE_BLOCK);
        if block && !self.provisioner.supports_block() {
            warn!("Claim {} requests a block volume which is not supported", key);
            return Ok(());
        }

        let version = claim.metadata.resource_version.clone();
        if !self
            .claim_retries
            .should_attempt(&key, version.as_deref(), Instant::now())
        {
            debug!("Skipping claim {} until its retry is due", key);
            return Ok(());
        }

        info!("Provisioning volume {} for claim {}", pv_name, key);
        let _timer = self.metrics.start_timer("provision");

        let request = ProvisionOptions {
            pv_name: pv_name.clone(),
            pvc: claim.clone(),
            storage_class,
        };
        let result = match self.provisioner.provision(request.clone()).await {
            Ok(pv) => {
                let pv = bind_volume(pv, &claim, &class_name, &self.options.provisioner_type);
                self.create_volume_object(pv).await
            }
            Err(e @ Error::Export { .. }) => {
                // The retry creates the volume again, so nothing may be left behind
                if let Err(cleanup) = self.provisioner.compensate(&request).await {
                    error!("Failed to release partial volume {}: {}", pv_name, cleanup);
                }
                Err(e)
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                self.metrics.record_provision(Outcome::Success);
                self.claim_retries.record_success(&key);
                info!("Volume {} provisioned for claim {}", pv_name, key);
            }
            Err(e) => {
                self.metrics.record_provision(Outcome::Failure);
                let delay =
                    self.claim_retries
                        .record_failure(&key, version.as_deref(), &e, Instant::now());
                if e.is_transient() {
                    warn!("Transient failure provisioning claim {}: {}", key, e);
                } else {
                    error!("Failed to provision volume for claim {}: {}", key, e);
                }
                if self.claim_retries.exhausted(&key) {
                    warn!("Giving up on claim {} after repeated failures", key);
                }
                if let (Some(delay), Some(namespace), Some(name)) = (
                    delay,
                    claim.metadata.namespace.clone(),
                    claim.metadata.name.clone(),
                ) {
                    self.schedule(delay, Requeue::Claim { namespace, name });
                }
            }
        }

        Ok(())
    }

    /// Store the volume object, releasing the storage if that fails
    async fn create_volume_object(&self, pv: PersistentVolume) -> Result<()> {
        match self.cluster.create_volume(&pv).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(
                    "Failed to create volume object {}, cleaning up storage",
                    pv.metadata.name.as_deref().unwrap_or_default()
                );
                if let Err(cleanup) = self.provisioner.delete(&pv).await {
                    error!("Cleanup of unsaved volume failed: {}", cleanup);
                }
                Err(e)
            }
        }
    }

    async fn sync_volume(&mut self, pv: PersistentVolume) -> Result<()> {
        if !should_delete(&pv, &self.options.provisioner_type) {
            return Ok(());
        }
        let Some(name) = pv.metadata.name.clone() else {
            return Ok(());
        };

        let version = pv.metadata.resource_version.clone();
        if !self
            .volume_retries
            .should_attempt(&name, version.as_deref(), Instant::now())
        {
            debug!("Skipping volume {} until its retry is due", name);
            return Ok(());
        }

        info!("Deleting released volume {}", name);
        let _timer = self.metrics.start_timer("delete");

        let result = match self.provisioner.delete(&pv).await {
            Ok(()) => self.cluster.delete_volume(&name).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                self.metrics.record_deletion(Outcome::Success);
                self.volume_retries.record_success(&name);
                info!("Volume {} deleted", name);
            }
            Err(e) => {
                self.metrics.record_deletion(Outcome::Failure);
                let delay =
                    self.volume_retries
                        .record_failure(&name, version.as_deref(), &e, Instant::now());
                if e.is_transient() {
                    warn!("Transient failure deleting volume {}: {}", name, e);
                } else {
                    error!("Failed to delete volume {}: {}", name, e);
                }
                if self.volume_retries.exhausted(&name) {
                    warn!("Giving up on volume {} after repeated failures", name);
                }
                if let Some(delay) = delay {
                    self.schedule(delay, Requeue::Volume { name });
                }
            }
        }

        Ok(())
    }

    fn schedule(&self, delay: Duration, requeue: Requeue) {
        let tx = self.requeue_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(requeue);
        });
    }
}

/// Storage class requested by a claim; the legacy annotation wins
pub fn claim_class(claim: &PersistentVolumeClaim) -> Option<String> {
    claim
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(ANNOTATION_STORAGE_CLASS))
        .or_else(|| claim.spec.as_ref().and_then(|s| s.storage_class_name.as_ref()))
        .filter(|name| !name.is_empty())
        .cloned()
}

pub fn is_bound(claim: &PersistentVolumeClaim) -> bool {
    let volume_named = claim
        .spec
        .as_ref()
        .and_then(|s| s.volume_name.as_deref())
        .map_or(false, |name| !name.is_empty());
    let phase_bound = claim
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        == Some("Bound");
    volume_named || phase_bound
}

/// Released volume of ours whose storage should be destroyed
pub fn should_delete(pv: &PersistentVolume, provisioner_type: &str) -> bool {
    let ours = pv
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(ANNOTATION_PROVISIONED_BY))
        .map_or(false, |p| p == provisioner_type);
    let released = pv.status.as_ref().and_then(|s| s.phase.as_deref()) == Some(PHASE_RELEASED);
    let reclaim_delete = pv
        .spec
        .as_ref()
        .and_then(|s| s.persistent_volume_reclaim_policy.as_deref())
        == Some(RECLAIM_DELETE);

    ours && released && reclaim_delete && pv.metadata.deletion_timestamp.is_none()
}

/// Pre-bind a freshly provisioned volume to its claim
pub fn bind_volume(
    mut pv: PersistentVolume,
    claim: &PersistentVolumeClaim,
    class_name: &str,
    provisioner_type: &str,
) -> PersistentVolume {
    pv.metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(ANNOTATION_PROVISIONED_BY.to_string(), provisioner_type.to_string());

    let spec = pv.spec.get_or_insert_with(Default::default);
    spec.claim_ref = Some(ObjectReference {
        api_version: Some("v1".to_string()),
        kind: Some("PersistentVolumeClaim".to_string()),
        namespace: claim.metadata.namespace.clone(),
        name: claim.metadata.name.clone(),
        uid: claim.metadata.uid.clone(),
        resource_version: claim.metadata.resource_version.clone(),
        ..Default::default()
    });
    spec.storage_class_name = Some(class_name.to_string());

    pv
}

#[cfg(test)]
mod tests {
    use super::mock::FakeCluster;
    use super::*;
    use crate::domain::ports::VolumeProvisioner;
    use crate::provisioner::descriptor::{ANNOTATION_POOL, ANNOTATION_VOLUME};
    use crate::provisioner::fixtures::{claim, options, storage_class, PV_NAME};
    use crate::provisioner::TargetdProvisioner;
    use crate::targetd::mock::{Call, RecordingTargetd};
    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::{
        PersistentVolumeClaimStatus, PersistentVolumeSpec, PersistentVolumeStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn released(provisioned_by: &str, reclaim: &str) -> PersistentVolume {
        PersistentVolume {
            metadata: ObjectMeta {
                name: Some(PV_NAME.into()),
                annotations: Some(BTreeMap::from([
                    (ANNOTATION_PROVISIONED_BY.to_string(), provisioned_by.to_string()),
                    (ANNOTATION_VOLUME.to_string(), PV_NAME.to_string()),
                    (ANNOTATION_POOL.to_string(), "vg-targetd".to_string()),
                ])),
                ..Default::default()
            },
            spec: Some(PersistentVolumeSpec {
                persistent_volume_reclaim_policy: Some(reclaim.into()),
                ..Default::default()
            }),
            status: Some(PersistentVolumeStatus {
                phase: Some("Released".into()),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_claim_key_and_class() {
        let mut pvc = claim("1Gi", &["ReadWriteOnce"]);
        assert_eq!(claim_key(&pvc), "apps/data");
        assert_eq!(claim_class(&pvc).as_deref(), Some("targetd-iscsi"));

        pvc.metadata.annotations = Some(BTreeMap::from([(
            ANNOTATION_STORAGE_CLASS.to_string(),
            "legacy".to_string(),
        )]));
        assert_eq!(claim_class(&pvc).as_deref(), Some("legacy"));

        pvc.metadata.annotations = None;
        if let Some(spec) = pvc.spec.as_mut() {
            spec.storage_class_name = Some(String::new());
        }
        assert_eq!(claim_class(&pvc), None);
    }

    #[test]
    fn test_bound_claims_detected() {
        let mut pvc = claim("1Gi", &["ReadWriteOnce"]);
        assert!(!is_bound(&pvc));

        pvc.status = Some(PersistentVolumeClaimStatus {
            phase: Some("Bound".into()),
            ..Default::default()
        });
        assert!(is_bound(&pvc));

        let mut pvc = claim("1Gi", &["ReadWriteOnce"]);
        if let Some(spec) = pvc.spec.as_mut() {
            spec.volume_name = Some("pvc-other".into());
        }
        assert!(is_bound(&pvc));
    }

    #[test]
    fn test_should_delete_only_released_volumes_of_ours() {
        assert!(should_delete(&released("targetd", "Delete"), "targetd"));
        assert!(!should_delete(&released("targetd", "Retain"), "targetd"));
        assert!(!should_delete(&released("other", "Delete"), "targetd"));

        let mut bound = released("targetd", "Delete");
        bound.status = Some(PersistentVolumeStatus {
            phase: Some("Bound".into()),
            ..Default::default()
        });
        assert!(!should_delete(&bound, "targetd"));

        let mut terminating = released("targetd", "Delete");
        terminating.metadata.deletion_timestamp = Some(Time(Default::default()));
        assert!(!should_delete(&terminating, "targetd"));
    }

    #[test]
    fn test_bind_volume_references_claim() {
        let pvc = claim("1Gi", &["ReadWriteOnce"]);
        let pv = PersistentVolume {
            metadata: ObjectMeta {
                name: Some(PV_NAME.into()),
                annotations: Some(BTreeMap::from([(
                    ANNOTATION_VOLUME.to_string(),
                    PV_NAME.to_string(),
                )])),
                ..Default::default()
            },
            spec: Some(PersistentVolumeSpec::default()),
            ..Default::default()
        };

        let pv = bind_volume(pv, &pvc, "targetd-iscsi", "targetd");

        let annotations = pv.metadata.annotations.unwrap();
        assert_eq!(annotations[ANNOTATION_PROVISIONED_BY], "targetd");
        assert_eq!(annotations[ANNOTATION_VOLUME], PV_NAME);

        let spec = pv.spec.unwrap();
        assert_eq!(spec.storage_class_name.as_deref(), Some("targetd-iscsi"));
        let claim_ref = spec.claim_ref.unwrap();
        assert_eq!(claim_ref.kind.as_deref(), Some("PersistentVolumeClaim"));
        assert_eq!(claim_ref.namespace.as_deref(), Some("apps"));
        assert_eq!(claim_ref.name.as_deref(), Some("data"));
        assert_eq!(claim_ref.uid.as_deref(), Some("8a1c6f2e"));
    }

    // =========================================================================
    // Reconciliation against an in-memory cluster and daemon
    // =========================================================================

    const INITIATOR_A: &str = "iqn.2003-01.org.example:node-a";
    const INITIATOR_B: &str = "iqn.2003-01.org.example:node-b";

    fn controller(cluster: Arc<FakeCluster>, provisioner: VolumeProvisionerRef) -> ProvisionController {
        ProvisionController::new(cluster, provisioner, options(), Arc::new(Metrics::new().unwrap()))
    }

    fn targetd_controller(cluster: &Arc<FakeCluster>, targetd: &Arc<RecordingTargetd>) -> ProvisionController {
        let provisioner = Arc::new(TargetdProvisioner::new(targetd.clone(), options()));
        controller(cluster.clone(), provisioner)
    }

    fn cluster_with_initiators(initiators: &str) -> Arc<FakeCluster> {
        Arc::new(FakeCluster::new().with_class(storage_class(&[("initiators", initiators)])))
    }

    fn metrics_text(controller: &ProvisionController) -> String {
        String::from_utf8(controller.metrics.encode().unwrap().1).unwrap()
    }

    fn mark_released(mut pv: PersistentVolume) -> PersistentVolume {
        if let Some(spec) = pv.spec.as_mut() {
            spec.persistent_volume_reclaim_policy = Some("Delete".into());
        }
        pv.status = Some(PersistentVolumeStatus {
            phase: Some("Released".into()),
            ..Default::default()
        });
        pv
    }

    /// Counts provision calls and serves filesystem volumes only
    #[derive(Default)]
    struct FilesystemOnly {
        provisions: AtomicUsize,
    }

    #[async_trait]
    impl VolumeProvisioner for FilesystemOnly {
        async fn provision(&self, _options: ProvisionOptions) -> Result<PersistentVolume> {
            self.provisions.fetch_add(1, Ordering::SeqCst);
            Err(Error::Internal("no storage behind this provisioner".into()))
        }

        async fn delete(&self, _volume: &PersistentVolume) -> Result<()> {
            Ok(())
        }

        fn supports_block(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_claim_provisioned_and_bound() {
        let cluster = cluster_with_initiators(INITIATOR_A);
        let targetd = Arc::new(RecordingTargetd::new());
        let mut controller = targetd_controller(&cluster, &targetd);

        controller.sync_claim(claim("10Gi", &["ReadWriteOnce"])).await.unwrap();

        let pv = cluster.volume(PV_NAME).expect("volume object stored");
        assert_eq!(pv.metadata.annotations.unwrap()[ANNOTATION_PROVISIONED_BY], "targetd");
        let claim_ref = pv.spec.unwrap().claim_ref.unwrap();
        assert_eq!(claim_ref.namespace.as_deref(), Some("apps"));
        assert_eq!(claim_ref.name.as_deref(), Some("data"));
        assert!(targetd.has_volume("vg-targetd", PV_NAME));
        assert!(metrics_text(&controller).contains(r#"targetd_provisioner_provisions_total{outcome="success"} 1"#));
    }

    #[tokio::test]
    async fn test_claim_with_existing_volume_is_skipped() {
        let existing = PersistentVolume {
            metadata: ObjectMeta {
                name: Some(PV_NAME.into()),
                ..Default::default()
            },
            ..Default::default()
        };
        let cluster = Arc::new(
            FakeCluster::new()
                .with_class(storage_class(&[("initiators", INITIATOR_A)]))
                .with_volume(existing),
        );
        let targetd = Arc::new(RecordingTargetd::new());
        let mut controller = targetd_controller(&cluster, &targetd);

        controller.sync_claim(claim("10Gi", &["ReadWriteOnce"])).await.unwrap();

        assert!(targetd.calls().is_empty());
        assert!(!metrics_text(&controller).contains("targetd_provisioner_provisions_total{"));
    }

    #[tokio::test]
    async fn test_claim_of_other_provisioner_ignored() {
        let mut class = storage_class(&[("initiators", INITIATOR_A)]);
        class.provisioner = "example.com/nfs".into();
        let cluster = Arc::new(FakeCluster::new().with_class(class));
        let targetd = Arc::new(RecordingTargetd::new());
        let mut controller = targetd_controller(&cluster, &targetd);

        controller.sync_claim(claim("10Gi", &["ReadWriteOnce"])).await.unwrap();

        assert!(targetd.calls().is_empty());
        assert!(cluster.volume(PV_NAME).is_none());
    }

    #[tokio::test]
    async fn test_block_claim_needs_block_support() {
        let cluster = cluster_with_initiators(INITIATOR_A);
        let provisioner = Arc::new(FilesystemOnly::default());
        let mut controller = controller(cluster.clone(), provisioner.clone());

        let mut block = claim("10Gi", &["ReadWriteOnce"]);
        if let Some(spec) = block.spec.as_mut() {
            spec.volume_mode = Some("Block".into());
        }
        controller.sync_claim(block).await.unwrap();
        assert_eq!(provisioner.provisions.load(Ordering::SeqCst), 0);

        controller.sync_claim(claim("10Gi", &["ReadWriteOnce"])).await.unwrap();
        assert_eq!(provisioner.provisions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rejected_volume_object_releases_storage() {
        let cluster = Arc::new(
            FakeCluster::new()
                .with_class(storage_class(&[("initiators", INITIATOR_A)]))
                .reject_creates(),
        );
        let targetd = Arc::new(RecordingTargetd::new());
        let mut controller = targetd_controller(&cluster, &targetd);

        controller.sync_claim(claim("10Gi", &["ReadWriteOnce"])).await.unwrap();

        assert!(cluster.volume(PV_NAME).is_none());
        assert!(targetd.calls().contains(&Call::DestroyVolume {
            pool: "vg-targetd".into(),
            name: PV_NAME.into(),
        }));
        assert!(!targetd.has_volume("vg-targetd", PV_NAME));
        assert!(targetd.exports().is_empty());
        assert_eq!(controller.claim_retries.failures("apps/data"), 1);
        assert!(metrics_text(&controller).contains(r#"targetd_provisioner_provisions_total{outcome="failure"} 1"#));
    }

    #[tokio::test(start_paused = true)]
    async fn test_export_failure_released_before_retry() {
        let pvc = claim("10Gi", &["ReadWriteOnce"]);
        let cluster = cluster_with_initiators(&format!("{},{}", INITIATOR_A, INITIATOR_B));
        let targetd = Arc::new(RecordingTargetd::new().fail_once(Call::CreateExport {
            pool: "vg-targetd".into(),
            volume: PV_NAME.into(),
            initiator: INITIATOR_B.into(),
            lun: 0,
        }));
        let mut controller = targetd_controller(&cluster, &targetd);

        controller.sync_claim(pvc.clone()).await.unwrap();
        assert!(cluster.volume(PV_NAME).is_none());
        assert!(!targetd.has_volume("vg-targetd", PV_NAME));
        assert!(targetd.exports().is_empty());

        // Export failures wait a fixed delay
        controller.sync_claim(pvc.clone()).await.unwrap();
        assert!(cluster.volume(PV_NAME).is_none());

        tokio::time::advance(Duration::from_secs(30)).await;
        controller.sync_claim(pvc).await.unwrap();

        assert!(cluster.volume(PV_NAME).is_some());
        assert!(targetd.has_volume("vg-targetd", PV_NAME));
        assert_eq!(targetd.exports().len(), 2);
        assert_eq!(controller.claim_retries.failures("apps/data"), 0);
    }

    #[tokio::test]
    async fn test_released_volume_destroyed_then_removed() {
        let cluster = cluster_with_initiators(INITIATOR_A);
        let targetd = Arc::new(RecordingTargetd::new());
        let mut controller = targetd_controller(&cluster, &targetd);
        controller.sync_claim(claim("10Gi", &["ReadWriteOnce"])).await.unwrap();
        let pv = mark_released(cluster.volume(PV_NAME).unwrap());

        controller.sync_volume(pv).await.unwrap();

        assert_eq!(cluster.deleted(), vec![PV_NAME.to_string()]);
        assert!(cluster.volume(PV_NAME).is_none());
        assert!(!targetd.has_volume("vg-targetd", PV_NAME));
        assert!(targetd.exports().is_empty());
        assert!(metrics_text(&controller).contains(r#"targetd_provisioner_deletions_total{outcome="success"} 1"#));
    }

    #[tokio::test]
    async fn test_destroy_failure_keeps_volume_object() {
        let cluster = cluster_with_initiators(INITIATOR_A);
        let targetd = Arc::new(RecordingTargetd::new().fail(Call::DestroyVolume {
            pool: "vg-targetd".into(),
            name: PV_NAME.into(),
        }));
        let mut controller = targetd_controller(&cluster, &targetd);
        controller.sync_claim(claim("10Gi", &["ReadWriteOnce"])).await.unwrap();
        let pv = mark_released(cluster.volume(PV_NAME).unwrap());

        controller.sync_volume(pv).await.unwrap();

        assert!(cluster.deleted().is_empty());
        assert!(cluster.volume(PV_NAME).is_some());
        assert_eq!(controller.volume_retries.failures(PV_NAME), 1);
        assert!(metrics_text(&controller).contains(r#"targetd_provisioner_deletions_total{outcome="failure"} 1"#));
    }

    #[tokio::test]
    async fn test_volume_object_already_gone_counts_as_deleted() {
        let cluster = Arc::new(FakeCluster::new());
        let targetd = Arc::new(RecordingTargetd::new());
        let mut controller = targetd_controller(&cluster, &targetd);

        controller.sync_volume(released("targetd", "Delete")).await.unwrap();

        assert_eq!(
            targetd.calls(),
            vec![Call::DestroyVolume {
                pool: "vg-targetd".into(),
                name: PV_NAME.into(),
            }]
        );
        assert_eq!(cluster.deleted(), vec![PV_NAME.to_string()]);
        assert_eq!(controller.volume_retries.failures(PV_NAME), 0);
    }

    #[tokio::test]
    async fn test_volume_of_other_provisioner_ignored() {
        let cluster = Arc::new(FakeCluster::new());
        let targetd = Arc::new(RecordingTargetd::new());
        let mut controller = targetd_controller(&cluster, &targetd);

        controller.sync_volume(released("example.com/nfs", "Delete")).await.unwrap();

        assert!(targetd.calls().is_empty());
        assert!(cluster.deleted().is_empty());
    }
}
