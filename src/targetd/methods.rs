//! Typed targetd operations

use super::client::TargetdClient;
use super::types::{
    CreateExportParams, CreateVolumeParams, DestroyExportParams, DestroyVolumeParams, Export,
};
use crate::domain::ports::TargetdApi;
use crate::error::Result;
use async_trait::async_trait;

#[async_trait]
impl TargetdApi for TargetdClient {
    async fn create_volume(&self, pool: &str, name: &str, size: u64) -> Result<()> {
        self.invoke("vol_create", Some(&CreateVolumeParams { pool, name, size }))
            .await
    }

    async fn destroy_volume(&self, pool: &str, name: &str) -> Result<()> {
        self.invoke("vol_destroy", Some(&DestroyVolumeParams { pool, name }))
            .await
    }

    async fn list_exports(&self) -> Result<Vec<Export>> {
        // A daemon without exports may answer with a null result
        let exports: Option<Vec<Export>> = self.call::<(), _>("export_list", None).await?;
        Ok(exports.unwrap_or_default())
    }

    async fn create_export(&self, pool: &str, volume: &str, initiator: &str, lun: i32) -> Result<()> {
        let params = CreateExportParams {
            pool,
            vol: volume,
            initiator_wwn: initiator,
            lun,
        };
        self.invoke("export_create", Some(&params)).await
    }

    async fn destroy_export(&self, pool: &str, volume: &str, initiator: &str) -> Result<()> {
        let params = DestroyExportParams {
            pool,
            vol: volume,
            initiator_wwn: initiator,
        };
        self.invoke("export_destroy", Some(&params)).await
    }
}
