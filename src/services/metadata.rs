use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::api::ApiClient;
use crate::error::{Error, Result};
use crate::models::{DeviceMetadata, DeviceSummary, UserInfo};

/// Caller-owned cache for the organisation id of the configured user.
#[derive(Debug)]
pub struct OrgIdCache {
    ttl: Duration,
    entry: Mutex<Option<(String, Instant)>>,
}

impl Default for OrgIdCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(15 * 60))
    }
}

impl OrgIdCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entry: Mutex::new(None),
        }
    }

    pub fn get(&self) -> Option<String> {
        let guard = self.entry.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard
            .as_ref()
            .filter(|(_, stored_at)| stored_at.elapsed() < self.ttl)
            .map(|(id, _)| id.clone())
    }

    pub fn set(&self, org_id: impl Into<String>) {
        let mut guard = self.entry.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Some((org_id.into(), Instant::now()));
    }

    pub fn invalidate(&self) {
        let mut guard = self.entry.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = None;
    }
}

#[derive(Clone)]
pub struct MetadataClient {
    api: ApiClient,
}

impl MetadataClient {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }

    pub async fn get_user_info(&self, on_prem: bool) -> Result<UserInfo> {
        let url = self.api.endpoint(on_prem, &["api", "metaData", "user"])?;
        Ok(self.api.get_data("user_info", url).await?.data)
    }

    pub async fn get_device_details(&self, on_prem: bool) -> Result<Vec<DeviceSummary>> {
        let url = self.api.endpoint(on_prem, &["api", "metaData", "allDevices"])?;
        Ok(self.api.get_data("device_details", url).await?.data)
    }

    /// NotFound unless `device_id` is in the caller's device list.
    pub async fn ensure_device_listed(&self, device_id: &str, on_prem: bool) -> Result<()> {
        let devices = self.get_device_details(on_prem).await?;
        if devices.iter().any(|device| device.dev_id.trim() == device_id) {
            Ok(())
        } else {
            Err(Error::NotFound(format!(
                "device {device_id} is not in this account's device list"
            )))
        }
    }

    pub async fn get_device_metadata(
        &self,
        device_id: &str,
        on_prem: bool,
    ) -> Result<DeviceMetadata> {
        let device_id = device_id.trim();
        if device_id.is_empty() {
            return Err(Error::validation("device id must not be empty"));
        }
        let url = self
            .api
            .endpoint(on_prem, &["api", "metaData", "device", device_id])?;
        let metadata: DeviceMetadata = self
            .api
            .get_data("device_metadata", url)
            .await
            .map_err(|err| err.in_operation("get_device_metadata", device_id))?
            .data;
        tracing::debug!(
            device = device_id,
            sensors = metadata.sensors.len(),
            "fetched device metadata"
        );
        Ok(metadata)
    }

    /// Organisation id of the configured user; served from `cache` while fresh.
    pub async fn organisation_id(&self, cache: &OrgIdCache, on_prem: bool) -> Result<String> {
        if let Some(org_id) = cache.get() {
            return Ok(org_id);
        }
        let user = self.get_user_info(on_prem).await?;
        let org_id = user
            .organisation_id()
            .ok_or_else(|| Error::NotFound("user has no organisation".to_string()))?;
        cache.set(org_id.clone());
        Ok(org_id)
    }
}
