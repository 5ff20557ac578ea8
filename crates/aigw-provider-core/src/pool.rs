//! Provider pool manager: per-provider ordered credential lists, selection,
//! health bookkeeping and whole-file persistence.
//!
//! The in-memory map and the pools file are kept strictly in sync: every
//! persisted mutation rewrites the file whole under the pool mutex.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::warn;

use aigw_common::CredentialId;
use aigw_risk::{ObserveCtx, PoolSeed, RiskManager, SignalType};

use crate::adapter::{AdapterError, HealthCheckResult, HealthProbe};
use crate::credential::CredentialConfig;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum PoolError {
    #[error("unknown provider type: {0}")]
    UnknownProvider(String),
    #[error("unknown credential {uuid} for provider {provider}")]
    UnknownCredential { provider: String, uuid: String },
    #[error("no selectable credential for provider {0}")]
    NoneAvailable(String),
    #[error("uuid {0} already exists in the pool")]
    DuplicateUuid(String),
}

/// Who triggered a mark operation.  Operator mutations emit control-plane
/// signals; dispatch-path marks stay quiet because the risk manager already
/// observed the raw failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOrigin {
    Operator,
    Dispatch,
}

#[derive(Debug, Clone)]
pub struct SelectedCredential {
    pub provider_type: String,
    pub config: CredentialConfig,
}

impl SelectedCredential {
    pub fn credential_id(&self) -> CredentialId {
        CredentialId::new(self.provider_type.clone(), self.config.uuid.clone())
    }
}

pub struct ProviderPoolManager {
    path: PathBuf,
    pools: Mutex<BTreeMap<String, Vec<CredentialConfig>>>,
    risk: Arc<RiskManager>,
}

impl ProviderPoolManager {
    pub fn new(path: impl Into<PathBuf>, risk: Arc<RiskManager>) -> Self {
        Self {
            path: path.into(),
            pools: Mutex::new(BTreeMap::new()),
            risk,
        }
    }

    pub fn risk(&self) -> &Arc<RiskManager> {
        &self.risk
    }

    /// Load the pools file.  Absent or corrupt files degrade to an empty map.
    pub async fn load_from_disk(&self) {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return,
            Err(err) => {
                warn!(event = "pool.load_failed", path = %self.path.display(), error = %err);
                return;
            }
        };
        if raw.is_empty() {
            return;
        }
        match serde_json::from_slice::<BTreeMap<String, Vec<CredentialConfig>>>(&raw) {
            Ok(pools) => *self.pools.lock().await = pools,
            Err(err) => {
                warn!(event = "pool.parse_failed", path = %self.path.display(), error = %err);
            }
        }
    }

    /// Seeds for `LifecycleStore::initialize_from_pools`.
    pub async fn seeds(&self) -> Vec<PoolSeed> {
        let pools = self.pools.lock().await;
        let mut seeds = Vec::new();
        for (provider, entries) in pools.iter() {
            for entry in entries {
                seeds.push(PoolSeed {
                    credential_id: format!("{provider}:{}", entry.uuid),
                    disabled: entry.is_disabled,
                    needs_refresh: entry.counters.needs_refresh,
                    scheduled_recovery: entry.counters.scheduled_recovery_time,
                    unhealthy: !entry.is_healthy,
                    priority: entry.priority,
                });
            }
        }
        seeds
    }

    pub async fn provider_types(&self) -> Vec<String> {
        self.pools.lock().await.keys().cloned().collect()
    }

    pub async fn snapshot(&self) -> BTreeMap<String, Vec<CredentialConfig>> {
        self.pools.lock().await.clone()
    }

    pub async fn get(&self, provider: &str, uuid: &str) -> Option<CredentialConfig> {
        let pools = self.pools.lock().await;
        pools
            .get(provider)?
            .iter()
            .find(|entry| entry.uuid == uuid)
            .cloned()
    }

    /// Least-used healthy entry; priority breaks ties, pool order breaks the
    /// rest.
    pub async fn select(&self, provider: &str) -> Result<SelectedCredential, PoolError> {
        let now = OffsetDateTime::now_utc();
        let mut pools = self.pools.lock().await;
        let entries = pools
            .get_mut(provider)
            .ok_or_else(|| PoolError::UnknownProvider(provider.to_string()))?;

        let chosen = entries
            .iter_mut()
            .filter(|entry| entry.is_selectable(now))
            .min_by_key(|entry| (entry.counters.usage_count, entry.priority))
            .ok_or_else(|| PoolError::NoneAvailable(provider.to_string()))?;

        chosen.counters.usage_count += 1;
        chosen.counters.last_used = Some(now);
        let selected = SelectedCredential {
            provider_type: provider.to_string(),
            config: chosen.clone(),
        };
        self.persist(&pools).await;
        Ok(selected)
    }

    /// Earliest cooldown end among entries that are only unavailable because
    /// of a pending recovery time.  `None` when nothing is merely cooling
    /// down.
    pub async fn earliest_recovery(&self, provider: &str) -> Option<OffsetDateTime> {
        let now = OffsetDateTime::now_utc();
        let pools = self.pools.lock().await;
        pools
            .get(provider)?
            .iter()
            .filter(|entry| !entry.is_disabled && !entry.drain && entry.is_healthy)
            .filter_map(|entry| entry.counters.scheduled_recovery_time)
            .filter(|recovery| *recovery > now)
            .min()
    }

    pub async fn add_credential(
        &self,
        provider: &str,
        config: CredentialConfig,
    ) -> Result<(), PoolError> {
        let mut pools = self.pools.lock().await;
        let entries = pools.entry(provider.to_string()).or_default();
        if entries.iter().any(|entry| entry.uuid == config.uuid) {
            return Err(PoolError::DuplicateUuid(config.uuid));
        }
        entries.push(config);
        self.persist(&pools).await;
        Ok(())
    }

    /// Update an entry in place.  The uuid is immutable here; use
    /// [`ProviderPoolManager::refresh_uuid`] to rotate it.
    pub async fn update_credential(
        &self,
        provider: &str,
        uuid: &str,
        mut config: CredentialConfig,
    ) -> Result<(), PoolError> {
        let mut pools = self.pools.lock().await;
        let entry = entry_mut(&mut pools, provider, uuid)?;
        config.uuid = entry.uuid.clone();
        *entry = config;
        self.persist(&pools).await;
        Ok(())
    }

    /// Deleting the last entry of a provider removes the key entirely.
    pub async fn delete_credential(&self, provider: &str, uuid: &str) -> Result<(), PoolError> {
        let mut pools = self.pools.lock().await;
        let entries = pools
            .get_mut(provider)
            .ok_or_else(|| PoolError::UnknownProvider(provider.to_string()))?;
        let before = entries.len();
        entries.retain(|entry| entry.uuid != uuid);
        if entries.len() == before {
            return Err(PoolError::UnknownCredential {
                provider: provider.to_string(),
                uuid: uuid.to_string(),
            });
        }
        if entries.is_empty() {
            pools.remove(provider);
        }
        self.persist(&pools).await;
        Ok(())
    }

    pub async fn delete_unhealthy(&self, provider: &str) -> Result<usize, PoolError> {
        let mut pools = self.pools.lock().await;
        let entries = pools
            .get_mut(provider)
            .ok_or_else(|| PoolError::UnknownProvider(provider.to_string()))?;
        let before = entries.len();
        entries.retain(|entry| entry.is_healthy);
        let removed = before - entries.len();
        if entries.is_empty() {
            pools.remove(provider);
        }
        self.persist(&pools).await;
        Ok(removed)
    }

    pub async fn set_enabled(
        &self,
        provider: &str,
        uuid: &str,
        enabled: bool,
    ) -> Result<(), PoolError> {
        {
            let mut pools = self.pools.lock().await;
            let entry = entry_mut(&mut pools, provider, uuid)?;
            entry.is_disabled = !enabled;
            self.persist(&pools).await;
        }
        let signal = if enabled {
            SignalType::ProviderEnabled
        } else {
            SignalType::ProviderDisabled
        };
        self.notify(provider, uuid, signal, MarkOrigin::Operator, None)
            .await;
        Ok(())
    }

    pub async fn reset_health(&self, provider: &str) -> Result<(), PoolError> {
        let uuids: Vec<String> = {
            let mut pools = self.pools.lock().await;
            let entries = pools
                .get_mut(provider)
                .ok_or_else(|| PoolError::UnknownProvider(provider.to_string()))?;
            for entry in entries.iter_mut() {
                entry.is_healthy = true;
                entry.counters.error_count = 0;
                entry.counters.scheduled_recovery_time = None;
                entry.counters.last_error_message = None;
            }
            let uuids = entries.iter().map(|entry| entry.uuid.clone()).collect();
            self.persist(&pools).await;
            uuids
        };
        for uuid in uuids {
            self.notify(
                provider,
                &uuid,
                SignalType::ProviderMarkedHealthy,
                MarkOrigin::Operator,
                None,
            )
            .await;
        }
        Ok(())
    }

    /// Rotate the uuid of one entry; the old lifecycle record stays under the
    /// old id, which is the point of the operation.
    pub async fn refresh_uuid(
        &self,
        provider: &str,
        old_uuid: &str,
        new_uuid: &str,
    ) -> Result<(), PoolError> {
        let mut pools = self.pools.lock().await;
        let entries = pools
            .get_mut(provider)
            .ok_or_else(|| PoolError::UnknownProvider(provider.to_string()))?;
        if entries.iter().any(|entry| entry.uuid == new_uuid) {
            return Err(PoolError::DuplicateUuid(new_uuid.to_string()));
        }
        let entry = entries
            .iter_mut()
            .find(|entry| entry.uuid == old_uuid)
            .ok_or_else(|| PoolError::UnknownCredential {
                provider: provider.to_string(),
                uuid: old_uuid.to_string(),
            })?;
        entry.uuid = new_uuid.to_string();
        self.persist(&pools).await;
        Ok(())
    }

    pub async fn mark_healthy(
        &self,
        provider: &str,
        uuid: &str,
        preserve_usage_count: bool,
        origin: MarkOrigin,
    ) -> Result<(), PoolError> {
        {
            let mut pools = self.pools.lock().await;
            let entry = entry_mut(&mut pools, provider, uuid)?;
            entry.is_healthy = true;
            entry.counters.error_count = 0;
            entry.counters.needs_refresh = false;
            entry.counters.scheduled_recovery_time = None;
            entry.counters.last_error_message = None;
            if !preserve_usage_count {
                entry.counters.usage_count = 0;
            }
            self.persist(&pools).await;
        }
        self.notify(
            provider,
            uuid,
            SignalType::ProviderMarkedHealthy,
            origin,
            None,
        )
        .await;
        Ok(())
    }

    /// Idempotent; repeated calls only bump the error counter.
    pub async fn mark_unhealthy(
        &self,
        provider: &str,
        uuid: &str,
        error_message: Option<String>,
        scheduled_recovery: Option<OffsetDateTime>,
        origin: MarkOrigin,
    ) -> Result<(), PoolError> {
        let already = {
            let mut pools = self.pools.lock().await;
            let entry = entry_mut(&mut pools, provider, uuid)?;
            let already = !entry.is_healthy;
            entry.is_healthy = false;
            entry.counters.error_count += 1;
            entry.counters.scheduled_recovery_time = scheduled_recovery;
            if error_message.is_some() {
                entry.counters.last_error_message =
                    error_message.map(|message| aigw_common::redact_text(&message));
            }
            self.persist(&pools).await;
            already
        };
        if !already {
            self.notify(
                provider,
                uuid,
                SignalType::ProviderMarkedUnhealthy,
                origin,
                None,
            )
            .await;
        }
        Ok(())
    }

    /// Auth-class failures skip the error-count threshold entirely.
    pub async fn mark_unhealthy_immediately(
        &self,
        provider: &str,
        uuid: &str,
        error_message: Option<String>,
        origin: MarkOrigin,
    ) -> Result<(), PoolError> {
        self.mark_unhealthy(provider, uuid, error_message, None, origin)
            .await
    }

    pub async fn mark_need_refresh(
        &self,
        provider: &str,
        uuid: &str,
        origin: MarkOrigin,
    ) -> Result<(), PoolError> {
        {
            let mut pools = self.pools.lock().await;
            let entry = entry_mut(&mut pools, provider, uuid)?;
            entry.counters.needs_refresh = true;
            self.persist(&pools).await;
        }
        self.notify(
            provider,
            uuid,
            SignalType::ProviderNeedsRefresh,
            origin,
            None,
        )
        .await;
        Ok(())
    }

    pub async fn apply_cooldown(
        &self,
        provider: &str,
        uuid: &str,
        until: OffsetDateTime,
        origin: MarkOrigin,
    ) -> Result<(), PoolError> {
        {
            let mut pools = self.pools.lock().await;
            let entry = entry_mut(&mut pools, provider, uuid)?;
            entry.counters.scheduled_recovery_time = Some(until);
            self.persist(&pools).await;
        }
        self.notify(
            provider,
            uuid,
            SignalType::QuotaExceeded,
            origin,
            Some(until),
        )
        .await;
        Ok(())
    }

    pub async fn clear_cooldown(
        &self,
        provider: &str,
        uuid: &str,
        origin: MarkOrigin,
    ) -> Result<(), PoolError> {
        {
            let mut pools = self.pools.lock().await;
            let entry = entry_mut(&mut pools, provider, uuid)?;
            entry.counters.scheduled_recovery_time = None;
            self.persist(&pools).await;
        }
        self.notify(
            provider,
            uuid,
            SignalType::ProviderMarkedHealthy,
            origin,
            None,
        )
        .await;
        Ok(())
    }

    pub async fn set_drain(&self, provider: &str, uuid: &str, drain: bool) -> Result<(), PoolError> {
        let mut pools = self.pools.lock().await;
        let entry = entry_mut(&mut pools, provider, uuid)?;
        entry.drain = drain;
        self.persist(&pools).await;
        Ok(())
    }

    pub async fn force_refresh_credential(
        &self,
        provider: &str,
        uuid: &str,
    ) -> Result<(), PoolError> {
        {
            let mut pools = self.pools.lock().await;
            let entry = entry_mut(&mut pools, provider, uuid)?;
            entry.counters.needs_refresh = true;
            entry.counters.refresh_count += 1;
            self.persist(&pools).await;
        }
        self.notify(
            provider,
            uuid,
            SignalType::ProviderNeedsRefresh,
            MarkOrigin::Operator,
            None,
        )
        .await;
        Ok(())
    }

    /// Probe one credential.  Non-forced checks honor the per-entry
    /// `check_health` gate; the admin path passes `force = true`.
    pub async fn check_provider_health(
        &self,
        provider: &str,
        uuid: &str,
        probe: &dyn HealthProbe,
        force: bool,
    ) -> Result<HealthCheckResult, PoolError> {
        let config = self
            .get(provider, uuid)
            .await
            .ok_or_else(|| PoolError::UnknownCredential {
                provider: provider.to_string(),
                uuid: uuid.to_string(),
            })?;
        if !force && !config.check_health {
            return Ok(HealthCheckResult {
                success: true,
                model_name: None,
                error_message: Some("check_health disabled".to_string()),
            });
        }

        match probe.probe(provider, uuid).await {
            Ok(model_name) => {
                self.mark_healthy(provider, uuid, true, MarkOrigin::Operator)
                    .await?;
                Ok(HealthCheckResult {
                    success: true,
                    model_name: Some(model_name),
                    error_message: None,
                })
            }
            Err(err) => {
                let auth_class = matches!(err, AdapterError::Auth(_))
                    || matches!(err.status(), Some(401) | Some(403));
                if auth_class {
                    self.mark_unhealthy_immediately(
                        provider,
                        uuid,
                        Some(err.to_string()),
                        MarkOrigin::Operator,
                    )
                    .await?;
                }
                Ok(HealthCheckResult {
                    success: false,
                    model_name: None,
                    error_message: Some(err.to_string()),
                })
            }
        }
    }

    async fn notify(
        &self,
        provider: &str,
        uuid: &str,
        signal: SignalType,
        origin: MarkOrigin,
        cooldown_until: Option<OffsetDateTime>,
    ) {
        if origin == MarkOrigin::Dispatch {
            // The dispatcher already ran the raw failure through the risk
            // manager; a second event would double-count it.
            return;
        }
        let credential = CredentialId::new(provider, uuid);
        let ctx = ObserveCtx {
            source: Some("pool_manager".to_string()),
            cooldown_until,
            ..Default::default()
        };
        self.risk
            .record_control_plane_action(&credential, signal, &ctx)
            .await;
    }

    async fn persist(&self, pools: &BTreeMap<String, Vec<CredentialConfig>>) {
        let payload = match serde_json::to_vec_pretty(pools) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(event = "pool.serialize_failed", error = %err);
                return;
            }
        };
        if let Err(err) = tokio::fs::write(&self.path, payload).await {
            warn!(event = "pool.persist_failed", path = %self.path.display(), error = %err);
        }
    }
}

fn entry_mut<'a>(
    pools: &'a mut BTreeMap<String, Vec<CredentialConfig>>,
    provider: &str,
    uuid: &str,
) -> Result<&'a mut CredentialConfig, PoolError> {
    pools
        .get_mut(provider)
        .ok_or_else(|| PoolError::UnknownProvider(provider.to_string()))?
        .iter_mut()
        .find(|entry| entry.uuid == uuid)
        .ok_or_else(|| PoolError::UnknownCredential {
            provider: provider.to_string(),
            uuid: uuid.to_string(),
        })
}
