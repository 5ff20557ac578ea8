//! Persisted lifecycle store: credential records plus a bounded event log,
//! flushed to a single JSON snapshot file behind a debounce timer.

use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::warn;

use aigw_common::RiskMode;

use crate::policy::{Decision, LifecycleState};
use crate::signal::SignalType;

pub const SNAPSHOT_VERSION: u32 = 1;
pub const DEFAULT_MAX_EVENTS: usize = 5000;
pub const DEFAULT_FLUSH_DEBOUNCE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleRecord {
    pub credential_id: String,
    pub lifecycle_state: LifecycleState,
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option",
        default
    )]
    pub cooldown_until: Option<OffsetDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_signal_type: Option<SignalType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_reason_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_source: Option<String>,
    /// Redacted before storage.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_message: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub first_seen_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl LifecycleRecord {
    pub fn new(credential_id: impl Into<String>, state: LifecycleState) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            credential_id: credential_id.into(),
            lifecycle_state: state,
            cooldown_until: None,
            last_signal_type: None,
            last_reason_code: None,
            last_status_code: None,
            last_source: None,
            last_error_message: None,
            first_seen_at: now,
            updated_at: now,
            metadata: serde_json::Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub event_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    pub credential_id: String,
    pub signal_type: SignalType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub mode: RiskMode,
    pub decision: Decision,
    pub previous_state: LifecycleState,
    pub next_state: LifecycleState,
    pub changed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default)]
    pub streamed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_profile_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collided_with: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    #[serde(with = "time::serde::rfc3339")]
    generated_at: OffsetDateTime,
    credentials: Vec<LifecycleRecord>,
    events: Vec<LifecycleEvent>,
}

/// Config-derived seed for one pool entry, used to derive an initial state.
#[derive(Debug, Clone, Default)]
pub struct PoolSeed {
    pub credential_id: String,
    pub disabled: bool,
    pub needs_refresh: bool,
    pub scheduled_recovery: Option<OffsetDateTime>,
    pub unhealthy: bool,
    pub priority: i64,
}

#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub provider_type: Option<String>,
    pub lifecycle_state: Option<LifecycleState>,
}

#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub credential_id: Option<String>,
    pub provider_type: Option<String>,
    pub signal_type: Option<SignalType>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LifecycleSummary {
    pub total: usize,
    pub by_state: std::collections::BTreeMap<String, usize>,
    pub events: usize,
}

struct Inner {
    credentials: HashMap<String, LifecycleRecord>,
    events: VecDeque<LifecycleEvent>,
    dirty: bool,
}

pub struct LifecycleStore {
    path: PathBuf,
    max_events: usize,
    inner: Mutex<Inner>,
    /// Kicks the single debounce task; a burst of writes collapses into one
    /// flush.
    flush_tx: tokio::sync::mpsc::UnboundedSender<()>,
}

impl LifecycleStore {
    pub fn new(path: impl Into<PathBuf>) -> Arc<Self> {
        Self::with_limits(path, DEFAULT_MAX_EVENTS, DEFAULT_FLUSH_DEBOUNCE)
    }

    pub fn with_limits(
        path: impl Into<PathBuf>,
        max_events: usize,
        debounce: Duration,
    ) -> Arc<Self> {
        let (flush_tx, mut flush_rx) = tokio::sync::mpsc::unbounded_channel::<()>();
        let store = Arc::new(Self {
            path: path.into(),
            max_events,
            inner: Mutex::new(Inner {
                credentials: HashMap::new(),
                events: VecDeque::new(),
                dirty: false,
            }),
            flush_tx,
        });

        let weak = Arc::downgrade(&store);
        tokio::spawn(async move {
            while flush_rx.recv().await.is_some() {
                tokio::time::sleep(debounce).await;
                // Collapse every kick that arrived during the debounce
                // window into this one flush.
                while flush_rx.try_recv().is_ok() {}
                let Some(store) = weak.upgrade() else { break };
                store.flush_now().await;
            }
        });
        store
    }

    /// Load the snapshot file.  Absent, empty or corrupt files degrade to an
    /// empty store; the next flush overwrites whatever was there.
    pub async fn load_from_disk(&self) {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return,
            Err(err) => {
                warn!(event = "lifecycle.load_failed", path = %self.path.display(), error = %err);
                return;
            }
        };
        if raw.is_empty() {
            return;
        }
        let snapshot: Snapshot = match serde_json::from_slice(&raw) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(event = "lifecycle.parse_failed", path = %self.path.display(), error = %err);
                return;
            }
        };
        let mut inner = self.inner.lock().await;
        inner.credentials = snapshot
            .credentials
            .into_iter()
            .map(|record| (record.credential_id.clone(), record))
            .collect();
        inner.events = snapshot.events.into();
        while inner.events.len() > self.max_events {
            inner.events.pop_front();
        }
    }

    /// Merge pool config entries, preserving any state already loaded.
    pub async fn initialize_from_pools(&self, seeds: &[PoolSeed]) {
        let mut inner = self.inner.lock().await;
        for seed in seeds {
            if let Some(existing) = inner.credentials.get_mut(&seed.credential_id) {
                existing
                    .metadata
                    .insert("priority".to_string(), serde_json::json!(seed.priority));
                continue;
            }
            let state = derive_initial_state(seed);
            let mut record = LifecycleRecord::new(&seed.credential_id, state);
            if state == LifecycleState::Cooldown {
                record.cooldown_until = seed.scheduled_recovery;
            }
            record
                .metadata
                .insert("priority".to_string(), serde_json::json!(seed.priority));
            record.metadata.insert(
                "isHealthy".to_string(),
                serde_json::json!(state == LifecycleState::Healthy),
            );
            inner
                .credentials
                .insert(seed.credential_id.clone(), record);
        }
        inner.dirty = true;
        drop(inner);
        self.kick_flush();
    }

    /// Shallow-merge an updated record; bumps `updated_at`.
    pub async fn upsert_credential(&self, record: LifecycleRecord) {
        let mut inner = self.inner.lock().await;
        let entry = inner
            .credentials
            .entry(record.credential_id.clone())
            .or_insert_with(|| {
                LifecycleRecord::new(&record.credential_id, record.lifecycle_state)
            });
        entry.lifecycle_state = record.lifecycle_state;
        entry.cooldown_until = record.cooldown_until;
        if record.last_signal_type.is_some() {
            entry.last_signal_type = record.last_signal_type;
            entry.last_reason_code = record.last_reason_code;
            entry.last_status_code = record.last_status_code;
            entry.last_source = record.last_source;
            entry.last_error_message = record.last_error_message;
        }
        for (key, value) in record.metadata {
            entry.metadata.insert(key, value);
        }
        entry.metadata.insert(
            "isHealthy".to_string(),
            serde_json::json!(entry.lifecycle_state == LifecycleState::Healthy),
        );
        entry.updated_at = OffsetDateTime::now_utc();
        inner.dirty = true;
        drop(inner);
        self.kick_flush();
    }

    pub async fn append_event(&self, mut event: LifecycleEvent) {
        if event.event_id.is_empty() {
            event.event_id = synthesize_event_id(&event);
        }
        let mut inner = self.inner.lock().await;
        inner.events.push_back(event);
        while inner.events.len() > self.max_events {
            inner.events.pop_front();
        }
        inner.dirty = true;
        drop(inner);
        self.kick_flush();
    }

    pub async fn get_credential(&self, credential_id: &str) -> Option<LifecycleRecord> {
        self.inner
            .lock()
            .await
            .credentials
            .get(credential_id)
            .cloned()
    }

    pub async fn get_all_credentials(&self, filter: &RecordFilter) -> Vec<LifecycleRecord> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<LifecycleRecord> = inner
            .credentials
            .values()
            .filter(|record| {
                if let Some(provider) = &filter.provider_type
                    && !record.credential_id.starts_with(&format!("{provider}:"))
                {
                    return false;
                }
                if let Some(state) = filter.lifecycle_state
                    && record.lifecycle_state != state
                {
                    return false;
                }
                true
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.credential_id.cmp(&b.credential_id));
        rows
    }

    /// Most recent first.  The limit is clamped to `[1, 1000]`.
    pub async fn get_recent_events(&self, filter: &EventFilter) -> Vec<LifecycleEvent> {
        let limit = filter.limit.unwrap_or(100).clamp(1, 1000);
        let inner = self.inner.lock().await;
        inner
            .events
            .iter()
            .rev()
            .filter(|event| {
                if let Some(id) = &filter.credential_id
                    && &event.credential_id != id
                {
                    return false;
                }
                if let Some(provider) = &filter.provider_type
                    && !event.credential_id.starts_with(&format!("{provider}:"))
                {
                    return false;
                }
                if let Some(signal) = filter.signal_type
                    && event.signal_type != signal
                {
                    return false;
                }
                true
            })
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn get_summary(&self) -> LifecycleSummary {
        let inner = self.inner.lock().await;
        let mut by_state = std::collections::BTreeMap::new();
        for record in inner.credentials.values() {
            *by_state
                .entry(record.lifecycle_state.as_str().to_string())
                .or_insert(0) += 1;
        }
        LifecycleSummary {
            total: inner.credentials.len(),
            by_state,
            events: inner.events.len(),
        }
    }

    fn kick_flush(&self) {
        let _ = self.flush_tx.send(());
    }

    /// Write the whole snapshot if dirty.  Write failures keep the dirty flag
    /// set so a later flush retries.
    pub async fn flush_now(&self) {
        let payload = {
            let mut inner = self.inner.lock().await;
            if !inner.dirty {
                return;
            }
            let mut credentials: Vec<LifecycleRecord> =
                inner.credentials.values().cloned().collect();
            credentials.sort_by(|a, b| a.credential_id.cmp(&b.credential_id));
            let snapshot = Snapshot {
                version: SNAPSHOT_VERSION,
                generated_at: OffsetDateTime::now_utc(),
                credentials,
                events: inner.events.iter().cloned().collect(),
            };
            inner.dirty = false;
            serde_json::to_vec_pretty(&snapshot)
        };
        let payload = match payload {
            Ok(payload) => payload,
            Err(err) => {
                warn!(event = "lifecycle.serialize_failed", error = %err);
                self.inner.lock().await.dirty = true;
                return;
            }
        };
        if let Err(err) = tokio::fs::write(&self.path, payload).await {
            warn!(event = "lifecycle.flush_failed", path = %self.path.display(), error = %err);
            self.inner.lock().await.dirty = true;
        }
    }
}

fn derive_initial_state(seed: &PoolSeed) -> LifecycleState {
    if seed.disabled {
        LifecycleState::Disabled
    } else if seed.needs_refresh {
        LifecycleState::NeedsRefresh
    } else if seed
        .scheduled_recovery
        .is_some_and(|at| at > OffsetDateTime::now_utc())
    {
        LifecycleState::Cooldown
    } else if seed.unhealthy {
        LifecycleState::Quarantined
    } else {
        LifecycleState::Healthy
    }
}

fn synthesize_event_id(event: &LifecycleEvent) -> String {
    let millis = (event.at.unix_timestamp_nanos() / 1_000_000) as i64;
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    event.credential_id.hash(&mut hasher);
    event.signal_type.as_str().hash(&mut hasher);
    event.request_id.hash(&mut hasher);
    millis.hash(&mut hasher);
    format!("{millis:x}-{:08x}", hasher.finish() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(credential_id: &str, signal: SignalType) -> LifecycleEvent {
        LifecycleEvent {
            event_id: String::new(),
            at: OffsetDateTime::now_utc(),
            credential_id: credential_id.to_string(),
            signal_type: signal,
            reason_code: None,
            status_code: None,
            source: None,
            mode: RiskMode::EnforceSoft,
            decision: Decision::NoStateChange,
            previous_state: LifecycleState::Healthy,
            next_state: LifecycleState::Healthy,
            changed: false,
            request_id: None,
            streamed: false,
            model: None,
            raw_message: None,
            identity_profile_id: None,
            collided_with: None,
        }
    }

    #[tokio::test]
    async fn events_trim_from_the_oldest_end() {
        let dir = tempfile::tempdir().unwrap();
        let store = LifecycleStore::with_limits(
            dir.path().join("lifecycle.json"),
            3,
            Duration::from_millis(10),
        );
        for index in 0..5 {
            store
                .append_event(event(
                    &format!("openai-custom:c{index}"),
                    SignalType::Success,
                ))
                .await;
        }
        let events = store.get_recent_events(&EventFilter::default()).await;
        assert_eq!(events.len(), 3);
        // Most recent first; c0 and c1 were trimmed.
        assert_eq!(events[0].credential_id, "openai-custom:c4");
        assert_eq!(events[2].credential_id, "openai-custom:c2");
    }

    #[tokio::test]
    async fn snapshot_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lifecycle.json");
        let store = LifecycleStore::with_limits(&path, 100, Duration::from_millis(10));
        store
            .upsert_credential(LifecycleRecord::new(
                "kiro-oauth:abc",
                LifecycleState::NeedsRefresh,
            ))
            .await;
        store
            .append_event(event("kiro-oauth:abc", SignalType::AuthInvalid))
            .await;
        store.flush_now().await;

        let reloaded = LifecycleStore::new(&path);
        reloaded.load_from_disk().await;
        let record = reloaded.get_credential("kiro-oauth:abc").await.unwrap();
        assert_eq!(record.lifecycle_state, LifecycleState::NeedsRefresh);
        assert_eq!(
            reloaded
                .get_recent_events(&EventFilter::default())
                .await
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn debounced_flush_reaches_disk_without_explicit_flush() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lifecycle.json");
        let store = LifecycleStore::with_limits(&path, 100, Duration::from_millis(20));
        store
            .upsert_credential(LifecycleRecord::new(
                "openai-custom:a",
                LifecycleState::Healthy,
            ))
            .await;
        tokio::time::sleep(Duration::from_millis(120)).await;
        let raw = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(raw.contains("openai-custom:a"));
    }

    #[tokio::test]
    async fn corrupt_snapshot_degrades_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lifecycle.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();
        let store = LifecycleStore::new(&path);
        store.load_from_disk().await;
        assert_eq!(store.get_summary().await.total, 0);
    }

    #[tokio::test]
    async fn initial_state_precedence_follows_config_flags() {
        let dir = tempfile::tempdir().unwrap();
        let store = LifecycleStore::new(dir.path().join("lifecycle.json"));
        let seeds = vec![
            PoolSeed {
                credential_id: "p:disabled".to_string(),
                disabled: true,
                needs_refresh: true,
                ..Default::default()
            },
            PoolSeed {
                credential_id: "p:refresh".to_string(),
                needs_refresh: true,
                unhealthy: true,
                ..Default::default()
            },
            PoolSeed {
                credential_id: "p:cooldown".to_string(),
                scheduled_recovery: Some(OffsetDateTime::now_utc() + time::Duration::minutes(5)),
                unhealthy: true,
                ..Default::default()
            },
            PoolSeed {
                credential_id: "p:quarantined".to_string(),
                unhealthy: true,
                ..Default::default()
            },
            PoolSeed {
                credential_id: "p:healthy".to_string(),
                ..Default::default()
            },
        ];
        store.initialize_from_pools(&seeds).await;
        for (id, expected) in [
            ("p:disabled", LifecycleState::Disabled),
            ("p:refresh", LifecycleState::NeedsRefresh),
            ("p:cooldown", LifecycleState::Cooldown),
            ("p:quarantined", LifecycleState::Quarantined),
            ("p:healthy", LifecycleState::Healthy),
        ] {
            let record = store.get_credential(id).await.unwrap();
            assert_eq!(record.lifecycle_state, expected, "{id}");
        }
    }

    #[tokio::test]
    async fn event_limit_is_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let store = LifecycleStore::new(dir.path().join("lifecycle.json"));
        for _ in 0..4 {
            store.append_event(event("p:c", SignalType::Success)).await;
        }
        let events = store
            .get_recent_events(&EventFilter {
                limit: Some(0),
                ..Default::default()
            })
            .await;
        assert_eq!(events.len(), 1);
    }
}
