//! Per-provider credential files: JSON documents rewritten whole under a
//! per-path in-process lock whenever token material or expiry changes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};

use serde_json::Value as JsonValue;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::Mutex;

use aigw_provider_core::{AdapterError, AdapterResult};

static FILE_LOCKS: OnceLock<StdMutex<HashMap<PathBuf, Arc<Mutex<()>>>>> = OnceLock::new();

fn lock_for(path: &Path) -> AdapterResult<Arc<Mutex<()>>> {
    let locks = FILE_LOCKS.get_or_init(|| StdMutex::new(HashMap::new()));
    let mut guard = locks
        .lock()
        .map_err(|_| AdapterError::Other("credential lock table poisoned".to_string()))?;
    Ok(guard
        .entry(path.to_path_buf())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone())
}

pub async fn read_credential_file(path: &Path) -> AdapterResult<JsonValue> {
    let lock = lock_for(path)?;
    let _guard = lock.lock().await;
    let raw = tokio::fs::read(path).await.map_err(|err| {
        AdapterError::Auth(format!("credential file {} unreadable: {err}", path.display()))
    })?;
    serde_json::from_slice(&raw).map_err(|err| {
        AdapterError::Auth(format!("credential file {} invalid: {err}", path.display()))
    })
}

/// Read-modify-write under the per-path lock.  The mutation closure edits the
/// parsed document in place; the file is rewritten whole.
pub async fn update_credential_file<F>(path: &Path, mutate: F) -> AdapterResult<()>
where
    F: FnOnce(&mut JsonValue),
{
    let lock = lock_for(path)?;
    let _guard = lock.lock().await;
    let mut doc = match tokio::fs::read(path).await {
        Ok(raw) => serde_json::from_slice(&raw)
            .unwrap_or_else(|_| JsonValue::Object(serde_json::Map::new())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            JsonValue::Object(serde_json::Map::new())
        }
        Err(err) => {
            return Err(AdapterError::Other(format!(
                "credential file {} unreadable: {err}",
                path.display()
            )));
        }
    };
    mutate(&mut doc);
    let payload = serde_json::to_vec_pretty(&doc)
        .map_err(|err| AdapterError::Other(format!("credential serialize failed: {err}")))?;
    tokio::fs::write(path, payload).await.map_err(|err| {
        AdapterError::Other(format!("credential file {} write failed: {err}", path.display()))
    })
}

/// First string value found under any of the given keys.
pub fn get_str<'a>(doc: &'a JsonValue, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|key| doc.get(key).and_then(JsonValue::as_str))
}

/// `expiresAt` as an absolute instant.  Accepts ISO-8601 strings and epoch
/// milliseconds.
pub fn get_expires_at(doc: &JsonValue) -> Option<OffsetDateTime> {
    if let Some(raw) = get_str(doc, &["expiresAt", "expires_at", "expiry_date"]) {
        return OffsetDateTime::parse(raw, &Rfc3339).ok();
    }
    let millis = doc
        .get("expiresAt")
        .or_else(|| doc.get("expires_at"))
        .or_else(|| doc.get("expiry_date"))
        .and_then(JsonValue::as_i64)?;
    OffsetDateTime::from_unix_timestamp(millis / 1000).ok()
}

/// Whether the stored token expires within `threshold_secs`.
pub fn expires_within(doc: &JsonValue, threshold_secs: i64) -> bool {
    match get_expires_at(doc) {
        Some(at) => at - OffsetDateTime::now_utc() <= time::Duration::seconds(threshold_secs),
        // No expiry recorded: refresh eagerly rather than ride a dead token.
        None => true,
    }
}

pub fn format_expires_at(at: OffsetDateTime) -> String {
    at.format(&Rfc3339)
        .unwrap_or_else(|_| at.unix_timestamp().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn update_creates_and_rewrites_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qwen-oauth.json");
        update_credential_file(&path, |doc| {
            doc["access_token"] = serde_json::json!("tok-1");
        })
        .await
        .unwrap();
        update_credential_file(&path, |doc| {
            doc["expiresAt"] = serde_json::json!("2030-01-01T00:00:00Z");
        })
        .await
        .unwrap();

        let doc = read_credential_file(&path).await.unwrap();
        assert_eq!(get_str(&doc, &["access_token"]), Some("tok-1"));
        assert!(!expires_within(&doc, 60));
    }

    #[test]
    fn expiry_parses_iso_and_epoch_millis() {
        let iso = serde_json::json!({"expiresAt": "2030-01-01T00:00:00Z"});
        assert!(get_expires_at(&iso).is_some());

        let millis = serde_json::json!({"expiresAt": 1893456000000i64});
        let at = get_expires_at(&millis).unwrap();
        assert_eq!(at.year(), 2030);
    }

    #[test]
    fn missing_expiry_forces_refresh() {
        let doc = serde_json::json!({"access_token": "x"});
        assert!(expires_within(&doc, 60));
    }
}
