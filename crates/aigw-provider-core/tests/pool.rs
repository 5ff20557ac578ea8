use std::sync::Arc;
use std::time::Duration;

use aigw_common::RiskMode;
use aigw_provider_core::{CredentialConfig, MarkOrigin, PoolError, ProviderPoolManager};
use aigw_risk::{LifecycleState, LifecycleStore, RiskManager};

fn risk(dir: &tempfile::TempDir) -> Arc<RiskManager> {
    let store = LifecycleStore::new(dir.path().join("lifecycle.json"));
    Arc::new(RiskManager::new(
        store,
        RiskMode::EnforceSoft,
        Duration::from_secs(600),
    ))
}

#[tokio::test]
async fn selection_prefers_least_used_with_priority_tiebreak() {
    let dir = tempfile::tempdir().unwrap();
    let pool = ProviderPoolManager::new(dir.path().join("pools.json"), risk(&dir));

    let mut low_priority = CredentialConfig::new("a");
    low_priority.priority = 5;
    let mut high_priority = CredentialConfig::new("b");
    high_priority.priority = 1;
    pool.add_credential("openai-custom", low_priority).await.unwrap();
    pool.add_credential("openai-custom", high_priority).await.unwrap();

    // Equal usage: priority wins.
    let first = pool.select("openai-custom").await.unwrap();
    assert_eq!(first.config.uuid, "b");

    // b now has one use; least-used a comes next.
    let second = pool.select("openai-custom").await.unwrap();
    assert_eq!(second.config.uuid, "a");
}

#[tokio::test]
async fn unhealthy_and_disabled_entries_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let pool = ProviderPoolManager::new(dir.path().join("pools.json"), risk(&dir));
    pool.add_credential("qwen-oauth", CredentialConfig::new("a"))
        .await
        .unwrap();
    pool.add_credential("qwen-oauth", CredentialConfig::new("b"))
        .await
        .unwrap();

    pool.mark_unhealthy("qwen-oauth", "a", Some("boom".to_string()), None, MarkOrigin::Dispatch)
        .await
        .unwrap();
    let selected = pool.select("qwen-oauth").await.unwrap();
    assert_eq!(selected.config.uuid, "b");

    pool.set_enabled("qwen-oauth", "b", false).await.unwrap();
    assert_eq!(
        pool.select("qwen-oauth").await.unwrap_err(),
        PoolError::NoneAvailable("qwen-oauth".to_string())
    );
}

#[tokio::test]
async fn pools_file_round_trips_through_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pools.json");
    {
        let pool = ProviderPoolManager::new(&path, risk(&dir));
        let mut config = CredentialConfig::new("abc");
        config.custom_name = Some("primary".to_string());
        pool.add_credential("kiro-oauth", config).await.unwrap();
        pool.select("kiro-oauth").await.unwrap();
    }

    let pool = ProviderPoolManager::new(&path, risk(&dir));
    pool.load_from_disk().await;
    let snapshot = pool.snapshot().await;
    let entry = &snapshot["kiro-oauth"][0];
    assert_eq!(entry.uuid, "abc");
    assert_eq!(entry.custom_name.as_deref(), Some("primary"));
    assert_eq!(entry.counters.usage_count, 1);
}

#[tokio::test]
async fn deleting_the_last_entry_removes_the_provider_key() {
    let dir = tempfile::tempdir().unwrap();
    let pool = ProviderPoolManager::new(dir.path().join("pools.json"), risk(&dir));
    pool.add_credential("gemini-web", CredentialConfig::new("only"))
        .await
        .unwrap();
    pool.delete_credential("gemini-web", "only").await.unwrap();
    assert!(pool.snapshot().await.is_empty());
    assert!(matches!(
        pool.select("gemini-web").await.unwrap_err(),
        PoolError::UnknownProvider(_)
    ));
}

#[tokio::test]
async fn update_keeps_uuid_immutable() {
    let dir = tempfile::tempdir().unwrap();
    let pool = ProviderPoolManager::new(dir.path().join("pools.json"), risk(&dir));
    pool.add_credential("claude-custom", CredentialConfig::new("stable"))
        .await
        .unwrap();

    let mut replacement = CredentialConfig::new("attempted-rename");
    replacement.custom_name = Some("renamed".to_string());
    pool.update_credential("claude-custom", "stable", replacement)
        .await
        .unwrap();

    let entry = pool.get("claude-custom", "stable").await.unwrap();
    assert_eq!(entry.uuid, "stable");
    assert_eq!(entry.custom_name.as_deref(), Some("renamed"));

    pool.refresh_uuid("claude-custom", "stable", "rotated")
        .await
        .unwrap();
    assert!(pool.get("claude-custom", "rotated").await.is_some());
}

#[tokio::test]
async fn operator_marks_flow_into_the_lifecycle_store() {
    let dir = tempfile::tempdir().unwrap();
    let risk = risk(&dir);
    let pool = ProviderPoolManager::new(dir.path().join("pools.json"), risk.clone());
    pool.add_credential("kiro-oauth", CredentialConfig::new("a"))
        .await
        .unwrap();

    pool.mark_unhealthy(
        "kiro-oauth",
        "a",
        Some("probe failed".to_string()),
        None,
        MarkOrigin::Operator,
    )
    .await
    .unwrap();

    let record = risk.store().get_credential("kiro-oauth:a").await.unwrap();
    assert_eq!(record.lifecycle_state, LifecycleState::Quarantined);
}
