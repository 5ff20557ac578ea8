//! Pool entry shape: one credential config plus its runtime counters, as
//! persisted in the pools file.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMethod {
    Bearer,
    Social,
    Idc,
    Oauth2,
    BuilderId,
    None,
}

impl AuthMethod {
    /// OAuth-like methods can refresh a token instead of dying on 401.
    pub fn is_refreshable(&self) -> bool {
        matches!(
            self,
            AuthMethod::Social | AuthMethod::Idc | AuthMethod::Oauth2 | AuthMethod::BuilderId
        )
    }
}

impl Default for AuthMethod {
    fn default() -> Self {
        AuthMethod::None
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeCounters {
    #[serde(default)]
    pub usage_count: u64,
    #[serde(default)]
    pub error_count: u64,
    #[serde(default)]
    pub refresh_count: u64,
    #[serde(skip_serializing_if = "Option::is_none", with = "time::serde::rfc3339::option", default)]
    pub last_used: Option<OffsetDateTime>,
    #[serde(default)]
    pub needs_refresh: bool,
    #[serde(skip_serializing_if = "Option::is_none", with = "time::serde::rfc3339::option", default)]
    pub scheduled_recovery_time: Option<OffsetDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialConfig {
    pub uuid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_arn: Option<String>,
    #[serde(default)]
    pub auth_method: AuthMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub machine_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub browser_profile_id: Option<String>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub is_disabled: bool,
    #[serde(default = "default_true")]
    pub is_healthy: bool,
    /// Drain mode: finish in-flight work, accept nothing new.
    #[serde(default)]
    pub drain: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Per-provider health-check gate; admin checks bypass it.
    #[serde(default)]
    pub check_health: bool,
    #[serde(flatten)]
    pub counters: RuntimeCounters,
}

fn default_true() -> bool {
    true
}

impl CredentialConfig {
    pub fn new(uuid: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            custom_name: None,
            account_id: None,
            profile_arn: None,
            auth_method: AuthMethod::None,
            machine_code: None,
            browser_profile_id: None,
            priority: 0,
            is_disabled: false,
            is_healthy: true,
            drain: false,
            base_url: None,
            proxy_url: None,
            credential_file: None,
            api_key: None,
            check_health: false,
            counters: RuntimeCounters::default(),
        }
    }

    /// Selectable: enabled, healthy, not draining, cooldown elapsed.
    pub fn is_selectable(&self, now: OffsetDateTime) -> bool {
        if self.is_disabled || self.drain || !self.is_healthy {
            return false;
        }
        match self.counters.scheduled_recovery_time {
            Some(recovery) => recovery <= now,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_is_the_only_required_field() {
        let config: CredentialConfig =
            serde_json::from_value(serde_json::json!({"uuid": "abc"})).unwrap();
        assert_eq!(config.uuid, "abc");
        assert!(config.is_healthy);
        assert_eq!(config.counters.usage_count, 0);
    }

    #[test]
    fn cooldown_gates_selection_until_recovery() {
        let mut config = CredentialConfig::new("abc");
        let now = OffsetDateTime::now_utc();
        assert!(config.is_selectable(now));
        config.counters.scheduled_recovery_time = Some(now + time::Duration::minutes(1));
        assert!(!config.is_selectable(now));
        assert!(config.is_selectable(now + time::Duration::minutes(2)));
    }

    #[test]
    fn counters_flatten_into_the_entry() {
        let mut config = CredentialConfig::new("abc");
        config.counters.usage_count = 7;
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["usageCount"], 7);
        assert!(json.get("counters").is_none());
    }
}
