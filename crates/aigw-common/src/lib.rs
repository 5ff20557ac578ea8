use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub mod redact;

pub use redact::{mask_secret, redact_text};

#[derive(Debug, thiserror::Error)]
pub enum GatewayConfigError {
    #[error("missing required config field: {0}")]
    MissingField(&'static str),
    #[error("invalid config value for {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogMode {
    None,
    Console,
    File,
}

impl LogMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "none" => Some(LogMode::None),
            "console" => Some(LogMode::Console),
            "file" => Some(LogMode::File),
            _ => None,
        }
    }
}

/// Enforcement mode for the credential risk policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskMode {
    Observe,
    EnforceSoft,
    EnforceStrict,
    ProtectiveEmergency,
}

impl RiskMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "observe" => Some(RiskMode::Observe),
            "enforce_soft" => Some(RiskMode::EnforceSoft),
            "enforce_strict" => Some(RiskMode::EnforceStrict),
            "protective_emergency" => Some(RiskMode::ProtectiveEmergency),
            _ => None,
        }
    }
}

/// Final, merged gateway configuration used by the running process.
///
/// Merge order: CLI > ENV > defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Downstream clients must present this key (bearer, `?key=`, `x-api-key`
    /// or `x-goog-api-key`).
    pub required_api_key: String,
    /// Provider used when no routing heuristic matches.
    pub default_provider: String,
    pub pools_file: PathBuf,
    pub lifecycle_file: PathBuf,
    /// Directory holding per-provider credential files.
    pub credentials_dir: PathBuf,
    pub prompt_input_log: PathBuf,
    pub prompt_output_log: PathBuf,
    /// Optional system prompt file injected into outbound requests.
    pub system_prompt_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt_mode: Option<SystemPromptMode>,
    pub log_mode: LogMode,
    pub risk_mode: RiskMode,
    /// Identity-collision detection window in milliseconds.
    pub identity_window_ms: u64,
    /// Default cooldown applied on quota exhaustion when the upstream gives
    /// no retry hint.
    pub quota_cooldown_ms: u64,
    /// Default cooldown applied on rate limiting.
    pub rate_limit_cooldown_ms: u64,
    /// Outbound proxy per provider type; key is the provider type string.
    #[serde(default)]
    pub provider_proxies: std::collections::BTreeMap<String, String>,
    /// Whether the WS coding-agent adapter may execute `run_command`.
    pub allow_run_command: bool,
    /// Whether fs_operation requests are surfaced as tool_use blocks.
    pub emit_fs_tool_use: bool,
    /// Use the OS proxy settings for upstream egress.
    pub use_system_proxy: bool,
    /// Working directory for fs_operation execution; unset disables execution.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fs_working_dir: Option<PathBuf>,
    /// Optional telemetry endpoint; one summary POST per request, best effort.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telemetry_endpoint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemPromptMode {
    Overwrite,
    Append,
}

/// Optional layer used for merging gateway config.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GatewayConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub required_api_key: Option<String>,
    pub default_provider: Option<String>,
    pub pools_file: Option<PathBuf>,
    pub lifecycle_file: Option<PathBuf>,
    pub credentials_dir: Option<PathBuf>,
    pub prompt_input_log: Option<PathBuf>,
    pub prompt_output_log: Option<PathBuf>,
    pub system_prompt_file: Option<PathBuf>,
    pub system_prompt_mode: Option<SystemPromptMode>,
    pub log_mode: Option<LogMode>,
    pub risk_mode: Option<RiskMode>,
    pub identity_window_ms: Option<u64>,
    pub quota_cooldown_ms: Option<u64>,
    pub rate_limit_cooldown_ms: Option<u64>,
    pub provider_proxies: Option<std::collections::BTreeMap<String, String>>,
    pub allow_run_command: Option<bool>,
    pub emit_fs_tool_use: Option<bool>,
    pub use_system_proxy: Option<bool>,
    pub fs_working_dir: Option<PathBuf>,
    pub telemetry_endpoint: Option<String>,
}

impl GatewayConfigPatch {
    pub fn overlay(&mut self, other: GatewayConfigPatch) {
        macro_rules! take {
            ($field:ident) => {
                if other.$field.is_some() {
                    self.$field = other.$field;
                }
            };
        }
        take!(host);
        take!(port);
        take!(required_api_key);
        take!(default_provider);
        take!(pools_file);
        take!(lifecycle_file);
        take!(credentials_dir);
        take!(prompt_input_log);
        take!(prompt_output_log);
        take!(system_prompt_file);
        take!(system_prompt_mode);
        take!(log_mode);
        take!(risk_mode);
        take!(identity_window_ms);
        take!(quota_cooldown_ms);
        take!(rate_limit_cooldown_ms);
        take!(provider_proxies);
        take!(allow_run_command);
        take!(emit_fs_tool_use);
        take!(use_system_proxy);
        take!(fs_working_dir);
        take!(telemetry_endpoint);
    }

    pub fn into_config(self) -> Result<GatewayConfig, GatewayConfigError> {
        Ok(GatewayConfig {
            host: self.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: self.port.unwrap_or(3000),
            required_api_key: self
                .required_api_key
                .ok_or(GatewayConfigError::MissingField("required_api_key"))?,
            default_provider: self
                .default_provider
                .unwrap_or_else(|| "openai-custom".to_string()),
            pools_file: self
                .pools_file
                .unwrap_or_else(|| PathBuf::from("provider_pools.json")),
            lifecycle_file: self
                .lifecycle_file
                .unwrap_or_else(|| PathBuf::from("credential_lifecycle.json")),
            credentials_dir: self.credentials_dir.unwrap_or_else(|| PathBuf::from(".")),
            prompt_input_log: self
                .prompt_input_log
                .unwrap_or_else(|| PathBuf::from("prompt_input.log")),
            prompt_output_log: self
                .prompt_output_log
                .unwrap_or_else(|| PathBuf::from("prompt_output.log")),
            system_prompt_file: self.system_prompt_file,
            system_prompt_mode: self.system_prompt_mode,
            log_mode: self.log_mode.unwrap_or(LogMode::Console),
            risk_mode: self.risk_mode.unwrap_or(RiskMode::EnforceSoft),
            identity_window_ms: self.identity_window_ms.unwrap_or(10 * 60 * 1000),
            quota_cooldown_ms: self.quota_cooldown_ms.unwrap_or(5 * 60 * 1000),
            rate_limit_cooldown_ms: self.rate_limit_cooldown_ms.unwrap_or(30 * 1000),
            provider_proxies: self.provider_proxies.unwrap_or_default(),
            allow_run_command: self.allow_run_command.unwrap_or(false),
            emit_fs_tool_use: self.emit_fs_tool_use.unwrap_or(true),
            use_system_proxy: self.use_system_proxy.unwrap_or(false),
            fs_working_dir: self.fs_working_dir,
            telemetry_endpoint: self.telemetry_endpoint,
        })
    }
}

impl From<GatewayConfig> for GatewayConfigPatch {
    fn from(value: GatewayConfig) -> Self {
        Self {
            host: Some(value.host),
            port: Some(value.port),
            required_api_key: Some(value.required_api_key),
            default_provider: Some(value.default_provider),
            pools_file: Some(value.pools_file),
            lifecycle_file: Some(value.lifecycle_file),
            credentials_dir: Some(value.credentials_dir),
            prompt_input_log: Some(value.prompt_input_log),
            prompt_output_log: Some(value.prompt_output_log),
            system_prompt_file: value.system_prompt_file,
            system_prompt_mode: value.system_prompt_mode,
            log_mode: Some(value.log_mode),
            risk_mode: Some(value.risk_mode),
            identity_window_ms: Some(value.identity_window_ms),
            quota_cooldown_ms: Some(value.quota_cooldown_ms),
            rate_limit_cooldown_ms: Some(value.rate_limit_cooldown_ms),
            provider_proxies: Some(value.provider_proxies),
            allow_run_command: Some(value.allow_run_command),
            emit_fs_tool_use: Some(value.emit_fs_tool_use),
            use_system_proxy: Some(value.use_system_proxy),
            fs_working_dir: value.fs_working_dir,
            telemetry_endpoint: value.telemetry_endpoint,
        }
    }
}

/// Canonical credential identity: `providerType ":" uuid`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CredentialId {
    pub provider_type: String,
    pub uuid: String,
}

impl CredentialId {
    pub fn new(provider_type: impl Into<String>, uuid: impl Into<String>) -> Self {
        Self {
            provider_type: provider_type.into(),
            uuid: uuid.into(),
        }
    }

    pub fn canonical(&self) -> String {
        format!("{}:{}", self.provider_type, self.uuid)
    }

    pub fn parse(value: &str) -> Option<Self> {
        let (provider_type, uuid) = value.split_once(':')?;
        if provider_type.is_empty() || uuid.is_empty() {
            return None;
        }
        Some(Self::new(provider_type, uuid))
    }
}

impl std::fmt::Display for CredentialId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.provider_type, self.uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_overlay_prefers_other() {
        let mut base = GatewayConfigPatch {
            port: Some(3000),
            required_api_key: Some("a".to_string()),
            ..Default::default()
        };
        base.overlay(GatewayConfigPatch {
            port: Some(4000),
            ..Default::default()
        });
        assert_eq!(base.port, Some(4000));
        assert_eq!(base.required_api_key.as_deref(), Some("a"));
    }

    #[test]
    fn into_config_requires_api_key() {
        let err = GatewayConfigPatch::default().into_config().unwrap_err();
        assert!(matches!(
            err,
            GatewayConfigError::MissingField("required_api_key")
        ));
    }

    #[test]
    fn credential_id_round_trips() {
        let id = CredentialId::new("kiro-oauth", "abc-123");
        assert_eq!(id.canonical(), "kiro-oauth:abc-123");
        assert_eq!(CredentialId::parse("kiro-oauth:abc-123"), Some(id));
        assert_eq!(CredentialId::parse("no-colon"), None);
    }
}
