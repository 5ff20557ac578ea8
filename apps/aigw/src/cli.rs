use std::path::PathBuf;

use clap::Parser;

use aigw_common::{GatewayConfigPatch, LogMode, RiskMode, SystemPromptMode};

/// Protocol-translating multi-provider LLM gateway.
#[derive(Debug, Parser)]
#[command(name = "aigw", version, about)]
pub struct Cli {
    #[arg(long, env = "AIGW_HOST")]
    pub host: Option<String>,

    #[arg(long, env = "AIGW_PORT")]
    pub port: Option<u16>,

    /// Key downstream clients must present.
    #[arg(long, env = "AIGW_API_KEY")]
    pub api_key: Option<String>,

    /// Provider used when no routing heuristic matches.
    #[arg(long, env = "AIGW_DEFAULT_PROVIDER")]
    pub default_provider: Option<String>,

    #[arg(long, env = "AIGW_POOLS_FILE")]
    pub pools_file: Option<PathBuf>,

    #[arg(long, env = "AIGW_LIFECYCLE_FILE")]
    pub lifecycle_file: Option<PathBuf>,

    #[arg(long, env = "AIGW_CREDENTIALS_DIR")]
    pub credentials_dir: Option<PathBuf>,

    #[arg(long, env = "AIGW_PROMPT_INPUT_LOG")]
    pub prompt_input_log: Option<PathBuf>,

    #[arg(long, env = "AIGW_PROMPT_OUTPUT_LOG")]
    pub prompt_output_log: Option<PathBuf>,

    #[arg(long, env = "AIGW_SYSTEM_PROMPT_FILE")]
    pub system_prompt_file: Option<PathBuf>,

    /// overwrite | append
    #[arg(long, env = "AIGW_SYSTEM_PROMPT_MODE")]
    pub system_prompt_mode: Option<String>,

    /// none | console | file
    #[arg(long, env = "AIGW_LOG_MODE")]
    pub log_mode: Option<String>,

    /// observe | enforce_soft | enforce_strict | protective_emergency
    #[arg(long, env = "AIGW_RISK_MODE")]
    pub risk_mode: Option<String>,

    #[arg(long, env = "AIGW_IDENTITY_WINDOW_MS")]
    pub identity_window_ms: Option<u64>,

    #[arg(long, env = "AIGW_QUOTA_COOLDOWN_MS")]
    pub quota_cooldown_ms: Option<u64>,

    #[arg(long, env = "AIGW_RATE_LIMIT_COOLDOWN_MS")]
    pub rate_limit_cooldown_ms: Option<u64>,

    #[arg(long, env = "AIGW_ALLOW_RUN_COMMAND")]
    pub allow_run_command: Option<bool>,

    #[arg(long, env = "AIGW_EMIT_FS_TOOL_USE")]
    pub emit_fs_tool_use: Option<bool>,

    #[arg(long, env = "AIGW_USE_SYSTEM_PROXY")]
    pub use_system_proxy: Option<bool>,

    #[arg(long, env = "AIGW_FS_WORKING_DIR")]
    pub fs_working_dir: Option<PathBuf>,

    #[arg(long, env = "AIGW_TELEMETRY_ENDPOINT")]
    pub telemetry_endpoint: Option<String>,
}

impl Cli {
    pub fn into_patch(self) -> GatewayConfigPatch {
        GatewayConfigPatch {
            host: self.host,
            port: self.port,
            required_api_key: self.api_key,
            default_provider: self.default_provider,
            pools_file: self.pools_file,
            lifecycle_file: self.lifecycle_file,
            credentials_dir: self.credentials_dir,
            prompt_input_log: self.prompt_input_log,
            prompt_output_log: self.prompt_output_log,
            system_prompt_file: self.system_prompt_file,
            system_prompt_mode: self.system_prompt_mode.as_deref().and_then(|mode| {
                match mode {
                    "append" => Some(SystemPromptMode::Append),
                    "overwrite" => Some(SystemPromptMode::Overwrite),
                    _ => None,
                }
            }),
            log_mode: self.log_mode.as_deref().and_then(LogMode::parse),
            risk_mode: self.risk_mode.as_deref().and_then(RiskMode::parse),
            identity_window_ms: self.identity_window_ms,
            quota_cooldown_ms: self.quota_cooldown_ms,
            rate_limit_cooldown_ms: self.rate_limit_cooldown_ms,
            provider_proxies: None,
            allow_run_command: self.allow_run_command,
            emit_fs_tool_use: self.emit_fs_tool_use,
            use_system_proxy: self.use_system_proxy,
            fs_working_dir: self.fs_working_dir,
            telemetry_endpoint: self.telemetry_endpoint,
        }
    }
}
