//! Error normalizer: collapse transport/HTTP failures into the fixed signal
//! set the policy engine understands.

use serde::{Deserialize, Serialize};

use aigw_common::redact_text;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    Success,
    AuthInvalid,
    QuotaExceeded,
    RateLimited,
    Suspended,
    Banned,
    NetworkTransient,
    IdentityCollision,
    ManualRelease,
    ProviderNeedsRefresh,
    ProviderMarkedHealthy,
    ProviderMarkedUnhealthy,
    ProviderEnabled,
    ProviderDisabled,
    Unknown,
}

impl SignalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalType::Success => "success",
            SignalType::AuthInvalid => "auth_invalid",
            SignalType::QuotaExceeded => "quota_exceeded",
            SignalType::RateLimited => "rate_limited",
            SignalType::Suspended => "suspended",
            SignalType::Banned => "banned",
            SignalType::NetworkTransient => "network_transient",
            SignalType::IdentityCollision => "identity_collision",
            SignalType::ManualRelease => "manual_release",
            SignalType::ProviderNeedsRefresh => "provider_needs_refresh",
            SignalType::ProviderMarkedHealthy => "provider_marked_healthy",
            SignalType::ProviderMarkedUnhealthy => "provider_marked_unhealthy",
            SignalType::ProviderEnabled => "provider_enabled",
            SignalType::ProviderDisabled => "provider_disabled",
            SignalType::Unknown => "unknown",
        }
    }
}

/// Loose error shape handed to the normalizer: whatever subset of fields the
/// failing layer could recover.
#[derive(Debug, Clone, Default)]
pub struct ErrorShape {
    pub status: Option<u16>,
    /// Transport-level code, e.g. `ECONNRESET`.
    pub code: Option<String>,
    pub message: Option<String>,
    pub response_body: Option<String>,
    /// A layer that already classified the failure can pin the signal.
    pub preset: Option<SignalType>,
}

impl ErrorShape {
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            response_body: Some(body.into()),
            ..Default::default()
        }
    }

    pub fn transport(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: Some(message.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedSignal {
    pub signal: SignalType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_message: Option<String>,
}

const BAN_MARKERS: &[&str] = &[
    "account is banned",
    "has been banned",
    "permanently disabled",
    "account terminated",
    "policy violation ban",
];

const SUSPENSION_MARKERS: &[&str] = &[
    "suspended",
    "temporarily locked",
    "account locked",
    "access revoked pending review",
];

const TRANSIENT_CODES: &[&str] = &[
    "econnreset",
    "econnrefused",
    "etimedout",
    "esockettimedout",
    "enotfound",
    "eai_again",
    "epipe",
    "und_err_socket",
];

const TRANSIENT_MESSAGES: &[&str] = &[
    "connection reset",
    "connection refused",
    "timed out",
    "timeout",
    "dns",
    "stream aborted",
    "socket hang up",
];

/// Classify one error; first match wins, in the documented order.
pub fn normalize_error(error: &ErrorShape) -> NormalizedSignal {
    let raw_message = compose_message(error);

    // 1. Pre-classified errors pass through untouched.
    if let Some(preset) = error.preset {
        return NormalizedSignal {
            signal: preset,
            reason_code: Some("preset".to_string()),
            status_code: error.status,
            raw_message,
        };
    }

    let haystack = format!(
        "{} {}",
        error.message.as_deref().unwrap_or(""),
        error.response_body.as_deref().unwrap_or("")
    )
    .to_lowercase();

    // 2. Ban and suspension markers outrank status routing: providers often
    //    deliver them under generic 403s.
    if BAN_MARKERS.iter().any(|marker| haystack.contains(marker)) {
        return NormalizedSignal {
            signal: SignalType::Banned,
            reason_code: Some("ban_marker".to_string()),
            status_code: error.status,
            raw_message,
        };
    }
    if SUSPENSION_MARKERS
        .iter()
        .any(|marker| haystack.contains(marker))
    {
        let reason = if error.status == Some(423) {
            "http_423"
        } else {
            "http_403"
        };
        return NormalizedSignal {
            signal: SignalType::Suspended,
            reason_code: Some(reason.to_string()),
            status_code: error.status,
            raw_message,
        };
    }

    // 3. Transient network failures, by code or message.
    let code = error
        .code
        .as_deref()
        .unwrap_or("")
        .to_lowercase();
    if TRANSIENT_CODES.iter().any(|known| code.contains(known))
        || TRANSIENT_MESSAGES
            .iter()
            .any(|known| haystack.contains(known))
    {
        return NormalizedSignal {
            signal: SignalType::NetworkTransient,
            reason_code: Some(if code.is_empty() {
                "transient_message".to_string()
            } else {
                code
            }),
            status_code: error.status,
            raw_message,
        };
    }

    // 4. HTTP status routing.
    if let Some(status) = error.status {
        let (signal, reason) = match status {
            401 => (SignalType::AuthInvalid, "http_401"),
            402 => (SignalType::QuotaExceeded, "http_402"),
            403 => (SignalType::AuthInvalid, "http_403"),
            423 => (SignalType::Suspended, "http_423"),
            429 => (SignalType::RateLimited, "http_429"),
            500..=599 => (SignalType::NetworkTransient, "http_5xx"),
            _ => (SignalType::Unknown, "http_other"),
        };
        return NormalizedSignal {
            signal,
            reason_code: Some(reason.to_string()),
            status_code: Some(status),
            raw_message,
        };
    }

    NormalizedSignal {
        signal: SignalType::Unknown,
        reason_code: None,
        status_code: None,
        raw_message,
    }
}

fn compose_message(error: &ErrorShape) -> Option<String> {
    let message = error.message.as_deref().unwrap_or("");
    let body = error.response_body.as_deref().unwrap_or("");
    if message.is_empty() && body.is_empty() {
        return None;
    }
    let combined = if message.is_empty() {
        body.to_string()
    } else if body.is_empty() {
        message.to_string()
    } else {
        format!("{message}: {body}")
    };
    let mut redacted = redact_text(&combined);
    redacted.truncate(500);
    Some(redacted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preset_signal_passes_through() {
        let error = ErrorShape {
            preset: Some(SignalType::RateLimited),
            status: Some(500),
            ..Default::default()
        };
        assert_eq!(normalize_error(&error).signal, SignalType::RateLimited);
    }

    #[test]
    fn ban_marker_beats_status_routing() {
        let error = ErrorShape::from_status(403, "{\"error\":\"account is banned\"}");
        let signal = normalize_error(&error);
        assert_eq!(signal.signal, SignalType::Banned);
        assert_eq!(signal.reason_code.as_deref(), Some("ban_marker"));
    }

    #[test]
    fn suspension_reason_tracks_status() {
        let s423 = normalize_error(&ErrorShape::from_status(423, "account suspended"));
        assert_eq!(s423.signal, SignalType::Suspended);
        assert_eq!(s423.reason_code.as_deref(), Some("http_423"));

        let s403 = normalize_error(&ErrorShape::from_status(403, "account suspended"));
        assert_eq!(s403.reason_code.as_deref(), Some("http_403"));
    }

    #[test]
    fn transient_codes_win_over_status() {
        let error = ErrorShape {
            status: Some(502),
            code: Some("ECONNRESET".to_string()),
            ..Default::default()
        };
        let signal = normalize_error(&error);
        assert_eq!(signal.signal, SignalType::NetworkTransient);
        assert_eq!(signal.reason_code.as_deref(), Some("econnreset"));
    }

    #[test]
    fn status_table_routes_the_rest() {
        for (status, expected) in [
            (401, SignalType::AuthInvalid),
            (402, SignalType::QuotaExceeded),
            (403, SignalType::AuthInvalid),
            (423, SignalType::Suspended),
            (429, SignalType::RateLimited),
            (503, SignalType::NetworkTransient),
            (418, SignalType::Unknown),
        ] {
            let signal = normalize_error(&ErrorShape::from_status(status, ""));
            assert_eq!(signal.signal, expected, "status {status}");
        }
    }

    #[test]
    fn raw_message_is_redacted() {
        let error = ErrorShape {
            message: Some("proxy https://user:pw@egress failed".to_string()),
            ..Default::default()
        };
        let signal = normalize_error(&error);
        assert_eq!(
            signal.raw_message.as_deref(),
            Some("proxy https://***@egress failed")
        );
    }
}
