//! Provider account policy: classified signal + provider identity -> a
//! concrete action for the dispatcher and the pool manager.

use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use aigw_risk::{NormalizedSignal, SignalType};

use crate::credential::AuthMethod;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyAction {
    None,
    RefreshThenRetry,
    Cooldown,
    Quarantine,
    SwitchCredential,
    RetrySame,
}

#[derive(Debug, Clone, Copy)]
pub struct CooldownDefaults {
    pub quota: time::Duration,
    pub rate_limit: time::Duration,
}

impl Default for CooldownDefaults {
    fn default() -> Self {
        Self {
            quota: time::Duration::minutes(5),
            rate_limit: time::Duration::seconds(30),
        }
    }
}

/// Explicit per-error overrides an adapter may attach.
#[derive(Debug, Clone, Copy, Default)]
pub struct PolicyHints {
    pub should_switch_credential: Option<bool>,
    pub mark_need_refresh: Option<bool>,
    pub skip_error_count: Option<bool>,
    pub retryable: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct PolicyInput<'a> {
    pub signal: &'a NormalizedSignal,
    pub auth_method: AuthMethod,
    pub retry_attempt: u32,
    /// Lower-cased response header pairs, for retry hints.
    pub headers: &'a [(String, String)],
    pub defaults: CooldownDefaults,
    pub hints: PolicyHints,
    /// Set when the pool already quarantined this credential for the same
    /// failure (e.g. during a health probe).
    pub already_marked_unhealthy: bool,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct PolicyDecision {
    pub action: PolicyAction,
    pub should_switch_credential: bool,
    pub should_refresh_credential: bool,
    pub mark_need_refresh: bool,
    pub mark_unhealthy: bool,
    pub mark_unhealthy_immediately: bool,
    #[serde(skip_serializing_if = "Option::is_none", with = "time::serde::rfc3339::option")]
    pub cooldown_until: Option<OffsetDateTime>,
    pub retryable: bool,
    pub skip_error_count: bool,
    pub already_marked_unhealthy: bool,
}

impl PolicyDecision {
    fn base(action: PolicyAction) -> Self {
        Self {
            action,
            should_switch_credential: false,
            should_refresh_credential: false,
            mark_need_refresh: false,
            mark_unhealthy: false,
            mark_unhealthy_immediately: false,
            cooldown_until: None,
            retryable: false,
            skip_error_count: false,
            already_marked_unhealthy: false,
        }
    }
}

pub fn decide(input: &PolicyInput<'_>) -> PolicyDecision {
    let mut decision = match input.signal.signal {
        SignalType::AuthInvalid | SignalType::ProviderNeedsRefresh => {
            if input.auth_method.is_refreshable() {
                let mut d = PolicyDecision::base(PolicyAction::RefreshThenRetry);
                d.should_refresh_credential = true;
                d.mark_need_refresh = true;
                d.retryable = true;
                d.skip_error_count = true;
                d
            } else {
                // A bearer key cannot be refreshed; the credential is dead.
                let mut d = PolicyDecision::base(PolicyAction::Quarantine);
                d.mark_unhealthy = true;
                d.mark_unhealthy_immediately = true;
                d.should_switch_credential = true;
                d.retryable = true;
                d
            }
        }
        SignalType::QuotaExceeded => {
            let mut d = PolicyDecision::base(PolicyAction::Cooldown);
            d.cooldown_until = Some(
                parse_cooldown_headers(input.headers)
                    .unwrap_or_else(|| OffsetDateTime::now_utc() + input.defaults.quota),
            );
            d.should_switch_credential = true;
            d.retryable = true;
            d
        }
        SignalType::RateLimited => {
            let mut d = PolicyDecision::base(PolicyAction::Cooldown);
            d.cooldown_until = Some(
                parse_cooldown_headers(input.headers)
                    .unwrap_or_else(|| OffsetDateTime::now_utc() + input.defaults.rate_limit),
            );
            d.should_switch_credential = true;
            d.retryable = true;
            d
        }
        SignalType::Suspended | SignalType::Banned => {
            let mut d = PolicyDecision::base(PolicyAction::Quarantine);
            d.mark_unhealthy = true;
            d.mark_unhealthy_immediately = true;
            d.retryable = false;
            d
        }
        SignalType::NetworkTransient => {
            if input.retry_attempt == 0 {
                let mut d = PolicyDecision::base(PolicyAction::RetrySame);
                d.retryable = true;
                d.skip_error_count = true;
                d
            } else {
                let mut d = PolicyDecision::base(PolicyAction::SwitchCredential);
                d.should_switch_credential = true;
                d.retryable = true;
                d
            }
        }
        SignalType::Unknown => {
            if input
                .signal
                .status_code
                .is_some_and(|status| (500..600).contains(&status))
            {
                let mut d = PolicyDecision::base(PolicyAction::SwitchCredential);
                d.should_switch_credential = true;
                d.retryable = true;
                d
            } else {
                PolicyDecision::base(PolicyAction::None)
            }
        }
        _ => PolicyDecision::base(PolicyAction::None),
    };

    // Explicit hints win over the table.
    if let Some(switch) = input.hints.should_switch_credential {
        decision.should_switch_credential = switch;
        if switch && decision.action == PolicyAction::None {
            decision.action = PolicyAction::SwitchCredential;
        }
    }
    if let Some(refresh) = input.hints.mark_need_refresh {
        decision.mark_need_refresh = refresh;
    }
    if let Some(skip) = input.hints.skip_error_count {
        decision.skip_error_count = skip;
    }
    if let Some(retryable) = input.hints.retryable {
        decision.retryable = retryable;
    }
    decision.already_marked_unhealthy = input.already_marked_unhealthy;
    if input.already_marked_unhealthy {
        decision.mark_unhealthy = false;
        decision.mark_unhealthy_immediately = false;
    }
    decision
}

/// Cooldown end from response headers: `retry-after` (seconds or HTTP
/// date) and `x-ratelimit-reset` (seconds, epoch seconds or ISO-8601).
pub fn parse_cooldown_headers(headers: &[(String, String)]) -> Option<OffsetDateTime> {
    let get = |name: &str| {
        headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.trim())
    };

    if let Some(value) = get("retry-after") {
        if let Ok(seconds) = value.parse::<i64>() {
            return Some(OffsetDateTime::now_utc() + time::Duration::seconds(seconds));
        }
        if let Ok(at) = OffsetDateTime::parse(value, &Rfc3339) {
            return Some(at);
        }
    }

    if let Some(value) = get("x-ratelimit-reset") {
        if let Ok(number) = value.parse::<i64>() {
            // Values over ~2001-09-09 are epoch seconds, smaller ones are a
            // relative offset.
            return Some(if number > 1_000_000_000 {
                OffsetDateTime::from_unix_timestamp(number).ok()?
            } else {
                OffsetDateTime::now_utc() + time::Duration::seconds(number)
            });
        }
        if let Ok(at) = OffsetDateTime::parse(value, &Rfc3339) {
            return Some(at);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(kind: SignalType, status: Option<u16>) -> NormalizedSignal {
        NormalizedSignal {
            signal: kind,
            reason_code: None,
            status_code: status,
            raw_message: None,
        }
    }

    fn input<'a>(
        signal: &'a NormalizedSignal,
        auth: AuthMethod,
        attempt: u32,
        headers: &'a [(String, String)],
    ) -> PolicyInput<'a> {
        PolicyInput {
            signal,
            auth_method: auth,
            retry_attempt: attempt,
            headers,
            defaults: CooldownDefaults::default(),
            hints: PolicyHints::default(),
            already_marked_unhealthy: false,
        }
    }

    #[test]
    fn auth_invalid_on_oauth_refreshes_then_retries() {
        let s = signal(SignalType::AuthInvalid, Some(401));
        let d = decide(&input(&s, AuthMethod::Oauth2, 0, &[]));
        assert_eq!(d.action, PolicyAction::RefreshThenRetry);
        assert!(d.should_refresh_credential && d.mark_need_refresh);
        assert!(d.retryable && d.skip_error_count);
        assert!(!d.should_switch_credential);
    }

    #[test]
    fn auth_invalid_on_bearer_quarantines_immediately() {
        let s = signal(SignalType::AuthInvalid, Some(401));
        let d = decide(&input(&s, AuthMethod::Bearer, 0, &[]));
        assert_eq!(d.action, PolicyAction::Quarantine);
        assert!(d.mark_unhealthy_immediately);
        assert!(d.should_switch_credential);
    }

    #[test]
    fn retry_after_header_sets_the_cooldown_end() {
        let s = signal(SignalType::RateLimited, Some(429));
        let headers = vec![("retry-after".to_string(), "30".to_string())];
        let d = decide(&input(&s, AuthMethod::Bearer, 0, &headers));
        assert_eq!(d.action, PolicyAction::Cooldown);
        let until = d.cooldown_until.unwrap();
        let delta = until - OffsetDateTime::now_utc();
        assert!(delta > time::Duration::seconds(28) && delta < time::Duration::seconds(32));
    }

    #[test]
    fn ratelimit_reset_accepts_epoch_and_relative() {
        let relative = parse_cooldown_headers(&[(
            "x-ratelimit-reset".to_string(),
            "60".to_string(),
        )])
        .unwrap();
        assert!(relative > OffsetDateTime::now_utc() + time::Duration::seconds(58));

        let epoch = OffsetDateTime::now_utc().unix_timestamp() + 120;
        let absolute = parse_cooldown_headers(&[(
            "x-ratelimit-reset".to_string(),
            epoch.to_string(),
        )])
        .unwrap();
        assert_eq!(absolute.unix_timestamp(), epoch);
    }

    #[test]
    fn network_transient_retries_same_then_switches() {
        let s = signal(SignalType::NetworkTransient, None);
        let first = decide(&input(&s, AuthMethod::Bearer, 0, &[]));
        assert_eq!(first.action, PolicyAction::RetrySame);
        let second = decide(&input(&s, AuthMethod::Bearer, 1, &[]));
        assert_eq!(second.action, PolicyAction::SwitchCredential);
    }

    #[test]
    fn banned_is_never_retryable() {
        let s = signal(SignalType::Banned, Some(403));
        let d = decide(&input(&s, AuthMethod::Oauth2, 0, &[]));
        assert_eq!(d.action, PolicyAction::Quarantine);
        assert!(!d.retryable);
    }

    #[test]
    fn unknown_5xx_switches_credential() {
        let s = signal(SignalType::Unknown, Some(502));
        let d = decide(&input(&s, AuthMethod::Bearer, 0, &[]));
        assert_eq!(d.action, PolicyAction::SwitchCredential);
    }

    #[test]
    fn hints_override_the_table() {
        let s = signal(SignalType::Unknown, None);
        let mut i = input(&s, AuthMethod::Bearer, 0, &[]);
        i.hints.should_switch_credential = Some(true);
        i.hints.retryable = Some(true);
        let d = decide(&i);
        assert_eq!(d.action, PolicyAction::SwitchCredential);
        assert!(d.retryable);
    }
}
