//! Pure policy engine: (state, signal, context) -> next state + decision.
//! Never performs I/O.

use serde::{Deserialize, Serialize};

use aigw_common::RiskMode;

use crate::signal::SignalType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Healthy,
    NeedsRefresh,
    Cooldown,
    Quarantined,
    Suspended,
    Banned,
    Disabled,
    Unknown,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Healthy => "healthy",
            LifecycleState::NeedsRefresh => "needs_refresh",
            LifecycleState::Cooldown => "cooldown",
            LifecycleState::Quarantined => "quarantined",
            LifecycleState::Suspended => "suspended",
            LifecycleState::Banned => "banned",
            LifecycleState::Disabled => "disabled",
            LifecycleState::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    ObserveOnly,
    Transition,
    NoStateChange,
    ControlAction,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EvalContext {
    pub mode: Option<RiskMode>,
    /// Target state for manual_release; anything else falls back to healthy.
    pub target_state: Option<LifecycleState>,
    /// Marks evaluations triggered by operator mutations.
    pub control_action: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub decision: Decision,
    pub previous_state: LifecycleState,
    pub next_state: LifecycleState,
    pub changed: bool,
    pub mode: RiskMode,
}

/// Signal -> target-state table.  `None` means "stay where you are".
fn target_state(
    current: LifecycleState,
    signal: SignalType,
    ctx: &EvalContext,
) -> Option<LifecycleState> {
    match signal {
        SignalType::Success
        | SignalType::ProviderMarkedHealthy
        | SignalType::ProviderEnabled => Some(LifecycleState::Healthy),
        SignalType::ManualRelease => Some(match ctx.target_state {
            Some(LifecycleState::Healthy) => LifecycleState::Healthy,
            Some(LifecycleState::NeedsRefresh) => LifecycleState::NeedsRefresh,
            _ => LifecycleState::Healthy,
        }),
        SignalType::AuthInvalid | SignalType::ProviderNeedsRefresh => {
            Some(LifecycleState::NeedsRefresh)
        }
        SignalType::QuotaExceeded => Some(LifecycleState::Cooldown),
        SignalType::RateLimited
        | SignalType::NetworkTransient
        | SignalType::IdentityCollision
        | SignalType::Unknown => None,
        SignalType::Suspended => Some(LifecycleState::Suspended),
        SignalType::Banned => Some(LifecycleState::Banned),
        SignalType::ProviderDisabled => Some(LifecycleState::Disabled),
        SignalType::ProviderMarkedUnhealthy => {
            if matches!(current, LifecycleState::Healthy | LifecycleState::Unknown) {
                Some(LifecycleState::Quarantined)
            } else {
                None
            }
        }
    }
}

pub fn evaluate(current: LifecycleState, signal: SignalType, ctx: &EvalContext) -> Evaluation {
    let mode = ctx.mode.unwrap_or(RiskMode::EnforceSoft);

    // Disabled sticks until an explicit enable.
    let next = if current == LifecycleState::Disabled && signal != SignalType::ProviderEnabled {
        current
    } else {
        target_state(current, signal, ctx).unwrap_or(current)
    };
    let changed = next != current;

    let decision = if ctx.control_action {
        Decision::ControlAction
    } else if mode == RiskMode::Observe {
        Decision::ObserveOnly
    } else if changed {
        Decision::Transition
    } else {
        Decision::NoStateChange
    };

    Evaluation {
        decision,
        previous_state: current,
        next_state: if mode == RiskMode::Observe && !ctx.control_action {
            current
        } else {
            next
        },
        changed: if mode == RiskMode::Observe && !ctx.control_action {
            false
        } else {
            changed
        },
        mode,
    }
}

/// Mode-gated answer to "may I dispatch on this credential now?".
pub fn is_blocked(mode: RiskMode, state: LifecycleState) -> bool {
    match mode {
        RiskMode::Observe => false,
        RiskMode::EnforceSoft => matches!(
            state,
            LifecycleState::Suspended | LifecycleState::Banned
        ),
        RiskMode::EnforceStrict => matches!(
            state,
            LifecycleState::Suspended
                | LifecycleState::Banned
                | LifecycleState::Disabled
                | LifecycleState::Quarantined
        ),
        RiskMode::ProtectiveEmergency => state != LifecycleState::Healthy,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(mode: RiskMode) -> EvalContext {
        EvalContext {
            mode: Some(mode),
            ..Default::default()
        }
    }

    #[test]
    fn success_recovers_to_healthy() {
        let eval = evaluate(
            LifecycleState::NeedsRefresh,
            SignalType::Success,
            &ctx(RiskMode::EnforceSoft),
        );
        assert_eq!(eval.next_state, LifecycleState::Healthy);
        assert_eq!(eval.decision, Decision::Transition);
        assert!(eval.changed);
    }

    #[test]
    fn rate_limited_does_not_change_state() {
        let eval = evaluate(
            LifecycleState::Healthy,
            SignalType::RateLimited,
            &ctx(RiskMode::EnforceSoft),
        );
        assert_eq!(eval.next_state, LifecycleState::Healthy);
        assert_eq!(eval.decision, Decision::NoStateChange);
    }

    #[test]
    fn observe_mode_evaluates_but_does_not_enforce() {
        let eval = evaluate(
            LifecycleState::Healthy,
            SignalType::Banned,
            &ctx(RiskMode::Observe),
        );
        assert_eq!(eval.decision, Decision::ObserveOnly);
        assert_eq!(eval.next_state, LifecycleState::Healthy);
        assert!(!eval.changed);
    }

    #[test]
    fn disabled_overrides_everything_but_enable() {
        let eval = evaluate(
            LifecycleState::Disabled,
            SignalType::Success,
            &ctx(RiskMode::EnforceSoft),
        );
        assert_eq!(eval.next_state, LifecycleState::Disabled);

        let eval = evaluate(
            LifecycleState::Disabled,
            SignalType::ProviderEnabled,
            &ctx(RiskMode::EnforceSoft),
        );
        assert_eq!(eval.next_state, LifecycleState::Healthy);
    }

    #[test]
    fn marked_unhealthy_only_quarantines_from_healthy_or_unknown() {
        let eval = evaluate(
            LifecycleState::Healthy,
            SignalType::ProviderMarkedUnhealthy,
            &ctx(RiskMode::EnforceSoft),
        );
        assert_eq!(eval.next_state, LifecycleState::Quarantined);

        let eval = evaluate(
            LifecycleState::Suspended,
            SignalType::ProviderMarkedUnhealthy,
            &ctx(RiskMode::EnforceSoft),
        );
        assert_eq!(eval.next_state, LifecycleState::Suspended);
    }

    #[test]
    fn manual_release_honors_valid_targets_only() {
        let mut context = ctx(RiskMode::EnforceSoft);
        context.target_state = Some(LifecycleState::NeedsRefresh);
        let eval = evaluate(LifecycleState::Quarantined, SignalType::ManualRelease, &context);
        assert_eq!(eval.next_state, LifecycleState::NeedsRefresh);

        context.target_state = Some(LifecycleState::Banned);
        let eval = evaluate(LifecycleState::Quarantined, SignalType::ManualRelease, &context);
        assert_eq!(eval.next_state, LifecycleState::Healthy);
    }

    #[test]
    fn blocking_tightens_with_mode() {
        assert!(!is_blocked(RiskMode::Observe, LifecycleState::Banned));
        assert!(is_blocked(RiskMode::EnforceSoft, LifecycleState::Banned));
        assert!(!is_blocked(RiskMode::EnforceSoft, LifecycleState::Quarantined));
        assert!(is_blocked(RiskMode::EnforceStrict, LifecycleState::Quarantined));
        assert!(is_blocked(
            RiskMode::ProtectiveEmergency,
            LifecycleState::Cooldown
        ));
        assert!(!is_blocked(
            RiskMode::ProtectiveEmergency,
            LifecycleState::Healthy
        ));
    }
}
