//! Risk manager: the single mediator between observations, the policy
//! engine and the lifecycle store.  Callers never consult lifecycle state
//! directly; they ask for an admission decision.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::{Mutex, RwLock};
use tracing::info;

use aigw_common::{CredentialId, RiskMode};

use crate::policy::{self, Decision, EvalContext, Evaluation, LifecycleState};
use crate::signal::{ErrorShape, NormalizedSignal, SignalType, normalize_error};
use crate::store::{LifecycleEvent, LifecycleRecord, LifecycleStore};

#[derive(Debug, Clone, Default)]
pub struct ObserveCtx {
    pub source: Option<String>,
    pub request_id: Option<String>,
    pub streamed: bool,
    pub model: Option<String>,
    pub identity_profile_id: Option<String>,
    /// Cooldown end hint, usually derived from response headers.
    pub cooldown_until: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdmissionDecision {
    pub blocked: bool,
    pub mode: RiskMode,
    pub lifecycle_state: LifecycleState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ManualReleaseRequest {
    pub credential: CredentialId,
    pub target_state: LifecycleState,
    pub reason: String,
    pub confirm_credential_id: String,
    pub force: bool,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ManualReleaseError {
    #[error("credential is not tracked")]
    UnknownCredential,
    #[error("state {0:?} cannot be manually released")]
    StateNotReleasable(LifecycleState),
    #[error("target state {0:?} is not a valid release target")]
    InvalidTarget(LifecycleState),
    #[error("release reason must be at least 8 characters")]
    ReasonTooShort,
    #[error("confirmation id does not match the credential")]
    ConfirmMismatch,
    #[error("force=true required: {0}")]
    ForceRequired(&'static str),
}

struct IdentityClaim {
    provider_type: String,
    uuid: String,
    last_seen: OffsetDateTime,
}

pub struct RiskManager {
    store: Arc<LifecycleStore>,
    mode: RwLock<RiskMode>,
    identity_window: RwLock<Duration>,
    identity: Mutex<HashMap<String, IdentityClaim>>,
}

impl RiskManager {
    pub fn new(store: Arc<LifecycleStore>, mode: RiskMode, identity_window: Duration) -> Self {
        Self {
            store,
            mode: RwLock::new(mode),
            identity_window: RwLock::new(identity_window),
            identity: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<LifecycleStore> {
        &self.store
    }

    pub async fn mode(&self) -> RiskMode {
        *self.mode.read().await
    }

    pub async fn update_policy_config(&self, mode: Option<RiskMode>, window: Option<Duration>) {
        if let Some(mode) = mode {
            *self.mode.write().await = mode;
        }
        if let Some(window) = window {
            *self.identity_window.write().await = window;
        }
    }

    pub async fn observe_success(&self, credential: &CredentialId, ctx: &ObserveCtx) -> Evaluation {
        self.observe_signal(
            credential,
            NormalizedSignal {
                signal: SignalType::Success,
                reason_code: None,
                status_code: None,
                raw_message: None,
            },
            ctx,
        )
        .await
    }

    pub async fn observe_error(
        &self,
        credential: &CredentialId,
        error: &ErrorShape,
        ctx: &ObserveCtx,
    ) -> Evaluation {
        let signal = normalize_error(error);
        self.observe_signal(credential, signal, ctx).await
    }

    pub async fn observe_signal(
        &self,
        credential: &CredentialId,
        signal: NormalizedSignal,
        ctx: &ObserveCtx,
    ) -> Evaluation {
        self.apply(credential, signal, ctx, EvalContext::default(), None)
            .await
    }

    /// Operator mutations (enable/disable/mark-*) route through here so the
    /// event log distinguishes them from live traffic.
    pub async fn record_control_plane_action(
        &self,
        credential: &CredentialId,
        signal: SignalType,
        ctx: &ObserveCtx,
    ) -> Evaluation {
        self.apply(
            credential,
            NormalizedSignal {
                signal,
                reason_code: Some("control_plane".to_string()),
                status_code: None,
                raw_message: None,
            },
            ctx,
            EvalContext {
                control_action: true,
                ..Default::default()
            },
            None,
        )
        .await
    }

    /// Sliding-window detection of two credentials claiming one remote
    /// identity.  The collision signal lands on the *newly observed*
    /// credential and never changes state.
    pub async fn observe_identity_claim(
        &self,
        credential: &CredentialId,
        profile_id: &str,
        ctx: &ObserveCtx,
    ) -> Option<Evaluation> {
        let window = *self.identity_window.read().await;
        let now = OffsetDateTime::now_utc();
        let mut claims = self.identity.lock().await;

        // Entries older than twice the window are dead weight.
        let horizon = now - time::Duration::try_from(window * 2).unwrap_or(time::Duration::ZERO);
        claims.retain(|_, claim| claim.last_seen >= horizon);

        let collided_with = match claims.get(profile_id) {
            Some(existing)
                if (existing.provider_type != credential.provider_type
                    || existing.uuid != credential.uuid)
                    && now - existing.last_seen
                        <= time::Duration::try_from(window).unwrap_or(time::Duration::ZERO) =>
            {
                Some(format!("{}:{}", existing.provider_type, existing.uuid))
            }
            _ => None,
        };

        claims.insert(
            profile_id.to_string(),
            IdentityClaim {
                provider_type: credential.provider_type.clone(),
                uuid: credential.uuid.clone(),
                last_seen: now,
            },
        );
        drop(claims);

        let collided_with = collided_with?;
        let mut ctx = ctx.clone();
        ctx.identity_profile_id = Some(profile_id.to_string());
        Some(
            self.apply(
                credential,
                NormalizedSignal {
                    signal: SignalType::IdentityCollision,
                    reason_code: Some("identity_window".to_string()),
                    status_code: None,
                    raw_message: None,
                },
                &ctx,
                EvalContext::default(),
                Some(collided_with),
            )
            .await,
        )
    }

    pub async fn admission(&self, credential: &CredentialId) -> AdmissionDecision {
        let mode = *self.mode.read().await;
        let record = self.store.get_credential(&credential.canonical()).await;
        let (state, cooldown_until) = match &record {
            Some(record) => (record.lifecycle_state, record.cooldown_until),
            None => (LifecycleState::Unknown, None),
        };

        // An elapsed cooldown no longer blocks; the state machine clears it
        // on the next observation.
        let effective = if state == LifecycleState::Cooldown
            && cooldown_until.is_none_or(|until| until <= OffsetDateTime::now_utc())
        {
            LifecycleState::Healthy
        } else {
            state
        };

        let blocked = policy::is_blocked(mode, effective);
        AdmissionDecision {
            blocked,
            mode,
            lifecycle_state: state,
            reason: blocked.then(|| format!("state {} blocked in {mode:?}", state.as_str())),
        }
    }

    pub async fn manual_release(
        &self,
        request: &ManualReleaseRequest,
    ) -> Result<Evaluation, ManualReleaseError> {
        let canonical = request.credential.canonical();
        let record = self
            .store
            .get_credential(&canonical)
            .await
            .ok_or(ManualReleaseError::UnknownCredential)?;

        let releasable = matches!(
            record.lifecycle_state,
            LifecycleState::Quarantined
                | LifecycleState::Suspended
                | LifecycleState::Banned
                | LifecycleState::Cooldown
                | LifecycleState::NeedsRefresh
        );
        if !releasable {
            return Err(ManualReleaseError::StateNotReleasable(
                record.lifecycle_state,
            ));
        }
        if !matches!(
            request.target_state,
            LifecycleState::Healthy | LifecycleState::NeedsRefresh
        ) {
            return Err(ManualReleaseError::InvalidTarget(request.target_state));
        }
        if request.reason.trim().len() < 8 {
            return Err(ManualReleaseError::ReasonTooShort);
        }
        if request.confirm_credential_id != canonical {
            return Err(ManualReleaseError::ConfirmMismatch);
        }
        if !request.force {
            match record.lifecycle_state {
                LifecycleState::Suspended | LifecycleState::Banned => {
                    return Err(ManualReleaseError::ForceRequired(
                        "releasing from suspended/banned",
                    ));
                }
                LifecycleState::Cooldown
                    if record
                        .cooldown_until
                        .is_some_and(|until| until > OffsetDateTime::now_utc()) =>
                {
                    return Err(ManualReleaseError::ForceRequired(
                        "cooldown has not elapsed",
                    ));
                }
                _ => {}
            }
        }

        let ctx = ObserveCtx {
            source: Some("manual_release".to_string()),
            ..Default::default()
        };
        Ok(self
            .apply(
                &request.credential,
                NormalizedSignal {
                    signal: SignalType::ManualRelease,
                    reason_code: Some(request.reason.clone()),
                    status_code: None,
                    raw_message: None,
                },
                &ctx,
                EvalContext {
                    target_state: Some(request.target_state),
                    ..Default::default()
                },
                None,
            )
            .await)
    }

    async fn apply(
        &self,
        credential: &CredentialId,
        signal: NormalizedSignal,
        ctx: &ObserveCtx,
        mut eval_ctx: EvalContext,
        collided_with: Option<String>,
    ) -> Evaluation {
        let canonical = credential.canonical();
        let mode = *self.mode.read().await;
        eval_ctx.mode = Some(mode);

        let current = self
            .store
            .get_credential(&canonical)
            .await
            .map(|record| record.lifecycle_state)
            .unwrap_or(LifecycleState::Unknown);

        let evaluation = policy::evaluate(current, signal.signal, &eval_ctx);

        let enforce = evaluation.decision != Decision::ObserveOnly;
        if enforce || current == LifecycleState::Unknown {
            let mut record = LifecycleRecord::new(&canonical, evaluation.next_state);
            // Cooldown bookkeeping: set only on rate/quota signals, cleared
            // whenever the state leaves cooldown.
            record.cooldown_until = match signal.signal {
                SignalType::QuotaExceeded | SignalType::RateLimited => ctx.cooldown_until,
                _ if evaluation.next_state != LifecycleState::Cooldown => None,
                _ => self
                    .store
                    .get_credential(&canonical)
                    .await
                    .and_then(|record| record.cooldown_until),
            };
            record.last_signal_type = Some(signal.signal);
            record.last_reason_code = signal.reason_code.clone();
            record.last_status_code = signal.status_code;
            record.last_source = ctx.source.clone();
            record.last_error_message = signal.raw_message.clone();
            if let Some(profile) = &ctx.identity_profile_id {
                record.metadata.insert(
                    "identityProfileId".to_string(),
                    serde_json::json!(profile),
                );
            }
            self.store.upsert_credential(record).await;
        }

        let event = LifecycleEvent {
            event_id: String::new(),
            at: OffsetDateTime::now_utc(),
            credential_id: canonical.clone(),
            signal_type: signal.signal,
            reason_code: signal.reason_code,
            status_code: signal.status_code,
            source: ctx.source.clone(),
            mode,
            decision: evaluation.decision,
            previous_state: evaluation.previous_state,
            next_state: evaluation.next_state,
            changed: evaluation.changed,
            request_id: ctx.request_id.clone(),
            streamed: ctx.streamed,
            model: ctx.model.clone(),
            raw_message: signal.raw_message,
            identity_profile_id: ctx.identity_profile_id.clone(),
            collided_with,
        };
        self.store.append_event(event).await;

        if evaluation.changed {
            info!(
                event = "risk.transition",
                credential = %canonical,
                signal = signal.signal.as_str(),
                from = evaluation.previous_state.as_str(),
                to = evaluation.next_state.as_str(),
            );
        }
        evaluation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EventFilter;

    fn manager(dir: &tempfile::TempDir, mode: RiskMode) -> RiskManager {
        let store = LifecycleStore::new(dir.path().join("lifecycle.json"));
        RiskManager::new(store, mode, Duration::from_secs(600))
    }

    fn cred(uuid: &str) -> CredentialId {
        CredentialId::new("kiro-oauth", uuid)
    }

    #[tokio::test]
    async fn auth_error_moves_credential_to_needs_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let risk = manager(&dir, RiskMode::EnforceSoft);
        let error = ErrorShape::from_status(401, "{\"error\":\"expired\"}");
        let eval = risk
            .observe_error(&cred("a"), &error, &ObserveCtx::default())
            .await;
        assert_eq!(eval.next_state, LifecycleState::NeedsRefresh);
        assert!(eval.changed);

        let decision = risk.admission(&cred("a")).await;
        assert!(!decision.blocked);
        assert_eq!(decision.lifecycle_state, LifecycleState::NeedsRefresh);
    }

    #[tokio::test]
    async fn banned_blocks_admission_in_enforce_soft() {
        let dir = tempfile::tempdir().unwrap();
        let risk = manager(&dir, RiskMode::EnforceSoft);
        let error = ErrorShape::from_status(403, "your account is banned");
        risk.observe_error(&cred("a"), &error, &ObserveCtx::default())
            .await;
        let decision = risk.admission(&cred("a")).await;
        assert!(decision.blocked);
        assert_eq!(decision.lifecycle_state, LifecycleState::Banned);
    }

    #[tokio::test]
    async fn elapsed_cooldown_does_not_block() {
        let dir = tempfile::tempdir().unwrap();
        let risk = manager(&dir, RiskMode::ProtectiveEmergency);
        let ctx = ObserveCtx {
            cooldown_until: Some(OffsetDateTime::now_utc() - time::Duration::seconds(5)),
            ..Default::default()
        };
        risk.observe_signal(
            &cred("a"),
            NormalizedSignal {
                signal: SignalType::QuotaExceeded,
                reason_code: Some("http_402".to_string()),
                status_code: Some(402),
                raw_message: None,
            },
            &ctx,
        )
        .await;
        let decision = risk.admission(&cred("a")).await;
        assert!(!decision.blocked);
    }

    #[tokio::test]
    async fn identity_collision_fires_once_and_preserves_state() {
        let dir = tempfile::tempdir().unwrap();
        let risk = manager(&dir, RiskMode::EnforceSoft);
        risk.observe_success(&cred("a"), &ObserveCtx::default()).await;
        risk.observe_success(&cred("b"), &ObserveCtx::default()).await;

        let first = risk
            .observe_identity_claim(&cred("a"), "P1", &ObserveCtx::default())
            .await;
        assert!(first.is_none());

        let second = risk
            .observe_identity_claim(&cred("b"), "P1", &ObserveCtx::default())
            .await;
        let eval = second.expect("collision expected");
        assert!(!eval.changed);

        let events = risk
            .store()
            .get_recent_events(&EventFilter {
                signal_type: Some(SignalType::IdentityCollision),
                ..Default::default()
            })
            .await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].credential_id, "kiro-oauth:b");
        assert_eq!(events[0].collided_with.as_deref(), Some("kiro-oauth:a"));

        for uuid in ["a", "b"] {
            let record = risk
                .store()
                .get_credential(&format!("kiro-oauth:{uuid}"))
                .await
                .unwrap();
            assert_eq!(record.lifecycle_state, LifecycleState::Healthy);
        }
    }

    #[tokio::test]
    async fn manual_release_boundary_checks() {
        let dir = tempfile::tempdir().unwrap();
        let risk = manager(&dir, RiskMode::EnforceSoft);
        risk.observe_error(
            &cred("a"),
            &ErrorShape::from_status(403, "account suspended"),
            &ObserveCtx::default(),
        )
        .await;

        let base = ManualReleaseRequest {
            credential: cred("a"),
            target_state: LifecycleState::Healthy,
            reason: "operator verified".to_string(),
            confirm_credential_id: "kiro-oauth:a".to_string(),
            force: true,
        };

        let mut short = base.clone();
        short.reason = "nope".to_string();
        assert_eq!(
            risk.manual_release(&short).await.unwrap_err(),
            ManualReleaseError::ReasonTooShort
        );

        let mut mismatch = base.clone();
        mismatch.confirm_credential_id = "kiro-oauth:b".to_string();
        assert_eq!(
            risk.manual_release(&mismatch).await.unwrap_err(),
            ManualReleaseError::ConfirmMismatch
        );

        let mut unforced = base.clone();
        unforced.force = false;
        assert!(matches!(
            risk.manual_release(&unforced).await.unwrap_err(),
            ManualReleaseError::ForceRequired(_)
        ));

        let eval = risk.manual_release(&base).await.unwrap();
        assert_eq!(eval.next_state, LifecycleState::Healthy);
        assert_eq!(eval.decision, Decision::Transition);
    }

    #[tokio::test]
    async fn manual_release_rejects_healthy_credential() {
        let dir = tempfile::tempdir().unwrap();
        let risk = manager(&dir, RiskMode::EnforceSoft);
        risk.observe_success(&cred("a"), &ObserveCtx::default()).await;
        let request = ManualReleaseRequest {
            credential: cred("a"),
            target_state: LifecycleState::Healthy,
            reason: "operator verified".to_string(),
            confirm_credential_id: "kiro-oauth:a".to_string(),
            force: false,
        };
        assert!(matches!(
            risk.manual_release(&request).await.unwrap_err(),
            ManualReleaseError::StateNotReleasable(LifecycleState::Healthy)
        ));
    }
}
