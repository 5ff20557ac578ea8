//! The request dispatcher: endpoint -> dialect -> model -> provider ->
//! adapter -> converted stream or unary response, with bounded failover.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use aigw_common::{CredentialId, GatewayConfig, SystemPromptMode};
use aigw_protocol::{Dialect, claude, gemini, openai_chat, sse};
use aigw_provider_core::{
    AdapterError, ChunkReceiver, CooldownDefaults, MarkOrigin, PolicyAction, PolicyDecision,
    PolicyHints, PolicyInput, ProviderPoolManager, SelectedCredential, ServiceAdapter,
    account_policy,
};
use aigw_provider_impl::AdapterRegistry;
use aigw_risk::{
    LifecycleState, ManualReleaseError, ManualReleaseRequest, ObserveCtx, RiskManager, SignalType,
    signal::normalize_error,
};
use aigw_transform::{StreamLift, StreamLower, StreamPiece, convert_request, convert_response};

use crate::classify::Endpoint;
use crate::error::GatewayError;
use crate::prompt_log::PromptLog;
use crate::route::{brand_tag, route_model, strip_brand_prefix};
use crate::strategy::Strategy;
use crate::telemetry::{RequestSummary, Telemetry};

const MAX_ATTEMPTS: u32 = 3;
const MODEL_LIST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

pub enum DispatchOutput {
    Unary(JsonValue),
    /// Framed SSE bytes, ready to write to the wire.
    Stream(tokio::sync::mpsc::Receiver<Bytes>),
}

pub struct Dispatcher {
    config: Arc<GatewayConfig>,
    risk: Arc<RiskManager>,
    pool: Arc<ProviderPoolManager>,
    registry: Arc<AdapterRegistry>,
    prompt_log: Arc<PromptLog>,
    telemetry: Option<Telemetry>,
}

impl Dispatcher {
    pub fn new(
        config: Arc<GatewayConfig>,
        risk: Arc<RiskManager>,
        pool: Arc<ProviderPoolManager>,
        registry: Arc<AdapterRegistry>,
        prompt_log: Arc<PromptLog>,
    ) -> Self {
        let telemetry = config
            .telemetry_endpoint
            .clone()
            .and_then(Telemetry::new);
        Self {
            config,
            risk,
            pool,
            registry,
            prompt_log,
            telemetry,
        }
    }

    pub fn risk(&self) -> &Arc<RiskManager> {
        &self.risk
    }

    pub fn pool(&self) -> &Arc<ProviderPoolManager> {
        &self.pool
    }

    pub async fn handle_generate(
        &self,
        endpoint: Endpoint,
        body: JsonValue,
        request_id: String,
    ) -> Result<DispatchOutput, GatewayError> {
        let endpoint_dialect = endpoint.dialect();
        let inbound = Strategy::for_dialect(endpoint_dialect);

        let (raw_model, is_stream) = match &endpoint {
            Endpoint::GeminiGenerate { model, stream } => (model.clone(), *stream),
            _ => {
                let info = inbound.extract_model_and_stream_info(&body);
                let model = info
                    .model
                    .ok_or_else(|| GatewayError::bad_request("missing model"))?;
                (model, info.is_stream)
            }
        };
        let (brand, model) = strip_brand_prefix(&raw_model);
        let provider = route_model(
            brand.as_deref(),
            &model,
            &self.pool.snapshot().await,
            &self.config.default_provider,
        );
        info!(
            event = "dispatch.route",
            request_id = %request_id,
            model = %model,
            provider = %provider,
            stream = is_stream,
        );

        self.persist_incoming_system_prompt(&inbound, &body).await;
        self.prompt_log
            .log_input(&inbound.extract_prompt_text(&body))
            .await;

        let mut tried: HashSet<String> = HashSet::new();
        let mut force_refresh = false;
        let mut retry_same: Option<SelectedCredential> = None;
        let mut last_error: Option<GatewayError> = None;

        for attempt in 0..MAX_ATTEMPTS {
            let selected = match retry_same.take() {
                Some(previous) => previous,
                None => {
                    let selected = match self.pool.select(&provider).await {
                        Ok(selected) => selected,
                        Err(err) => {
                            // A pool that is only cooling down is a rate
                            // limit, not an outage.
                            if let Some(recovery) =
                                self.pool.earliest_recovery(&provider).await
                            {
                                let secs = (recovery - time::OffsetDateTime::now_utc())
                                    .whole_seconds()
                                    .max(0) as u64;
                                return Err(GatewayError::rate_limited(
                                    "all credentials cooling down",
                                    Some(secs),
                                ));
                            }
                            return Err(GatewayError::upstream_unavailable(format!(
                                "no usable credential: {err}"
                            )));
                        }
                    };
                    if !tried.insert(selected.config.uuid.clone()) {
                        // The pool has nothing fresh to offer.
                        break;
                    }
                    selected
                }
            };
            let credential_id = selected.credential_id();

            let admission = self.risk.admission(&credential_id).await;
            if admission.blocked {
                debug!(
                    event = "dispatch.blocked",
                    credential = %credential_id,
                    state = admission.lifecycle_state.as_str(),
                );
                last_error = Some(GatewayError::forbidden(format!(
                    "credential blocked: {}",
                    admission.reason.unwrap_or_default()
                )));
                continue;
            }

            let mut credential_config = selected.config.clone();
            if force_refresh {
                credential_config.counters.needs_refresh = true;
            }
            let adapter = self
                .registry
                .build(&provider, credential_config)
                .map_err(|err| GatewayError::internal(err.to_string()))?;
            let adapter_dialect = adapter.dialect();

            let outbound_body = self
                .prepare_body(endpoint_dialect, adapter_dialect, &body)
                .await?;

            let ctx = ObserveCtx {
                source: Some(provider.clone()),
                request_id: Some(request_id.clone()),
                streamed: is_stream,
                model: Some(model.clone()),
                ..Default::default()
            };

            let result: Result<(), AdapterError> = if is_stream {
                match adapter.generate_content_stream(&model, &outbound_body).await {
                    Ok(upstream) => {
                        return Ok(DispatchOutput::Stream(self.pump_stream(
                            upstream,
                            adapter_dialect,
                            endpoint_dialect,
                            model.clone(),
                            provider.clone(),
                            credential_id,
                            ctx,
                            attempt,
                        )));
                    }
                    Err(err) => Err(err),
                }
            } else {
                match adapter.generate_content(&model, &outbound_body).await {
                    Ok(response) => {
                        self.risk.observe_success(&credential_id, &ctx).await;
                        let converted =
                            convert_response(adapter_dialect, endpoint_dialect, &response)
                                .map_err(|err| GatewayError::internal(err.to_string()))?;
                        self.prompt_log
                            .log_output(&inbound.extract_response_text(&converted))
                            .await;
                        self.post_summary(&request_id, &provider, &model, false, true, attempt, None);
                        return Ok(DispatchOutput::Unary(converted));
                    }
                    Err(err) => Err(err),
                }
            };

            let err = result.unwrap_err();
            let (decision, gateway_error) = self
                .absorb_failure(&provider, &selected, &err, &ctx, attempt)
                .await;

            if decision.retryable && attempt + 1 < MAX_ATTEMPTS {
                match decision.action {
                    PolicyAction::RefreshThenRetry => {
                        force_refresh = true;
                        retry_same = Some(selected);
                        continue;
                    }
                    PolicyAction::RetrySame => {
                        retry_same = Some(selected);
                        continue;
                    }
                    _ if decision.should_switch_credential => {
                        last_error = Some(gateway_error);
                        continue;
                    }
                    _ => {}
                }
            }
            self.post_summary(
                &request_id,
                &provider,
                &model,
                is_stream,
                false,
                attempt,
                Some(format!("{:?}", gateway_error.kind)),
            );
            return Err(gateway_error);
        }

        Err(last_error.unwrap_or_else(|| {
            GatewayError::upstream_unavailable("all credentials exhausted")
        }))
    }

    /// Fan out across every configured pool's first selectable credential,
    /// brand-tag the returned names and merge.
    pub async fn handle_model_list(&self, endpoint: &Endpoint) -> Result<JsonValue, GatewayError> {
        let snapshot = self.pool.snapshot().await;
        let now = time::OffsetDateTime::now_utc();
        let mut futures = Vec::new();
        for (provider, entries) in snapshot {
            let Some(entry) = entries.into_iter().find(|entry| entry.is_selectable(now)) else {
                continue;
            };
            let Ok(adapter) = self.registry.build(&provider, entry) else {
                continue;
            };
            futures.push(async move {
                let models = tokio::time::timeout(MODEL_LIST_TIMEOUT, adapter.list_models()).await;
                (provider, models)
            });
        }

        let mut tagged = Vec::new();
        for (provider, outcome) in futures_util::future::join_all(futures).await {
            match outcome {
                Ok(Ok(models)) => {
                    let tag = brand_tag(&provider);
                    for model in models {
                        tagged.push(format!("[{tag}] {model}"));
                    }
                }
                Ok(Err(err)) => {
                    warn!(event = "models.list_failed", provider = %provider, error = %err);
                }
                Err(_) => {
                    warn!(event = "models.list_timeout", provider = %provider);
                }
            }
        }
        tagged.sort();

        let body = match endpoint {
            Endpoint::GeminiModelList => serde_json::to_value(gemini::ListModelsResponse {
                models: tagged
                    .into_iter()
                    .map(|name| gemini::ModelInfo {
                        name: format!("models/{name}"),
                        display_name: None,
                        description: None,
                        supported_generation_methods: Some(vec![
                            "generateContent".to_string(),
                            "streamGenerateContent".to_string(),
                        ]),
                    })
                    .collect(),
            }),
            _ => serde_json::to_value(openai_chat::ListModelsResponse::new(
                tagged
                    .into_iter()
                    .map(|name| openai_chat::ModelObject {
                        id: name,
                        object: "model".to_string(),
                        created: None,
                        owned_by: Some("aigw".to_string()),
                    })
                    .collect(),
            )),
        };
        body.map_err(|err| GatewayError::internal(err.to_string()))
    }

    /// Operator release: risk-side validation and transition, then the pool
    /// mirror, keeping usage counters intact.
    pub async fn manual_release(
        &self,
        request: &ManualReleaseRequest,
    ) -> Result<(), ManualReleaseError> {
        let evaluation = self.risk.manual_release(request).await?;
        let provider = request.credential.provider_type.as_str();
        let uuid = request.credential.uuid.as_str();
        let result = match evaluation.next_state {
            LifecycleState::NeedsRefresh => {
                self.pool
                    .mark_need_refresh(provider, uuid, MarkOrigin::Dispatch)
                    .await
            }
            _ => {
                self.pool
                    .mark_healthy(provider, uuid, true, MarkOrigin::Dispatch)
                    .await
            }
        };
        if let Err(err) = result {
            warn!(event = "release.pool_sync_failed", error = %err);
        }
        Ok(())
    }

    async fn prepare_body(
        &self,
        from: Dialect,
        to: Dialect,
        body: &JsonValue,
    ) -> Result<JsonValue, GatewayError> {
        let mut outbound = convert_request(from, to, body)
            .map_err(|err| GatewayError::bad_request(err.to_string()))?;
        if let Some(path) = &self.config.system_prompt_file
            && let Ok(text) = tokio::fs::read_to_string(path).await
        {
            let mode = self
                .config
                .system_prompt_mode
                .unwrap_or(SystemPromptMode::Overwrite);
            Strategy::for_dialect(to).apply_system_prompt(&mut outbound, text.trim(), mode);
        }
        Ok(outbound)
    }

    async fn persist_incoming_system_prompt(&self, strategy: &Strategy, body: &JsonValue) {
        let Some(prompt) = strategy.extract_system_prompt(body) else {
            return;
        };
        let path = self.config.credentials_dir.join("incoming_system_prompt.txt");
        if let Err(err) = tokio::fs::write(&path, prompt).await {
            debug!(event = "system_prompt.persist_failed", error = %err);
        }
    }

    /// Normalize the failure, update risk + pool, and produce both the policy
    /// decision and the client-visible error.
    async fn absorb_failure(
        &self,
        provider: &str,
        selected: &SelectedCredential,
        err: &AdapterError,
        ctx: &ObserveCtx,
        attempt: u32,
    ) -> (PolicyDecision, GatewayError) {
        let credential_id = selected.credential_id();
        let shape = err.to_error_shape();
        let signal = normalize_error(&shape);

        let headers: Vec<(String, String)> = match err {
            AdapterError::Http { headers, .. } => headers.clone(),
            _ => Vec::new(),
        };
        let decision = account_policy::decide(&PolicyInput {
            signal: &signal,
            auth_method: selected.config.auth_method,
            retry_attempt: attempt,
            headers: &headers,
            defaults: CooldownDefaults {
                quota: time::Duration::milliseconds(self.config.quota_cooldown_ms as i64),
                rate_limit: time::Duration::milliseconds(
                    self.config.rate_limit_cooldown_ms as i64,
                ),
            },
            hints: PolicyHints::default(),
            already_marked_unhealthy: !selected.config.is_healthy,
        });

        let mut risk_ctx = ctx.clone();
        risk_ctx.cooldown_until = decision.cooldown_until;
        self.risk
            .observe_signal(&credential_id, signal.clone(), &risk_ctx)
            .await;

        let uuid = &selected.config.uuid;
        if decision.mark_unhealthy_immediately {
            let _ = self
                .pool
                .mark_unhealthy_immediately(
                    provider,
                    uuid,
                    Some(err.to_string()),
                    MarkOrigin::Dispatch,
                )
                .await;
        } else if decision.mark_unhealthy {
            let _ = self
                .pool
                .mark_unhealthy(provider, uuid, Some(err.to_string()), None, MarkOrigin::Dispatch)
                .await;
        }
        if decision.mark_need_refresh {
            let _ = self
                .pool
                .mark_need_refresh(provider, uuid, MarkOrigin::Dispatch)
                .await;
        }
        if let Some(until) = decision.cooldown_until {
            let _ = self
                .pool
                .apply_cooldown(provider, uuid, until, MarkOrigin::Dispatch)
                .await;
        }

        let retry_after = decision.cooldown_until.map(|until| {
            (until - time::OffsetDateTime::now_utc())
                .whole_seconds()
                .max(0) as u64
        });
        let gateway_error = match signal.signal {
            SignalType::RateLimited | SignalType::QuotaExceeded => GatewayError::rate_limited(
                format!("upstream rate limited: {err}"),
                retry_after,
            ),
            SignalType::NetworkTransient => {
                GatewayError::upstream_unavailable(format!("upstream unavailable: {err}"))
            }
            SignalType::AuthInvalid
            | SignalType::Suspended
            | SignalType::Banned
            | SignalType::ProviderNeedsRefresh => GatewayError::upstream_unavailable(format!(
                "upstream credential unusable: {err}"
            )),
            _ => match err {
                AdapterError::Http { status, .. } if *status < 500 => {
                    GatewayError::bad_request(format!("upstream rejected request: {err}"))
                }
                _ => GatewayError::internal(format!("upstream failure: {err}")),
            },
        };
        (decision, gateway_error)
    }

    /// Bridge upstream chunks through lift -> lower -> SSE framing.  Runs
    /// until the upstream drains, errors or the consumer goes away.
    #[allow(clippy::too_many_arguments)]
    fn pump_stream(
        &self,
        mut upstream: ChunkReceiver,
        from: Dialect,
        to: Dialect,
        model: String,
        provider: String,
        credential_id: CredentialId,
        ctx: ObserveCtx,
        attempt: u32,
    ) -> tokio::sync::mpsc::Receiver<Bytes> {
        let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(32);
        let risk = self.risk.clone();
        let prompt_log = self.prompt_log.clone();
        let telemetry = self.telemetry.clone();
        let request_id = ctx.request_id.clone().unwrap_or_default();
        let named_events = matches!(to, Dialect::Claude | Dialect::OpenAIResponses);

        tokio::spawn(async move {
            let mut lift = StreamLift::new(from);
            let mut lower = StreamLower::new(to, &model);
            let mut assistant_text = String::new();
            let mut failed = false;

            'outer: while let Some(item) = upstream.recv().await {
                match item {
                    Ok(data) => {
                        let events = match lift.push(&data) {
                            Ok(events) => events,
                            Err(err) => {
                                debug!(event = "stream.lift_failed", error = %err);
                                continue;
                            }
                        };
                        for event in &events {
                            if let claude::StreamEvent::ContentBlockDelta {
                                delta: claude::BlockDelta::TextDelta { text },
                                ..
                            } = event
                            {
                                assistant_text.push_str(text);
                            }
                            for piece in lower.push(event) {
                                if send_piece(&tx, piece).await.is_err() {
                                    break 'outer;
                                }
                            }
                        }
                    }
                    Err(err) => {
                        // Mid-stream failure: a trailing error object on the
                        // same stream, then termination.  Chunks already
                        // written stay written.
                        failed = true;
                        let trailing = serde_json::json!({
                            "error": {
                                "type": "upstream_error",
                                "message": aigw_common::redact_text(&err.to_string()),
                            }
                        });
                        let piece = StreamPiece::Event {
                            name: named_events.then_some("error"),
                            data: trailing.to_string(),
                        };
                        let _ = send_piece(&tx, piece).await;
                        let shape = err.to_error_shape();
                        risk.observe_error(&credential_id, &shape, &ctx).await;
                        break;
                    }
                }
            }

            if !failed {
                for event in lift.finish() {
                    for piece in lower.push(&event) {
                        if send_piece(&tx, piece).await.is_err() {
                            break;
                        }
                    }
                }
                for piece in lower.finish() {
                    if send_piece(&tx, piece).await.is_err() {
                        break;
                    }
                }
                risk.observe_success(&credential_id, &ctx).await;
            }
            prompt_log.log_output(&assistant_text).await;
            if let Some(telemetry) = telemetry {
                telemetry.post(RequestSummary {
                    request_id,
                    provider,
                    model,
                    streamed: true,
                    success: !failed,
                    attempts: attempt + 1,
                    error_kind: failed.then(|| "upstream_error".to_string()),
                });
            }
        });
        rx
    }

    #[allow(clippy::too_many_arguments)]
    fn post_summary(
        &self,
        request_id: &str,
        provider: &str,
        model: &str,
        streamed: bool,
        success: bool,
        attempt: u32,
        error_kind: Option<String>,
    ) {
        if let Some(telemetry) = &self.telemetry {
            telemetry.post(RequestSummary {
                request_id: request_id.to_string(),
                provider: provider.to_string(),
                model: model.to_string(),
                streamed,
                success,
                attempts: attempt + 1,
                error_kind,
            });
        }
    }
}

async fn send_piece(
    tx: &tokio::sync::mpsc::Sender<Bytes>,
    piece: StreamPiece,
) -> Result<(), ()> {
    let frame = match piece {
        StreamPiece::Event { name, data } => sse::frame_event(name, &data),
        StreamPiece::Done => sse::frame_done(),
    };
    tx.send(frame).await.map_err(|_| ())
}
