//! Provider abstractions: the uniform service-adapter contract, the
//! per-provider credential pool with its on-disk mirror, and the account
//! policy that turns classified failures into concrete actions.
//!
//! This crate performs no HTTP of its own; adapters live in
//! `aigw-provider-impl`.

pub mod account_policy;
pub mod adapter;
pub mod credential;
pub mod pool;

pub use account_policy::{
    CooldownDefaults, PolicyAction, PolicyDecision, PolicyHints, PolicyInput, decide,
    parse_cooldown_headers,
};
pub use adapter::{
    AdapterError, AdapterResult, ChunkReceiver, ChunkSender, HealthCheckResult, HealthProbe,
    ServiceAdapter,
};
pub use credential::{AuthMethod, CredentialConfig, RuntimeCounters};
pub use pool::{MarkOrigin, PoolError, ProviderPoolManager, SelectedCredential};
