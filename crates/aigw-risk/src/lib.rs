//! Credential risk lifecycle: signal normalization, the pure policy engine,
//! the persisted lifecycle store and the mediating risk manager.

pub mod manager;
pub mod policy;
pub mod signal;
pub mod store;

pub use manager::{
    AdmissionDecision, ManualReleaseError, ManualReleaseRequest, ObserveCtx, RiskManager,
};
pub use policy::{Decision, EvalContext, Evaluation, LifecycleState, evaluate};
pub use signal::{ErrorShape, NormalizedSignal, SignalType, normalize_error};
pub use store::{
    EventFilter, LifecycleEvent, LifecycleRecord, LifecycleStore, LifecycleSummary, PoolSeed,
    RecordFilter,
};
