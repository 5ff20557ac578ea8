//! Request orchestration: endpoint classification, dialect strategies,
//! model routing, the dispatcher and its logging/telemetry sidecars.

pub mod classify;
pub mod dispatch;
pub mod error;
pub mod prompt_log;
pub mod route;
pub mod strategy;
pub mod telemetry;

pub use classify::{Endpoint, classify_request, extract_api_key};
pub use dispatch::{DispatchOutput, Dispatcher};
pub use error::{ErrorKind, GatewayError};
pub use prompt_log::PromptLog;
pub use route::{route_model, strip_brand_prefix};
pub use strategy::Strategy;
pub use telemetry::Telemetry;
