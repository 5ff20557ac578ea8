//! HTTP surface: auth middleware, endpoint wiring and SSE response framing.

mod proxy;
mod release;

pub use proxy::{GatewayState, gateway_router};
