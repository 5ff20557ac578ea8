//! Concrete upstream adapters.
//!
//! Every provider implements [`aigw_provider_core::ServiceAdapter`]; the
//! registry builds one per (provider type, credential) pair and owns the
//! shared HTTP client cache.

pub mod credential_file;
pub mod http_client;
pub mod providers;
pub mod registry;

pub use registry::{AdapterRegistry, RegistryHealthProbe, provider_family};
