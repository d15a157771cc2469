//! HTTP(S) client for the HA backend: auth header injection, JSON decode,
//! streaming passthrough, and the circuit breaker guarding against a
//! degraded upstream (design notes §4.C, §7).

pub mod client;
pub mod model;

pub use client::UpstreamClient;
pub use model::{PageJson, WidgetJson};
