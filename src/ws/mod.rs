//! Connected-client registry, typed event broadcast, and liveness sweep
//! (design notes §4.F). The axum upgrade handler lives in `crate::http`;
//! this module owns the hub's steady-state behavior only.

pub mod hub;

pub use hub::{ClientId, ConnectedClient, WsHub};
