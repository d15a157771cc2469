//! Core HTTP surface: sitemap delta/passthrough routes, the `/ws` upgrade,
//! and the shared auth/config-reload middleware (design notes §4.A, §4.H).

pub mod handlers;
pub mod middleware;
pub mod routes;

pub use routes::build_router;
