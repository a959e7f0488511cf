// MizuFlow control-plane service.
//
// Wiring lives in `app`; the long-running pieces (outbox worker, watch
// ingestor, reconciler) live in `service`; persistence behind the
// `store::FlagStore` trait. `main` assembles all of it.
pub mod api;
pub mod app;
pub mod auth;
pub mod config;
pub mod observability;
pub mod service;
pub mod store;
