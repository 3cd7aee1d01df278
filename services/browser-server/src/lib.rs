//! HTTP front door for the genome-browser request pipeline.
//!
//! Grounded on `iwismer-rusty-timer/services/server`'s `build_router`
//! (one `Router::new()` with `.route(...)` calls, `.with_state(state)`)
//! and on spec.md §6's "thin shell: one route, body-extraction into
//! bytes, a call into the engine, bytes back out" — the teacher
//! (`requiem`) has no HTTP surface of its own, so the axum wiring here
//! follows the retrieval pack's other example instead (per SPEC_FULL
//! §6).

pub mod app;
pub mod config;
pub mod http;

pub use app::build_engine;
pub use http::build_router;
