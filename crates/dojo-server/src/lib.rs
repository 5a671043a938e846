//! # dojo-server
//!
//! Axum HTTP surface for the session engine.
//!
//! - Session routes: create or resume, poll, execute, validate, end
//! - Server-sent event stream per session, fed by the engine's broadcast channel
//! - Error envelope with stable codes and session context
//! - Health and Prometheus endpoints
//! - Graceful shutdown via `CancellationToken`, ending live sessions on the way out

#![deny(unsafe_code)]

pub mod api_errors;
pub mod events;
pub mod health;
pub mod metrics;
pub mod server;
pub mod sessions;
pub mod shutdown;

pub use api_errors::ApiError;
pub use server::{AppState, DojoServer};
pub use shutdown::{ShutdownCoordinator, ShutdownOutcome};
