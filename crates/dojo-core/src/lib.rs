//! # dojo-core
//!
//! Shared types for the workshop session engine.
//!
//! - **IDs**: branded newtypes so a session id is never passed where a step id is expected
//! - **Session**: status state, per-step progress, command history records
//! - **Environment**: weak reference to an externally provisioned sandbox
//! - **Workshop**: ordered step definitions and their success criteria
//! - **Events**: lifecycle notifications broadcast to subscribers

#![deny(unsafe_code)]

pub mod environment;
pub mod events;
pub mod ids;
pub mod session;
pub mod workshop;
