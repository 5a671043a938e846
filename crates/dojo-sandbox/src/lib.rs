//! # dojo-sandbox
//!
//! Client side of the sandbox substrate. The engine only needs three things
//! from a provider: create an environment, run a command in it with a
//! timeout, and tear it down.
//!
//! - [`traits::Provisioner`]: the contract the runtime depends on
//! - [`http::HttpProvisioner`]: remote provider over HTTP (`reqwest`)
//! - [`local::LocalProvisioner`]: per-environment directories and `bash -c`, for development
//! - [`scripted::ScriptedProvisioner`]: deterministic double for tests

#![deny(unsafe_code)]

pub mod errors;
pub mod http;
pub mod local;
pub mod scripted;
pub mod traits;

pub use errors::SandboxError;
pub use traits::{CommandOutput, Provisioner};
