//! # dojo-runtime
//!
//! The workshop session engine.
//!
//! - **Store**: concurrent map of sessions, one lock set per session
//! - **Lifecycle**: creation, provisioning, TTL expiry, ending, reaping, shutdown
//! - **Execution**: one command at a time per session, bounded by a timeout
//! - **Progress**: ordered step validation with pluggable evaluators and scoring
//! - **Catalog**: where workshop step definitions come from
//! - **Sweeper**: periodic expiry of sessions nobody is polling

#![deny(unsafe_code)]

pub mod catalog;
pub mod clock;
pub mod errors;
pub mod execution;
pub mod lifecycle;
pub mod progress;
pub mod scoring;
pub mod store;
pub mod sweeper;
pub mod validation;

pub use catalog::{CatalogError, StaticCatalog, WorkshopCatalog};
pub use clock::{Clock, ManualClock, SystemClock};
pub use errors::RuntimeError;
pub use execution::ExecutionResult;
pub use lifecycle::{NewSession, SessionManager, SessionManagerConfig, SweepReport};
pub use progress::ValidationOutcome;
pub use scoring::{DecayScoring, FlatScoring, ScoringPolicy, policy_from_settings};
pub use sweeper::spawn_sweeper;
pub use validation::{StepValidator, ValidationContext, ValidationError, ValidatorRegistry, Verdict};
