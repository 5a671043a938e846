//! # dojo-settings
//!
//! Configuration management with layered sources.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`DojoSettings::default()`]
//! 2. **Settings file**: `~/.dojo/settings.json` (merged over defaults)
//! 3. **Environment variables**: `DOJO_*` overrides (highest priority)

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, dojo_home, load_settings, load_settings_from_path, settings_path,
    validate,
};
pub use types::*;
