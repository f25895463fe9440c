//! # parley-settings
//!
//! Settings are loaded once at startup from three layers (in priority order):
//! 1. **Compiled defaults**: [`Settings::default()`]
//! 2. **Settings file**: JSON, deep-merged over defaults
//! 3. **Environment variables**: `PARLEY_*` overrides (highest priority)
//!
//! The loaded [`Settings`] value is passed explicitly to the components that
//! need it; nothing re-reads configuration mid-run.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{apply_env_overrides, deep_merge, find_settings_file, load_settings, load_settings_from_path};
pub use types::*;
