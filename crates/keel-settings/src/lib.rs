//! # keel-settings
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults** ([`KeelSettings::default()`])
//! 2. **User file** `~/.keel/settings.json`, deep-merged over defaults
//! 3. **Environment variables** `KEEL_*`
//!
//! There is no global instance: the binary loads settings once and passes
//! them to whatever needs them.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, keel_home, load_settings, load_settings_from_path, settings_path};
pub use types::*;
