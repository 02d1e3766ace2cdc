//! # conduit-settings
//!
//! Configuration for the Conduit server, loaded from three layers (in
//! priority order):
//! 1. **Compiled defaults**: [`ConduitSettings::default()`]
//! 2. **User file**: `~/.conduit/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `CONDUIT_*` overrides (highest priority)
//!
//! Settings are loaded once at startup and passed down explicitly; there is
//! no process-wide singleton.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
