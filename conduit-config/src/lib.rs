//! Configuration loading for the Conduit operation engine.
//!
//! The engine itself only consumes [`EngineConfig`]; this crate resolves where
//! that configuration comes from (explicit file, environment, default file
//! candidates) and applies the startup guard rails that reject settings the
//! engine cannot run safely with.
#![allow(missing_docs)]

pub mod loader;
pub mod validation;

pub use conduit_model::EngineConfig;
pub use loader::{ConfigLoad, ConfigLoader, ConfigSource, load_from_env};
pub use validation::{
    ConfigGuardRailError, ConfigWarning, ConfigWarnings, apply_guard_rails,
};
