//! Attribute store and `tbon.*` configuration loading for the overlay.
//!
//! This crate has minimal dependencies so it can be imported by every
//! overlay crate, including ones that cannot afford a `tokio`/`tmq` pull-in.
//!
//! # Configuration philosophy
//!
//! - The [`attr`] module is the runtime attribute table (§6): a flat
//!   key/value store with IMMUTABLE/READONLY flags, seeded at broker start
//!   and queried by service handlers for `rank`, `size`, `broker.uuid`, etc.
//! - The [`tbon`] module is the typed subset of that table the overlay
//!   itself consumes to configure sockets and timers.
//! - [`fsd`] parses the human-readable duration literals (`30s`, `5m`,
//!   `1.5h`) that every `tbon.*` timeout is expressed in.
//!
//! # Config file locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/flux/flux.toml` (system)
//! 2. `~/.config/flux/flux.toml` (user)
//! 3. `./flux.toml` (local override)
//! 4. Environment variables (`FLUX_TBON_*`)
//!
//! # Example config
//!
//! ```toml
//! [tbon]
//! topo = "kary:32"
//! child_rcvhwm = 0
//! torpid_min = "5s"
//! torpid_max = "30s"
//! ```

pub mod attr;
pub mod fsd;
pub mod loader;
pub mod tbon;

pub use attr::{AttrFlags, AttrStore};
pub use loader::ConfigSources;
pub use tbon::TbonSettings;

use std::path::PathBuf;

use thiserror::Error;

/// Configuration and attribute-store errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("invalid duration literal '{0}'")]
    Fsd(String),
    #[error("invalid value for {name}: '{value}'")]
    InvalidValue { name: String, value: String },
    #[error("attribute '{0}' already exists")]
    AttrExists(String),
    #[error("unknown attribute '{0}'")]
    AttrUnknown(String),
    #[error("attribute '{0}' is immutable")]
    AttrImmutable(String),
    #[error("attribute '{0}' is read-only")]
    AttrReadonly(String),
}

/// Resolved `tbon.*` configuration plus a record of where it came from.
#[derive(Debug, Clone)]
pub struct FluxConfig {
    pub tbon: TbonSettings,
}

impl FluxConfig {
    /// Load configuration from all sources.
    ///
    /// Load order (later wins):
    /// 1. Compiled defaults
    /// 2. `/etc/flux/flux.toml`
    /// 3. `~/.config/flux/flux.toml`
    /// 4. `./flux.toml`
    /// 5. Environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration from a specific file path, then apply env overrides.
    ///
    /// If `config_path` is provided, it takes precedence over the local
    /// `./flux.toml` override. System and user configs still load first.
    pub fn load_from(config_path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration and return information about sources.
    pub fn load_with_sources() -> Result<(Self, ConfigSources), ConfigError> {
        Self::load_with_sources_from(None)
    }

    /// Load configuration from an optional path and return information
    /// about its sources.
    pub fn load_with_sources_from(
        config_path: Option<&std::path::Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut file_config = tbon::TbonFileConfig::default();

        for path in loader::discover_config_files_with_override(config_path) {
            let layer = loader::load_from_file(&path)?;
            file_config = file_config.merge(layer);
            sources.files.push(path);
        }

        loader::apply_env_overrides(&mut file_config, &mut sources);

        let tbon = file_config.resolve()?;
        Ok((Self { tbon }, sources))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_with_no_files_present_yields_compiled_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        let config = FluxConfig::load_from(Some(&missing)).unwrap();
        assert_eq!(config.tbon, TbonSettings::default());
    }

    #[test]
    fn load_from_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flux.toml");
        std::fs::write(&path, "[tbon]\ntopo = \"kary:16\"\nchild_rcvhwm = 4\n").unwrap();

        let config = FluxConfig::load_from(Some(&path)).unwrap();
        assert_eq!(config.tbon.topo, "kary:16");
        assert_eq!(config.tbon.child_rcvhwm, 4);
        // Fields not set in the file still carry compiled defaults.
        assert_eq!(config.tbon.interface_hint, tbon::DEFAULT_INTERFACE_HINT);
    }
}
