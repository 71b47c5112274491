//! Config file discovery, loading, and environment variable overlay.

use std::env;
use std::path::{Path, PathBuf};

use crate::tbon::TbonFileConfig;
use crate::ConfigError;

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order).
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values.
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations.
///
/// Returns paths in load order (system, user, local).
/// Only returns files that exist.
pub fn discover_config_files() -> Vec<PathBuf> {
    discover_config_files_with_override(None)
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it replaces the local override.
/// Returns paths in load order (system, user, local/cli).
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/flux/flux.toml");
    if system.exists() {
        files.push(system);
    }

    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("flux/flux.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("flux.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Load the `[tbon]` table from a TOML file.
pub fn load_from_file(path: &Path) -> Result<TbonFileConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;
    parse_toml(&contents, path)
}

fn parse_toml(contents: &str, path: &Path) -> Result<TbonFileConfig, ConfigError> {
    let table: toml::Table = contents.parse().map_err(|e: toml::de::Error| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    let Some(tbon) = table.get("tbon") else {
        return Ok(TbonFileConfig::default());
    };

    tbon.clone()
        .try_into()
        .map_err(|e: toml::de::Error| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

/// Apply `FLUX_TBON_<NAME>` environment variable overrides.
pub fn apply_env_overrides(config: &mut TbonFileConfig, sources: &mut ConfigSources) {
    macro_rules! env_str {
        ($var:literal, $field:expr) => {
            if let Ok(v) = env::var($var) {
                $field = Some(v);
                sources.env_overrides.push($var.to_string());
            }
        };
    }
    macro_rules! env_parsed {
        ($var:literal, $field:expr) => {
            if let Ok(v) = env::var($var) {
                if let Ok(parsed) = v.parse() {
                    $field = Some(parsed);
                    sources.env_overrides.push($var.to_string());
                }
            }
        };
    }

    env_str!("FLUX_TBON_TOPO", config.topo);
    env_parsed!("FLUX_TBON_FANOUT", config.fanout);
    env_parsed!("FLUX_TBON_ENABLE_IPV6", config.enable_ipv6);
    env_parsed!("FLUX_TBON_PREFERTCP", config.prefertcp);
    env_parsed!("FLUX_TBON_ZMQDEBUG", config.zmqdebug);
    env_parsed!("FLUX_TBON_ZMQ_IO_THREADS", config.zmq_io_threads);
    env_parsed!("FLUX_TBON_CHILD_RCVHWM", config.child_rcvhwm);
    env_str!("FLUX_TBON_INTERFACE_HINT", config.interface_hint);
    env_str!("FLUX_TBON_TORPID_MIN", config.torpid_min);
    env_str!("FLUX_TBON_TORPID_MAX", config.torpid_max);
    env_str!("FLUX_TBON_TCP_USER_TIMEOUT", config.tcp_user_timeout);
    env_str!("FLUX_TBON_CONNECT_TIMEOUT", config.connect_timeout);
}

/// Expand `~` and a leading `$VAR` in a path. Used for `tbon.interface-hint`
/// when it names a file rather than `default-route`/`hostname`/an interface.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf()) {
            return home.join(stripped);
        }
    } else if let Some(stripped) = path.strip_prefix('$') {
        if let Some(slash_pos) = stripped.find('/') {
            let var_name = &stripped[..slash_pos];
            if let Ok(var_value) = env::var(var_name) {
                return PathBuf::from(var_value).join(&stripped[slash_pos + 1..]);
            }
        } else if let Ok(var_value) = env::var(stripped) {
            return PathBuf::from(var_value);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_path_tilde() {
        let expanded = expand_path("~/test/path");
        assert!(!expanded.to_string_lossy().starts_with('~'));
        assert!(expanded.to_string_lossy().contains("test/path"));
    }

    #[test]
    fn expand_path_absolute_is_unchanged() {
        assert_eq!(expand_path("/absolute/path"), PathBuf::from("/absolute/path"));
    }

    #[test]
    fn discover_config_files_does_not_panic() {
        let _files = discover_config_files();
    }

    #[test]
    fn parse_minimal_tbon_table() {
        let toml = "[tbon]\ntopo = \"kary:4\"\n";
        let cfg = parse_toml(toml, Path::new("test.toml")).unwrap();
        assert_eq!(cfg.topo.as_deref(), Some("kary:4"));
        assert!(cfg.child_rcvhwm.is_none());
    }

    #[test]
    fn parse_full_tbon_table() {
        let toml = r#"
[tbon]
topo = "binomial"
prefertcp = true
zmqdebug = false
zmq_io_threads = 2
child_rcvhwm = 8
interface_hint = "eth0"
torpid_min = "10s"
torpid_max = "1m"
tcp_user_timeout = "15s"
connect_timeout = "45s"
"#;
        let cfg = parse_toml(toml, Path::new("test.toml")).unwrap();
        assert_eq!(cfg.topo.as_deref(), Some("binomial"));
        assert_eq!(cfg.prefertcp, Some(true));
        assert_eq!(cfg.zmq_io_threads, Some(2));
        assert_eq!(cfg.child_rcvhwm, Some(8));
        assert_eq!(cfg.interface_hint.as_deref(), Some("eth0"));
        assert_eq!(cfg.torpid_min.as_deref(), Some("10s"));
    }

    #[test]
    fn table_with_no_tbon_section_yields_all_none() {
        let cfg = parse_toml("[other]\nx = 1\n", Path::new("test.toml")).unwrap();
        assert_eq!(cfg, TbonFileConfig::default());
    }
}
