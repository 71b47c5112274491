//! Typed view of the `tbon.*` attribute family (§6), with the compiled
//! defaults the real broker ships.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::fsd;
use crate::ConfigError;

/// Compiled-in defaults, carried over from the broker's overlay
/// implementation rather than invented here.
pub const DEFAULT_TORPID_MIN_SECS: f64 = 5.0;
pub const DEFAULT_TORPID_MAX_SECS: f64 = 30.0;
pub const DEFAULT_TCP_USER_TIMEOUT_SECS: f64 = 20.0;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: f64 = 30.0;
pub const DEFAULT_INTERFACE_HINT: &str = "default-route";

/// Typed `tbon.*` settings, loaded from compiled defaults, an optional
/// `[tbon]` table in a TOML file, and `FLUX_TBON_*` environment overrides.
#[derive(Debug, Clone, PartialEq)]
pub struct TbonSettings {
    pub topo: String,
    pub enable_ipv6: bool,
    pub prefertcp: bool,
    pub zmqdebug: bool,
    pub zmq_io_threads: u32,
    /// 0 means unlimited; otherwise must be >= 2.
    pub child_rcvhwm: u32,
    pub interface_hint: String,
    /// A value of zero disables torpid-node flagging.
    pub torpid_min: Duration,
    pub torpid_max: Duration,
    pub tcp_user_timeout: Option<Duration>,
    pub connect_timeout: Option<Duration>,
}

impl Default for TbonSettings {
    fn default() -> Self {
        Self {
            topo: "kary:2".to_string(),
            enable_ipv6: false,
            prefertcp: false,
            zmqdebug: false,
            zmq_io_threads: 1,
            child_rcvhwm: 0,
            interface_hint: DEFAULT_INTERFACE_HINT.to_string(),
            torpid_min: Duration::from_secs_f64(DEFAULT_TORPID_MIN_SECS),
            torpid_max: Duration::from_secs_f64(DEFAULT_TORPID_MAX_SECS),
            tcp_user_timeout: Some(Duration::from_secs_f64(DEFAULT_TCP_USER_TIMEOUT_SECS)),
            connect_timeout: Some(Duration::from_secs_f64(DEFAULT_CONNECT_TIMEOUT_SECS)),
        }
    }
}

impl TbonSettings {
    /// True iff `child_rcvhwm` is a value the overlay accepts (0 or >= 2).
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.child_rcvhwm != 0 && self.child_rcvhwm < 2 {
            return Err(ConfigError::InvalidValue {
                name: "tbon.child_rcvhwm".to_string(),
                value: self.child_rcvhwm.to_string(),
            });
        }
        Ok(())
    }
}

/// Raw `[tbon]` table as it appears in a TOML file: every field optional so
/// multiple files/env layers can be merged by "last Some wins".
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct TbonFileConfig {
    pub topo: Option<String>,
    pub fanout: Option<u32>,
    pub enable_ipv6: Option<bool>,
    pub prefertcp: Option<bool>,
    pub zmqdebug: Option<bool>,
    pub zmq_io_threads: Option<u32>,
    pub child_rcvhwm: Option<u32>,
    pub interface_hint: Option<String>,
    pub torpid_min: Option<String>,
    pub torpid_max: Option<String>,
    pub tcp_user_timeout: Option<String>,
    pub connect_timeout: Option<String>,
}

impl TbonFileConfig {
    /// Overlay `other` onto `self`, `other` winning wherever it is `Some`.
    pub fn merge(self, other: TbonFileConfig) -> TbonFileConfig {
        TbonFileConfig {
            topo: other.topo.or(self.topo),
            fanout: other.fanout.or(self.fanout),
            enable_ipv6: other.enable_ipv6.or(self.enable_ipv6),
            prefertcp: other.prefertcp.or(self.prefertcp),
            zmqdebug: other.zmqdebug.or(self.zmqdebug),
            zmq_io_threads: other.zmq_io_threads.or(self.zmq_io_threads),
            child_rcvhwm: other.child_rcvhwm.or(self.child_rcvhwm),
            interface_hint: other.interface_hint.or(self.interface_hint),
            torpid_min: other.torpid_min.or(self.torpid_min),
            torpid_max: other.torpid_max.or(self.torpid_max),
            tcp_user_timeout: other.tcp_user_timeout.or(self.tcp_user_timeout),
            connect_timeout: other.connect_timeout.or(self.connect_timeout),
        }
    }

    /// Resolve into a [`TbonSettings`], starting from compiled defaults.
    /// `tbon.fanout = K` is a legacy alias for `tbon.topo = "kary:K"` and is
    /// only consulted when `topo` itself was not set.
    pub fn resolve(self) -> Result<TbonSettings, ConfigError> {
        let mut settings = TbonSettings::default();

        match (self.topo, self.fanout) {
            (Some(topo), _) => settings.topo = topo,
            (None, Some(k)) => settings.topo = format!("kary:{k}"),
            (None, None) => {}
        }
        if let Some(v) = self.enable_ipv6 {
            settings.enable_ipv6 = v;
        }
        if let Some(v) = self.prefertcp {
            settings.prefertcp = v;
        }
        if let Some(v) = self.zmqdebug {
            settings.zmqdebug = v;
        }
        if let Some(v) = self.zmq_io_threads {
            settings.zmq_io_threads = v;
        }
        if let Some(v) = self.child_rcvhwm {
            settings.child_rcvhwm = v;
        }
        if let Some(v) = self.interface_hint {
            settings.interface_hint = v;
        }
        if let Some(v) = self.torpid_min {
            settings.torpid_min = fsd::parse(&v)?;
        }
        if let Some(v) = self.torpid_max {
            settings.torpid_max = fsd::parse(&v)?;
        }
        if let Some(v) = self.tcp_user_timeout {
            settings.tcp_user_timeout = Some(fsd::parse(&v)?);
        }
        if let Some(v) = self.connect_timeout {
            settings.connect_timeout = Some(fsd::parse(&v)?);
        }

        settings.validate()?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_compiled_constants() {
        let s = TbonSettings::default();
        assert_eq!(s.torpid_min, Duration::from_secs(5));
        assert_eq!(s.torpid_max, Duration::from_secs(30));
        assert_eq!(s.tcp_user_timeout, Some(Duration::from_secs(20)));
        assert_eq!(s.connect_timeout, Some(Duration::from_secs(30)));
        assert_eq!(s.interface_hint, "default-route");
    }

    #[test]
    fn fanout_alias_only_applies_without_explicit_topo() {
        let cfg = TbonFileConfig {
            fanout: Some(8),
            ..Default::default()
        };
        assert_eq!(cfg.resolve().unwrap().topo, "kary:8");

        let cfg = TbonFileConfig {
            topo: Some("binomial".to_string()),
            fanout: Some(8),
            ..Default::default()
        };
        assert_eq!(cfg.resolve().unwrap().topo, "binomial");
    }

    #[test]
    fn merge_prefers_later_values() {
        let base = TbonFileConfig {
            topo: Some("flat".to_string()),
            child_rcvhwm: Some(4),
            ..Default::default()
        };
        let overlay = TbonFileConfig {
            topo: Some("kary:4".to_string()),
            ..Default::default()
        };
        let merged = base.merge(overlay);
        assert_eq!(merged.topo.as_deref(), Some("kary:4"));
        assert_eq!(merged.child_rcvhwm, Some(4));
    }

    #[test]
    fn child_rcvhwm_of_one_is_rejected() {
        let cfg = TbonFileConfig {
            child_rcvhwm: Some(1),
            ..Default::default()
        };
        assert!(cfg.resolve().is_err());
    }

    #[test]
    fn child_rcvhwm_zero_means_unlimited_and_is_accepted() {
        let cfg = TbonFileConfig {
            child_rcvhwm: Some(0),
            ..Default::default()
        };
        assert!(cfg.resolve().is_ok());
    }
}
