//! TOML configuration for the farmhand agent.
//!
//! Layered model with sensible defaults: the `FARMHAND_CONFIG` environment
//! variable wins, then the standard system location, then compiled-in
//! defaults.  Every section tolerates partial files.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::proto::{DEFAULT_BASE_PORT, PORT_RANGE_LEN};

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the agent process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub network: NetworkConfig,
    pub transfer: TransferConfig,
    pub paths: PathsConfig,
    pub service: ServiceConfig,
    pub logging: LoggingConfig,
}

impl AgentConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded agent configuration");
        Ok(config)
    }

    /// Try to load configuration from, in order:
    /// 1. The path specified by the `FARMHAND_CONFIG` environment variable.
    /// 2. `/etc/farmhand/farmhand.toml`.
    /// 3. Fall back to compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var("FARMHAND_CONFIG") {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "FARMHAND_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new("/etc/farmhand/farmhand.toml");
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Network
// ---------------------------------------------------------------------------

/// Control-plane listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// First UDP port to try; the agent binds the first free port in
    /// `[base_port, base_port + port_range - 1]`.  `0` binds an ephemeral
    /// port (useful for tests and side-by-side trial runs).
    pub base_port: u16,
    /// Number of consecutive ports probed.
    pub port_range: u16,
    /// Localhost address for the companion UI link.
    pub ui_bind: String,
    /// Upper bound on datagrams handled per 50 ms tick.
    pub max_packets_per_tick: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            base_port: DEFAULT_BASE_PORT,
            port_range: PORT_RANGE_LEN,
            ui_bind: "127.0.0.1:23412".to_string(),
            max_packets_per_tick: 32,
        }
    }
}

// ---------------------------------------------------------------------------
// Transfer
// ---------------------------------------------------------------------------

/// Configuration for the file-transfer subprocess that stages job files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Path (or bare command name resolved via `$PATH`) to the transfer tool.
    pub path: String,
    /// Seconds a transfer may run before it is killed and the job dropped.
    pub timeout_sec: u64,
    /// Directory worker binaries are run from in super-debug mode.
    pub debug_bin_dir: PathBuf,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            path: "farm-transfer".to_string(),
            timeout_sec: 30,
            debug_bin_dir: PathBuf::from("/opt/farmhand/debug-bin"),
        }
    }
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

/// Filesystem locations owned by the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Scratch cache job files are downloaded into; cleared per job.
    pub cache_dir: PathBuf,
    /// Where the persisted service flags live.
    pub state_file: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("/var/lib/farmhand/cache"),
            state_file: PathBuf::from("/var/lib/farmhand/state.toml"),
        }
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Behavioral knobs for the agent process itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Lower the agent's own scheduling priority at startup so it never
    /// competes with interactive use of the machine.
    pub low_priority: bool,
    /// Name the patch installer artifact is downloaded as.
    pub installer_name: String,
    /// Name of the UI executable the restart command relaunches after a
    /// patch, resolved next to the agent binary.
    pub ui_exe_name: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            low_priority: true,
            installer_name: "farmhand-install".to_string(),
            ui_exe_name: "farmhand-ui".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = AgentConfig::default();

        assert_eq!(cfg.network.base_port, DEFAULT_BASE_PORT);
        assert_eq!(cfg.network.port_range, PORT_RANGE_LEN);
        assert_eq!(cfg.network.ui_bind, "127.0.0.1:23412");
        assert_eq!(cfg.network.max_packets_per_tick, 32);

        assert_eq!(cfg.transfer.path, "farm-transfer");
        assert_eq!(cfg.transfer.timeout_sec, 30);

        assert_eq!(cfg.paths.cache_dir, PathBuf::from("/var/lib/farmhand/cache"));
        assert_eq!(
            cfg.paths.state_file,
            PathBuf::from("/var/lib/farmhand/state.toml")
        );

        assert!(cfg.service.low_priority);
        assert_eq!(cfg.service.installer_name, "farmhand-install");
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn test_parse_example_toml() {
        let toml_str = r#"
[network]
base_port = 24000
port_range = 4
ui_bind = "127.0.0.1:24500"
max_packets_per_tick = 16

[transfer]
path = "/usr/local/bin/farm-transfer"
timeout_sec = 120
debug_bin_dir = "/home/dev/farm/bin"

[paths]
cache_dir = "/tmp/farmhand-cache"
state_file = "/tmp/farmhand-state.toml"

[service]
low_priority = false
installer_name = "farmhand-setup"

[logging]
level = "debug"
"#;

        let cfg: AgentConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.network.base_port, 24000);
        assert_eq!(cfg.network.port_range, 4);
        assert_eq!(cfg.network.max_packets_per_tick, 16);
        assert_eq!(cfg.transfer.path, "/usr/local/bin/farm-transfer");
        assert_eq!(cfg.transfer.timeout_sec, 120);
        assert_eq!(cfg.transfer.debug_bin_dir, PathBuf::from("/home/dev/farm/bin"));
        assert_eq!(cfg.paths.cache_dir, PathBuf::from("/tmp/farmhand-cache"));
        assert!(!cfg.service.low_priority);
        assert_eq!(cfg.service.installer_name, "farmhand-setup");
        assert_eq!(cfg.logging.level, "debug");
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml_str = r#"
[network]
base_port = 30000
"#;
        let cfg: AgentConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.network.base_port, 30000);
        assert_eq!(cfg.network.port_range, PORT_RANGE_LEN);
        assert_eq!(cfg.transfer.timeout_sec, 30);
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn test_empty_toml_uses_all_defaults() {
        let cfg: AgentConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.network.base_port, AgentConfig::default().network.base_port);
        assert_eq!(cfg.transfer.path, AgentConfig::default().transfer.path);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("farmhand.toml");
        std::fs::write(
            &path,
            r#"
[network]
base_port = 25001
"#,
        )
        .unwrap();

        let cfg = AgentConfig::load(&path).unwrap();
        assert_eq!(cfg.network.base_port, 25001);
    }

    #[test]
    fn test_load_missing_file_errors() {
        let result = AgentConfig::load(Path::new("/nonexistent/path/farmhand.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_serialization_round_trip() {
        let cfg = AgentConfig::default();
        let toml_str = toml::to_string_pretty(&cfg).unwrap();
        let roundtripped: AgentConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(cfg.network.base_port, roundtripped.network.base_port);
        assert_eq!(cfg.transfer.path, roundtripped.transfer.path);
        assert_eq!(cfg.paths.cache_dir, roundtripped.paths.cache_dir);
    }
}
