//! Analysis server configuration
//!
//! Parses `<config dir>/analysis-bridge/config.toml` (or the file named by
//! `ANALYSIS_BRIDGE_CONFIG`) into a [`ServerConfig`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::{Error, Result};

/// Environment variable overriding the config file location
pub const CONFIG_ENV: &str = "ANALYSIS_BRIDGE_CONFIG";

/// How to launch and talk to the analysis server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Executable name (looked up in PATH) or path
    pub executable: PathBuf,

    /// Arguments passed to the executable
    pub args: Vec<String>,

    /// Working directory and workspace root; defaults to the current directory
    pub working_dir: Option<PathBuf>,

    /// Sent verbatim as `initializationOptions`
    pub initialization_options: Option<JsonValue>,

    /// Upper bound on resources announced to the server at once
    pub max_open_resources: usize,

    pub timeouts: Timeouts,

    pub restart: RestartPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("rust-analyzer"),
            args: Vec::new(),
            working_dir: None,
            initialization_options: None,
            max_open_resources: 32,
            timeouts: Timeouts::default(),
            restart: RestartPolicy::default(),
        }
    }
}

/// Timeouts, in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Default for caller requests
    pub request_ms: u64,
    /// The `initialize` handshake
    pub initialize_ms: u64,
    /// The `shutdown` request
    pub shutdown_ms: u64,
    /// Wait for the process to exit on its own after `exit`
    pub exit_grace_ms: u64,
    /// Wait after SIGTERM before SIGKILL
    pub kill_grace_ms: u64,
    /// Window in which an exit right after spawn counts as a failed start
    pub spawn_confirm_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            request_ms: 30_000,
            initialize_ms: 30_000,
            shutdown_ms: 5_000,
            exit_grace_ms: 2_000,
            kill_grace_ms: 2_000,
            spawn_confirm_ms: 100,
        }
    }
}

impl Timeouts {
    pub fn request(&self) -> Duration {
        Duration::from_millis(self.request_ms)
    }

    pub fn initialize(&self) -> Duration {
        Duration::from_millis(self.initialize_ms)
    }

    pub fn shutdown(&self) -> Duration {
        Duration::from_millis(self.shutdown_ms)
    }

    pub fn exit_grace(&self) -> Duration {
        Duration::from_millis(self.exit_grace_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn spawn_confirm(&self) -> Duration {
        Duration::from_millis(self.spawn_confirm_ms)
    }
}

/// Crash recovery budget
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartPolicy {
    /// Delay unit; attempt `n` waits `n * base_delay_ms`
    pub base_delay_ms: u64,
    /// Consecutive failed attempts before giving up
    pub max_attempts: u32,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_attempts: 3,
        }
    }
}

impl RestartPolicy {
    /// Linear backoff: 1x, 2x, 3x the base delay
    pub fn delay_for(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.base_delay_ms.saturating_mul(u64::from(attempt)))
    }
}

impl ServerConfig {
    /// Config for an explicit command line
    pub fn for_command(executable: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            executable: executable.into(),
            args,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.executable.as_os_str().is_empty() {
            return Err(Error::Config("executable must not be empty".to_string()));
        }
        if self.max_open_resources == 0 {
            return Err(Error::Config(
                "max_open_resources must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Working directory the server runs in
    pub fn working_dir(&self) -> Result<PathBuf> {
        match &self.working_dir {
            Some(dir) => crate::utils::validate_and_canonicalize_path(dir),
            None => Ok(std::env::current_dir()?),
        }
    }

    /// Find the executable in PATH or common install locations
    pub fn resolve_executable(&self) -> Result<PathBuf> {
        let executable = &self.executable;

        if executable.components().count() > 1 || executable.is_absolute() {
            if executable.exists() {
                return Ok(executable.clone());
            }
            return Err(Error::Process(format!(
                "Analysis server executable not found: {:?}",
                executable
            )));
        }

        if let Ok(path) = which::which(executable) {
            return Ok(path);
        }

        if let Some(home) = dirs::home_dir() {
            let common_paths = [
                home.join(".cargo/bin").join(executable),
                home.join(".local/bin").join(executable),
                PathBuf::from("/usr/local/bin").join(executable),
                PathBuf::from("/opt/homebrew/bin").join(executable),
            ];

            for path in common_paths {
                if path.exists() {
                    return Ok(path);
                }
            }
        }

        Err(Error::Process(format!(
            "Analysis server '{}' not found in PATH. Please install it first.",
            executable.display()
        )))
    }
}

/// Default config file location
pub fn config_path() -> PathBuf {
    if let Some(path) = std::env::var_os(CONFIG_ENV) {
        return PathBuf::from(path);
    }
    dirs::config_dir()
        .map(|d| d.join("analysis-bridge").join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("analysis-bridge.toml"))
}

/// Read configuration from the default location, falling back to defaults
pub fn read_config() -> Result<ServerConfig> {
    let config_path = config_path();

    if !config_path.exists() {
        tracing::warn!("Config not found at {:?}, using defaults", config_path);
        return Ok(ServerConfig::default());
    }

    read_config_from_path(&config_path)
}

/// Read configuration from a specific path
pub fn read_config_from_path(path: &Path) -> Result<ServerConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;

    let config: ServerConfig = toml::from_str(&content)?;
    config.validate()?;

    tracing::debug!(
        "Loaded config for {:?} with {} args",
        config.executable,
        config.args.len()
    );

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml_content = r#"
executable = "typescript-language-server"
args = ["--stdio"]
max_open_resources = 8

[initialization_options]
preferences = { includeInlayHints = true }

[timeouts]
request_ms = 1500

[restart]
base_delay_ms = 250
"#;

        let config: ServerConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.executable, PathBuf::from("typescript-language-server"));
        assert_eq!(config.args, vec!["--stdio".to_string()]);
        assert_eq!(config.max_open_resources, 8);
        assert_eq!(config.timeouts.request(), Duration::from_millis(1500));
        // Untouched fields keep their defaults
        assert_eq!(config.timeouts.initialize_ms, 30_000);
        assert_eq!(config.restart.max_attempts, 3);
        assert_eq!(
            config.initialization_options.unwrap()["preferences"]["includeInlayHints"],
            serde_json::json!(true)
        );
    }

    #[test]
    fn test_restart_delay_is_linear() {
        let policy = RestartPolicy {
            base_delay_ms: 100,
            max_attempts: 3,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(300));
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let config = ServerConfig {
            max_open_resources: 0,
            ..ServerConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_read_config_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "executable = \"clangd\"\n").unwrap();

        let config = read_config_from_path(&path).unwrap();
        assert_eq!(config.executable, PathBuf::from("clangd"));

        std::fs::write(&path, "executable = [").unwrap();
        assert!(matches!(
            read_config_from_path(&path),
            Err(Error::ConfigParse(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_executable() {
        let config = ServerConfig::for_command("sh", Vec::new());
        assert!(config.resolve_executable().unwrap().is_absolute());

        let missing = ServerConfig::for_command("/definitely/not/here", Vec::new());
        assert!(matches!(missing.resolve_executable(), Err(Error::Process(_))));
    }
}
