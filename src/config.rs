//! Configuration file parser for ~/.config/newsync/config.toml.
//!
//! The config file is optional. A missing file yields `Config::default()`.
//! Unknown keys are ignored by serde, though we log a warning when the file
//! contains potential typos.
use secrecy::SecretString;
use serde::{Deserialize, Deserializer};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// SEC-014: Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),

    /// Values parsed but cannot be used together.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// Enumerated settings
// ============================================================================

/// Which remote service the engine talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Standalone,
    Nextcloud,
    Miniflux,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendKind::Standalone => "standalone",
            BackendKind::Nextcloud => "nextcloud",
            BackendKind::Miniflux => "miniflux",
        })
    }
}

/// What a sync trigger does while a pass is already running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerPolicy {
    /// Leave the running pass alone; the caller is told which pass is running.
    #[default]
    Coalesce,
    /// Run exactly one more pass after the current one finishes.
    Queue,
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level application configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
///
/// SEC-015: `password` is a `SecretString` and is masked in `Debug` output.
#[derive(Deserialize)]
#[serde(default)]
pub struct Config {
    pub backend: BackendKind,

    /// Base URL of the Nextcloud or Miniflux server.
    pub server_url: Option<String>,

    pub username: Option<String>,

    /// Server password. `NEWSYNC_PASSWORD` takes precedence over the file.
    #[serde(deserialize_with = "deserialize_secret")]
    pub password: Option<SecretString>,

    /// Run a sync pass before executing a CLI command.
    pub sync_on_startup: bool,

    /// Interval for the `daemon` loop in minutes. 0 = disabled.
    pub background_sync_interval_minutes: u64,

    /// Upper bound on feeds whose entries are fetched concurrently.
    pub max_concurrent_feeds: usize,

    /// Retries after the first attempt for transient remote failures.
    pub max_retries: u32,

    /// Backoff base; attempt n waits `retry_base_delay_ms * 2^n`.
    pub retry_base_delay_ms: u64,

    /// Entries requested per page from server backends.
    pub entry_page_size: u32,

    pub trigger_policy: TriggerPolicy,

    /// Permit feed URLs on localhost and private networks (standalone mode).
    pub allow_private_hosts: bool,
}

fn deserialize_secret<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<SecretString>, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.map(SecretString::from))
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendKind::Standalone,
            server_url: None,
            username: None,
            password: None,
            sync_on_startup: true,
            background_sync_interval_minutes: 0,
            max_concurrent_feeds: 4,
            max_retries: 3,
            retry_base_delay_ms: 1000,
            entry_page_size: 200,
            trigger_policy: TriggerPolicy::Coalesce,
            allow_private_hosts: false,
        }
    }
}

/// SEC-015: Mask the password in Debug output to prevent secret leakage.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("backend", &self.backend)
            .field("server_url", &self.server_url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("sync_on_startup", &self.sync_on_startup)
            .field(
                "background_sync_interval_minutes",
                &self.background_sync_interval_minutes,
            )
            .field("max_concurrent_feeds", &self.max_concurrent_feeds)
            .field("max_retries", &self.max_retries)
            .field("retry_base_delay_ms", &self.retry_base_delay_ms)
            .field("entry_page_size", &self.entry_page_size)
            .field("trigger_policy", &self.trigger_policy)
            .field("allow_private_hosts", &self.allow_private_hosts)
            .finish()
    }
}

const KNOWN_KEYS: [&str; 12] = [
    "backend",
    "server_url",
    "username",
    "password",
    "sync_on_startup",
    "background_sync_interval_minutes",
    "max_concurrent_feeds",
    "max_retries",
    "retry_base_delay_ms",
    "entry_page_size",
    "trigger_policy",
    "allow_private_hosts",
];

impl Config {
    /// SEC-014: Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    /// - Out-of-range values → `Err(ConfigError::Invalid)`
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load_file(path)?;
        if let Ok(password) = std::env::var("NEWSYNC_PASSWORD") {
            if !password.is_empty() {
                config.password = Some(SecretString::from(password));
            }
        }
        config.validate()?;
        Ok(config)
    }

    fn load_file(path: &Path) -> Result<Self, ConfigError> {
        // SEC-014: Check file size before reading to prevent memory exhaustion.
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Race condition: file deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        tracing::info!(path = %path.display(), backend = %config.backend, "Loaded configuration");
        Ok(config)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_feeds == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_feeds must be at least 1".to_string(),
            ));
        }
        if self.entry_page_size == 0 {
            return Err(ConfigError::Invalid(
                "entry_page_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Default config location: `~/.config/newsync/config.toml`.
    pub fn default_path() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(|home| {
            std::path::PathBuf::from(home)
                .join(".config")
                .join("newsync")
                .join("config.toml")
        })
    }

    /// Background interval, `None` when periodic sync is disabled.
    pub fn background_interval(&self) -> Option<Duration> {
        (self.background_sync_interval_minutes > 0)
            .then(|| Duration::from_secs(self.background_sync_interval_minutes * 60))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    fn write_config(name: &str, content: &str) -> (std::path::PathBuf, std::path::PathBuf) {
        let dir = std::env::temp_dir().join(format!("newsync_config_test_{name}"));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.backend, BackendKind::Standalone);
        assert!(config.sync_on_startup);
        assert_eq!(config.background_sync_interval_minutes, 0);
        assert_eq!(config.max_concurrent_feeds, 4);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.trigger_policy, TriggerPolicy::Coalesce);
        assert!(config.password.is_none());
        assert!(config.background_interval().is_none());
    }

    #[test]
    fn test_missing_file_returns_default() {
        let path = Path::new("/tmp/newsync_test_nonexistent_config.toml");
        let config = Config::load_file(path).unwrap();
        assert_eq!(config.backend, BackendKind::Standalone);
    }

    #[test]
    fn test_whitespace_only_file_returns_default() {
        let (dir, path) = write_config("whitespace", "   \n  \n  ");
        let config = Config::load_file(&path).unwrap();
        assert_eq!(config.entry_page_size, 200);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_full_config() {
        let (dir, path) = write_config(
            "full",
            r#"
backend = "miniflux"
server_url = "https://rss.example.com"
username = "alice"
password = "hunter2"
sync_on_startup = false
background_sync_interval_minutes = 15
max_concurrent_feeds = 8
max_retries = 5
retry_base_delay_ms = 250
entry_page_size = 50
trigger_policy = "queue"
allow_private_hosts = true
"#,
        );

        let config = Config::load_file(&path).unwrap();
        assert_eq!(config.backend, BackendKind::Miniflux);
        assert_eq!(config.server_url.as_deref(), Some("https://rss.example.com"));
        assert_eq!(
            config.password.as_ref().map(|p| p.expose_secret().to_string()),
            Some("hunter2".to_string())
        );
        assert!(!config.sync_on_startup);
        assert_eq!(config.background_interval(), Some(Duration::from_secs(900)));
        assert_eq!(config.max_concurrent_feeds, 8);
        assert_eq!(config.trigger_policy, TriggerPolicy::Queue);
        assert!(config.allow_private_hosts);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let (dir, path) = write_config("invalid", "this is not [valid toml");
        let err = Config::load_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(err.to_string().contains("Invalid TOML"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let (dir, path) = write_config("bad_backend", "backend = \"feedbin\"\n");
        assert!(matches!(Config::load_file(&path), Err(ConfigError::Parse(_))));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_unknown_keys_accepted() {
        let (dir, path) = write_config("unknown", "backend = \"nextcloud\"\ntheme = \"dark\"\n");
        let config = Config::load_file(&path).unwrap();
        assert_eq!(config.backend, BackendKind::Nextcloud);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_trigger_policy_from_file() {
        let (dir, path) = write_config("policy", "backend = \"nextcloud\"\n");
        assert_eq!(Config::load_file(&path).unwrap().trigger_policy, TriggerPolicy::Coalesce);
        std::fs::remove_dir_all(&dir).ok();

        let (dir, path) = write_config("bad_policy", "trigger_policy = \"later\"\n");
        assert!(matches!(Config::load_file(&path), Err(ConfigError::Parse(_))));
        std::fs::remove_dir_all(&dir).ok();
    }

    // SEC-014: File size limit
    #[test]
    fn test_too_large_file_rejected() {
        let (dir, path) = write_config("too_large", &"a".repeat(1_048_577));
        let err = Config::load_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::TooLarge(_)));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_validate_rejects_zero_bounds() {
        let config = Config {
            max_concurrent_feeds: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = Config {
            entry_page_size: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    // SEC-015: Debug output masks the password
    #[test]
    fn test_debug_masks_password() {
        let config = Config {
            password: Some(SecretString::from("super-secret-pw")),
            ..Config::default()
        };
        let debug_output = format!("{:?}", config);
        assert!(!debug_output.contains("super-secret-pw"));
        assert!(debug_output.contains("[REDACTED]"));
    }
}
