use crate::error::Result;
use crate::paths;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// VerificationConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationConfig {
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Attempts per verification invocation, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Upper bound on `last_verification_output`, in bytes.
    #[serde(default = "default_output_limit")]
    pub output_limit_bytes: usize,
}

fn default_timeout_seconds() -> u64 {
    300
}

fn default_max_attempts() -> u32 {
    3
}

fn default_output_limit() -> usize {
    8 * 1024
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout_seconds(),
            max_attempts: default_max_attempts(),
            output_limit_bytes: default_output_limit(),
        }
    }
}

impl VerificationConfig {
    /// `None` means wait indefinitely.
    pub fn timeout(&self) -> Option<Duration> {
        if self.timeout_seconds == 0 {
            None
        } else {
            Some(Duration::from_secs(self.timeout_seconds))
        }
    }
}

// ---------------------------------------------------------------------------
// LockConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockConfig {
    /// Retries after the first failed `try_lock`.
    #[serde(default = "default_lock_retries")]
    pub retries: u32,
    /// First backoff delay; doubles on each retry.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_lock_retries() -> u32 {
    5
}

fn default_backoff_ms() -> u64 {
    50
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            retries: default_lock_retries(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// TrackerConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TrackerConfig {
    #[default]
    None,
    /// Argv templates. Placeholders: `{description}`, `{ref}`, `{status}`, `{reason}`.
    Command {
        create: Vec<String>,
        close: Vec<String>,
        update: Vec<String>,
    },
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub verification: VerificationConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
}

fn default_version() -> u32 {
    1
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            verification: VerificationConfig::default(),
            lock: LockConfig::default(),
            tracker: TrackerConfig::default(),
        }
    }
}

impl Config {
    /// Load `.harness/config.yaml`. A missing file yields the defaults.
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    /// Write the default config unless one already exists.
    pub fn write_default_if_missing(root: &Path) -> Result<bool> {
        let data = serde_yaml::to_string(&Self::default())?;
        crate::io::write_if_missing(&paths::config_path(root), data.as_bytes())
    }

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if self.verification.max_attempts == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "verification.max_attempts is 0; verification can never pass".to_string(),
            });
        } else if self.verification.max_attempts > 10 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "verification.max_attempts={} (>10 is unusual)",
                    self.verification.max_attempts
                ),
            });
        }

        if self.verification.timeout_seconds == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "verification.timeout_seconds is 0; a hung check blocks forever"
                    .to_string(),
            });
        }

        if self.verification.output_limit_bytes < 256 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "verification.output_limit_bytes={} leaves little room for diagnostics",
                    self.verification.output_limit_bytes
                ),
            });
        }

        if let TrackerConfig::Command {
            create,
            close,
            update,
        } = &self.tracker
        {
            for (name, argv) in [("create", create), ("close", close), ("update", update)] {
                if argv.is_empty() || argv[0].trim().is_empty() {
                    warnings.push(ConfigWarning {
                        level: WarnLevel::Warning,
                        message: format!("tracker.{name} has an empty command"),
                    });
                }
            }
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let cfg = Config::load(dir.path()).unwrap();
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.verification.max_attempts, 3);
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let yaml = "verification:\n  timeout_seconds: 30\n";
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.verification.timeout_seconds, 30);
        assert_eq!(cfg.verification.max_attempts, 3);
        assert_eq!(cfg.lock.retries, 5);
        assert_eq!(cfg.tracker, TrackerConfig::None);
    }

    #[test]
    fn command_tracker_yaml() {
        let yaml = r#"
tracker:
  type: command
  create: ["bd", "create", "--title", "{description}"]
  close: ["bd", "close", "{ref}", "--reason", "{reason}"]
  update: ["bd", "update", "{ref}", "--status", "{status}"]
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        match cfg.tracker {
            TrackerConfig::Command { create, .. } => assert_eq!(create[0], "bd"),
            other => panic!("expected command tracker, got {other:?}"),
        }
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut cfg = Config::default();
        cfg.verification.max_attempts = 5;
        cfg.save(dir.path()).unwrap();
        assert_eq!(Config::load(dir.path()).unwrap(), cfg);
    }

    #[test]
    fn write_default_is_idempotent() {
        let dir = TempDir::new().unwrap();
        assert!(Config::write_default_if_missing(dir.path()).unwrap());
        assert!(!Config::write_default_if_missing(dir.path()).unwrap());
    }

    #[test]
    fn zero_timeout_means_unbounded() {
        let cfg = VerificationConfig {
            timeout_seconds: 0,
            ..Default::default()
        };
        assert!(cfg.timeout().is_none());
    }

    #[test]
    fn default_config_has_no_warnings() {
        assert!(Config::default().validate().is_empty());
    }

    #[test]
    fn validate_flags_bad_values() {
        let mut cfg = Config::default();
        cfg.verification.max_attempts = 0;
        cfg.tracker = TrackerConfig::Command {
            create: vec![],
            close: vec!["bd".into()],
            update: vec!["bd".into()],
        };
        let warnings = cfg.validate();
        assert!(warnings.iter().any(|w| w.level == WarnLevel::Error));
        assert!(warnings.iter().any(|w| w.message.contains("tracker.create")));
    }
}
