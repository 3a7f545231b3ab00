use crate::escalation::{EscalationAction, EscalationPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from stallguard.toml.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct StallguardConfig {
    pub supervise: SuperviseConfig,
    pub escalation: EscalationConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SuperviseConfig {
    /// Length of each bounded wait.
    pub timeout_secs: f64,
    /// How often a child process is polled inside one wait.
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct EscalationConfig {
    pub max_attempts: Option<u64>,
    pub max_elapsed_secs: Option<f64>,
    pub action: ActionSetting,
    pub exit_code: i32,
    pub respect_debugger: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionSetting {
    Abort,
    Terminate,
    Exit,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

// --- Default implementations ---

impl Default for SuperviseConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 5.0,
            poll_interval_ms: 50,
        }
    }
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            max_elapsed_secs: None,
            action: ActionSetting::Abort,
            exit_code: 70,
            respect_debugger: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Errors from loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::Invalid(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid(_) => None,
        }
    }
}

/// Load config from `path`. A missing file yields the defaults.
pub fn load(path: &Path) -> Result<StallguardConfig, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(StallguardConfig::default());
        }
        Err(e) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };
    toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Key-value override names.
pub const ENV_TIMEOUT_SECS: &str = "STALLGUARD_TIMEOUT_SECS";
pub const ENV_MAX_ATTEMPTS: &str = "STALLGUARD_MAX_ATTEMPTS";
pub const ENV_MAX_ELAPSED_SECS: &str = "STALLGUARD_MAX_ELAPSED_SECS";
pub const ENV_ESCALATION: &str = "STALLGUARD_ESCALATION";

fn parse_override<T: std::str::FromStr>(key: &str, value: &str) -> Option<T> {
    match value.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value, "ignoring unparseable config override");
            None
        }
    }
}

/// `value` as a `Duration`, if it is positive and representable.
fn positive_secs(name: &str, value: f64) -> Result<Duration, ConfigError> {
    match Duration::try_from_secs_f64(value) {
        Ok(d) if !d.is_zero() && value > 0.0 => Ok(d),
        _ => Err(ConfigError::Invalid(format!(
            "{name} must be a positive number of seconds no larger than {}, got {value}",
            Duration::MAX.as_secs()
        ))),
    }
}

fn saturating_secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::MAX)
}

impl StallguardConfig {
    /// Apply overrides from a key-value source (normally the environment).
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_TIMEOUT_SECS).and_then(|v| parse_override(ENV_TIMEOUT_SECS, &v)) {
            self.supervise.timeout_secs = v;
        }
        if let Some(v) = lookup(ENV_MAX_ATTEMPTS).and_then(|v| parse_override(ENV_MAX_ATTEMPTS, &v)) {
            self.escalation.max_attempts = Some(v);
        }
        if let Some(v) =
            lookup(ENV_MAX_ELAPSED_SECS).and_then(|v| parse_override(ENV_MAX_ELAPSED_SECS, &v))
        {
            self.escalation.max_elapsed_secs = Some(v);
        }
        if let Some(v) = lookup(ENV_ESCALATION) {
            match v.trim().to_ascii_lowercase().as_str() {
                "abort" => self.escalation.action = ActionSetting::Abort,
                "terminate" => self.escalation.action = ActionSetting::Terminate,
                "exit" => self.escalation.action = ActionSetting::Exit,
                other => {
                    tracing::warn!(key = ENV_ESCALATION, value = other, "ignoring unknown escalation action")
                }
            }
        }
    }

    /// Reject values the supervisor cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive_secs("supervise.timeout_secs", self.supervise.timeout_secs)?;
        if self.supervise.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "supervise.poll_interval_ms must be at least 1".to_string(),
            ));
        }
        if let Some(elapsed) = self.escalation.max_elapsed_secs {
            positive_secs("escalation.max_elapsed_secs", elapsed)?;
        }
        if self.escalation.max_attempts == Some(0) {
            return Err(ConfigError::Invalid(
                "escalation.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Per-attempt timeout. Values `validate` would reject saturate.
    pub fn timeout(&self) -> Duration {
        saturating_secs(self.supervise.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.supervise.poll_interval_ms)
    }

    pub fn escalation_policy(&self) -> EscalationPolicy {
        EscalationPolicy {
            max_attempts: self.escalation.max_attempts,
            max_elapsed: self.escalation.max_elapsed_secs.map(saturating_secs),
            respect_debugger: self.escalation.respect_debugger,
        }
    }

    pub fn escalation_action(&self) -> EscalationAction {
        match self.escalation.action {
            ActionSetting::Abort => EscalationAction::Abort,
            ActionSetting::Terminate => EscalationAction::Terminate,
            ActionSetting::Exit => EscalationAction::Exit(self.escalation.exit_code),
        }
    }
}
