//! Configuration types.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// What happens to dependents when an upstream task dies (terminal FAILED or CANCELLED).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DependencyFailurePolicy {
    /// Dependents stay BLOCKED and visible; they can still be cancelled by hand.
    #[default]
    RemainBlocked,
    /// Dependents are cancelled along with the upstream task.
    Cancel,
}

impl FromStr for DependencyFailurePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "block" | "blocked" | "remain_blocked" => Ok(Self::RemainBlocked),
            "cancel" => Ok(Self::Cancel),
            other => Err(ConfigError::InvalidValue {
                key: "WORK_ENGINE_ON_DEPENDENCY_FAILURE".to_string(),
                message: format!("expected `block` or `cancel`, got `{other}`"),
            }),
        }
    }
}

/// Engine configuration, supplied once at startup.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Path of the task database file.
    pub db_path: PathBuf,
    /// Number of concurrent worker slots.
    pub max_workers: usize,
    /// Base delay for exponential retry backoff.
    pub base_retry_delay: Duration,
    /// Upper bound for any single backoff delay.
    pub max_retry_delay: Duration,
    /// Timeout applied to actions without a specific override.
    pub default_action_timeout: Duration,
    /// Per-action timeout overrides, keyed by action name.
    pub action_timeouts: HashMap<String, Duration>,
    /// Extra denylist regexes, on top of the built-in set.
    pub denylist: Vec<String>,
    /// Parent directory for per-invocation working directories.
    pub workdir_root: PathBuf,
    /// Root the `file_operation` action is confined to.
    pub file_root: PathBuf,
    /// How long a cancelled handler gets before the slot is forcibly freed.
    pub cancel_grace: Duration,
    /// Fallback interval at which idle slots re-check for ready work.
    pub poll_interval: Duration,
    /// `max_retries` used when a submission does not specify one.
    pub default_max_retries: u32,
    /// Fate of dependents when an upstream task dies.
    pub dependency_failure_policy: DependencyFailurePolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/work-engine.db"),
            max_workers: 4,
            base_retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(300), // 5 minutes
            default_action_timeout: Duration::from_secs(120),
            action_timeouts: HashMap::new(),
            denylist: Vec::new(),
            workdir_root: std::env::temp_dir(),
            file_root: PathBuf::from("./data/files"),
            cancel_grace: Duration::from_secs(5),
            poll_interval: Duration::from_millis(500),
            default_max_retries: 3,
            dependency_failure_policy: DependencyFailurePolicy::RemainBlocked,
        }
    }
}

impl EngineConfig {
    /// Load configuration from `WORK_ENGINE_*` environment variables.
    ///
    /// Unset variables keep their defaults; set-but-unparseable ones are errors.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok(), std::env::vars())
    }

    fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
        all: impl Iterator<Item = (String, String)>,
    ) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(path) = lookup("WORK_ENGINE_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }
        if let Some(n) = parse_var::<usize>(&lookup, "WORK_ENGINE_MAX_WORKERS")? {
            config.max_workers = n;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "WORK_ENGINE_BASE_RETRY_DELAY_MS")? {
            config.base_retry_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "WORK_ENGINE_MAX_RETRY_DELAY_MS")? {
            config.max_retry_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "WORK_ENGINE_ACTION_TIMEOUT_SECS")? {
            config.default_action_timeout = Duration::from_secs(secs);
        }
        if let Some(patterns) = lookup("WORK_ENGINE_DENYLIST") {
            config.denylist = patterns
                .split(";;")
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(dir) = lookup("WORK_ENGINE_WORKDIR_ROOT") {
            config.workdir_root = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("WORK_ENGINE_FILE_ROOT") {
            config.file_root = PathBuf::from(dir);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "WORK_ENGINE_CANCEL_GRACE_MS")? {
            config.cancel_grace = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "WORK_ENGINE_POLL_INTERVAL_MS")? {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(n) = parse_var::<u32>(&lookup, "WORK_ENGINE_DEFAULT_MAX_RETRIES")? {
            config.default_max_retries = n;
        }
        if let Some(policy) = lookup("WORK_ENGINE_ON_DEPENDENCY_FAILURE") {
            config.dependency_failure_policy = policy.parse()?;
        }

        // WORK_ENGINE_TIMEOUT_HTTP_REQUEST=30 -> action_timeouts["http_request"] = 30s
        for (key, value) in all {
            let Some(action) = key.strip_prefix("WORK_ENGINE_TIMEOUT_") else {
                continue;
            };
            let secs: u64 = value.trim().parse().map_err(|e| ConfigError::InvalidValue {
                key: key.clone(),
                message: format!("{e}"),
            })?;
            config
                .action_timeouts
                .insert(action.to_ascii_lowercase(), Duration::from_secs(secs));
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_workers".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.max_retry_delay < self.base_retry_delay {
            return Err(ConfigError::InvalidValue {
                key: "max_retry_delay".to_string(),
                message: "must not be smaller than base_retry_delay".to_string(),
            });
        }
        if self.default_action_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "default_action_timeout".to_string(),
                message: "must be finite and non-zero".to_string(),
            });
        }
        Ok(())
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
    }
}
