use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::task::IsolationMode;
use crate::{clog_debug, Error, Result};

pub const DEFAULT_AGENT_COMMAND: &str = "claude -p";
pub const DEFAULT_CONTAINER_WRAPPER: &str =
    "docker run --rm -i -v {workspace}:/workspace -w /workspace conductor-agent";
pub const DEFAULT_SANDBOX_WRAPPER: &str =
    "bwrap --dev-bind / / --bind {workspace} {workspace} --chdir {workspace}";

/// How eligible tasks are ordered when there are more than free slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PriorityKind {
    /// Compile order.
    #[default]
    Fifo,
    /// Longest downstream chain first.
    CriticalPath,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum attempts in flight at once.
    pub concurrency: usize,
    pub isolation: IsolationMode,
    /// Retries before the ladder moves past the retry rung.
    pub max_retries: u32,
    pub task_timeout_secs: u64,
    pub verification_timeout_secs: u64,
    pub decompose: bool,
    pub peer_review: bool,
    pub max_peer_reviews: u32,
    pub agent_command: Option<String>,
    /// Command for the recovery advisor; falls back to `agent_command`.
    pub reviewer_command: Option<String>,
    /// `{workspace}` is replaced by the run workspace path.
    pub container_wrapper: Option<String>,
    pub sandbox_wrapper: Option<String>,
    pub branch_prefix: String,
    pub commit_poll_ms: u64,
    pub priority: PriorityKind,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            concurrency: 4,
            isolation: IsolationMode::Direct,
            max_retries: 2,
            task_timeout_secs: 30 * 60,
            verification_timeout_secs: 5 * 60,
            decompose: true,
            peer_review: true,
            max_peer_reviews: 1,
            agent_command: None,
            reviewer_command: None,
            container_wrapper: None,
            sandbox_wrapper: None,
            branch_prefix: "conductor".to_string(),
            commit_poll_ms: 1000,
            priority: PriorityKind::Fifo,
        }
    }
}

/// A partial config file (repo-level settings override only what they name).
#[derive(Debug, Clone, Default, Deserialize)]
struct ConfigOverlay {
    concurrency: Option<usize>,
    isolation: Option<IsolationMode>,
    max_retries: Option<u32>,
    task_timeout_secs: Option<u64>,
    verification_timeout_secs: Option<u64>,
    decompose: Option<bool>,
    peer_review: Option<bool>,
    max_peer_reviews: Option<u32>,
    agent_command: Option<String>,
    reviewer_command: Option<String>,
    container_wrapper: Option<String>,
    sandbox_wrapper: Option<String>,
    branch_prefix: Option<String>,
    commit_poll_ms: Option<u64>,
    priority: Option<PriorityKind>,
}

macro_rules! overlay {
    ($config:ident, $overlay:ident, $($field:ident),+ $(,)?) => {
        $(if let Some(value) = $overlay.$field { $config.$field = value; })+
    };
}

impl Config {
    pub fn conductor_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".conductor"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::conductor_dir()?.join("conductor.toml"))
    }

    /// Per-repository state directory.
    pub fn repo_dir(repo: &Path) -> PathBuf {
        repo.join(".conductor")
    }

    pub fn repo_config_path(repo: &Path) -> PathBuf {
        Self::repo_dir(repo).join("config.toml")
    }

    /// Global config, then environment.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = Self::load_file(&path)?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Global config, then `<repo>/.conductor/config.toml`, then environment.
    pub fn load_for_repo(repo: &Path) -> Result<Self> {
        let mut config = Self::load_file(&Self::config_path()?)?;
        config.overlay_file(&Self::repo_config_path(repo))?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    fn load_file(path: &Path) -> Result<Self> {
        clog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            clog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        clog_debug!(
            "Config loaded: concurrency={}, isolation={}, max_retries={}",
            config.concurrency,
            config.isolation,
            config.max_retries
        );
        Ok(config)
    }

    /// Apply the keys present in `path`, if it exists.
    pub fn overlay_file(&mut self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Ok(());
        }
        clog_debug!("Config::overlay_file path={}", path.display());
        let overlay: ConfigOverlay = toml::from_str(&fs::read_to_string(path)?)?;
        let config = self;
        overlay!(
            config,
            overlay,
            concurrency,
            isolation,
            max_retries,
            task_timeout_secs,
            verification_timeout_secs,
            decompose,
            peer_review,
            max_peer_reviews,
            branch_prefix,
            commit_poll_ms,
            priority,
        );
        if overlay.agent_command.is_some() {
            config.agent_command = overlay.agent_command;
        }
        if overlay.reviewer_command.is_some() {
            config.reviewer_command = overlay.reviewer_command;
        }
        if overlay.container_wrapper.is_some() {
            config.container_wrapper = overlay.container_wrapper;
        }
        if overlay.sandbox_wrapper.is_some() {
            config.sandbox_wrapper = overlay.sandbox_wrapper;
        }
        Ok(())
    }

    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply `CONDUCTOR_*` overrides read through `lookup`.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("CONDUCTOR_CONCURRENCY") {
            self.concurrency = parse_env("CONDUCTOR_CONCURRENCY", &v)?;
        }
        if let Some(v) = lookup("CONDUCTOR_MAX_RETRIES") {
            self.max_retries = parse_env("CONDUCTOR_MAX_RETRIES", &v)?;
        }
        if let Some(v) = lookup("CONDUCTOR_TASK_TIMEOUT") {
            self.task_timeout_secs = parse_env("CONDUCTOR_TASK_TIMEOUT", &v)?;
        }
        if let Some(v) = lookup("CONDUCTOR_PEER_REVIEW") {
            self.peer_review = parse_bool(&v).ok_or_else(|| {
                Error::Validation(format!("CONDUCTOR_PEER_REVIEW: not a boolean: {}", v))
            })?;
        }
        if let Some(v) = lookup("CONDUCTOR_ISOLATION") {
            self.isolation = v.parse()?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(Error::Validation("concurrency must be at least 1".to_string()));
        }
        if self.task_timeout_secs == 0 {
            return Err(Error::Validation("task_timeout_secs must be positive".to_string()));
        }
        if self.branch_prefix.trim().is_empty() {
            return Err(Error::Validation("branch_prefix must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::conductor_dir()?;
        clog_debug!("Config::save dir={}", dir.display());
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        clog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn effective_agent_command(&self) -> &str {
        self.agent_command.as_deref().unwrap_or(DEFAULT_AGENT_COMMAND)
    }

    pub fn effective_reviewer_command(&self) -> &str {
        self.reviewer_command
            .as_deref()
            .unwrap_or_else(|| self.effective_agent_command())
    }

    pub fn effective_container_wrapper(&self) -> &str {
        self.container_wrapper
            .as_deref()
            .unwrap_or(DEFAULT_CONTAINER_WRAPPER)
    }

    pub fn effective_sandbox_wrapper(&self) -> &str {
        self.sandbox_wrapper.as_deref().unwrap_or(DEFAULT_SANDBOX_WRAPPER)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn verification_timeout(&self) -> Duration {
        Duration::from_secs(self.verification_timeout_secs)
    }

    pub fn commit_poll_interval(&self) -> Duration {
        Duration::from_millis(self.commit_poll_ms.max(10))
    }

    /// Upper bound on attempts for one task across every ladder rung,
    /// counted from the latest human decision.
    pub fn max_attempts_per_task(&self) -> u32 {
        1 + self.max_retries + if self.peer_review { self.max_peer_reviews } else { 0 }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Validation(format!("{}: invalid value: {}", key, value)))
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
