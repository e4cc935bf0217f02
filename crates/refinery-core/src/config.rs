use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{RefineryError, Result};

/// Top-level configuration, read from `refinery.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub graph: GraphConfig,
    #[serde(default)]
    pub processor: ProcessorConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// Agents created or updated by `refinery seed`.
    #[serde(default)]
    pub agents: Vec<AgentSeed>,
    /// Connections created by `refinery seed`, referenced by agent name.
    #[serde(default)]
    pub connections: Vec<ConnectionSeed>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> String { "~/.refinery/refinery.db".to_string() }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Jobs processed concurrently. Each worker runs one job at a time.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
        }
    }
}

fn default_concurrency() -> usize { 4 }

/// Retry settings for the two job layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_orchestration_retry")]
    pub orchestration: RetryPolicy,
    #[serde(default = "default_agent_retry")]
    pub agent: RetryPolicy,
    /// Whether a failed agent job fails the jobs waiting on it.
    #[serde(default = "default_fail_parent")]
    pub fail_parent_on_failure: bool,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            orchestration: default_orchestration_retry(),
            agent: default_agent_retry(),
            fail_parent_on_failure: default_fail_parent(),
            event_capacity: default_event_capacity(),
        }
    }
}

fn default_orchestration_retry() -> RetryPolicy {
    RetryPolicy {
        attempts: 1,
        backoff: Backoff::Fixed { delay_ms: 0 },
        jitter: false,
    }
}

fn default_agent_retry() -> RetryPolicy {
    RetryPolicy {
        attempts: 3,
        backoff: Backoff::Exponential { delay_ms: 1000 },
        jitter: false,
    }
}

fn default_fail_parent() -> bool { true }
fn default_event_capacity() -> usize { 256 }

/// Attempts and backoff applied to one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default)]
    pub backoff: Backoff,
    /// Add up to 25% random jitter to each delay.
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            backoff: Backoff::default(),
            jitter: false,
        }
    }
}

fn default_attempts() -> u32 { 1 }

impl RetryPolicy {
    pub fn new(attempts: u32, backoff: Backoff) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
            jitter: false,
        }
    }

    /// Delay before retrying after the given failed attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.backoff.base_delay_ms(attempt);
        let delay = if self.jitter && base > 0 {
            base + rand::thread_rng().gen_range(0..=base / 4)
        } else {
            base
        };
        Duration::from_millis(delay)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    Fixed { delay_ms: u64 },
    /// `delay_ms * 2^(attempt - 1)`.
    Exponential { delay_ms: u64 },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Fixed { delay_ms: 0 }
    }
}

impl Backoff {
    fn base_delay_ms(&self, attempt: u32) -> u64 {
        match *self {
            Self::Fixed { delay_ms } => delay_ms,
            Self::Exponential { delay_ms } => {
                let exp = attempt.saturating_sub(1).min(20);
                delay_ms.saturating_mul(1u64 << exp)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    /// Agent names that never take part in the improvement graph.
    #[serde(default = "default_excluded_agents")]
    pub excluded_agents: Vec<String>,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            excluded_agents: default_excluded_agents(),
        }
    }
}

fn default_excluded_agents() -> Vec<String> { vec!["extraction".to_string()] }

/// Text-generation backend used by every agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model_id")]
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Per-call timeout. 0 disables the timeout wrapper.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model_id: default_model_id(),
            api_key: None,
            base_url: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String { "openai".to_string() }
fn default_model_id() -> String { "gpt-4o-mini".to_string() }
fn default_max_tokens() -> u32 { 4096 }
fn default_temperature() -> f32 { 0.2 }
fn default_timeout_secs() -> u64 { 120 }

/// JSONL execution log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_dir() -> String { "~/.refinery/logs".to_string() }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String { "127.0.0.1:18790".to_string() }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSeed {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub order: i64,
    #[serde(default = "default_seed_active")]
    pub is_active: bool,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub user_prompt_template: Option<String>,
}

fn default_seed_active() -> bool { true }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSeed {
    /// Source agent name.
    pub source: String,
    /// Target agent name.
    pub target: String,
}

impl AppConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| RefineryError::ConfigNotFound(path.display().to_string()))?;

        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| RefineryError::Config(e.to_string()))
    }

    /// Resolve the SQLite database path (expand ~).
    pub fn store_path(&self) -> PathBuf {
        expand_home(&self.store.path)
    }

    /// Resolve the JSONL log directory (expand ~).
    pub fn log_dir(&self) -> PathBuf {
        expand_home(&self.log.log_dir)
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Unset variables stay verbatim
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_REFINERY_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_REFINERY_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_REFINERY_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_REFINERY_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_REFINERY_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.workers.concurrency, 4);
        assert_eq!(config.queue.orchestration.attempts, 1);
        assert_eq!(config.queue.agent.attempts, 3);
        assert_eq!(
            config.queue.agent.backoff,
            Backoff::Exponential { delay_ms: 1000 }
        );
        assert!(config.queue.fail_parent_on_failure);
        assert_eq!(config.graph.excluded_agents, vec!["extraction"]);
        assert_eq!(config.gateway.bind, "127.0.0.1:18790");
        assert!(config.agents.is_empty());
    }

    #[test]
    fn test_retry_policy_from_toml() {
        let toml_str = r#"
[queue.agent]
attempts = 5
backoff = { kind = "fixed", delay_ms = 250 }
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.queue.agent.attempts, 5);
        assert_eq!(config.queue.agent.delay_for(3), Duration::from_millis(250));
        // Untouched section keeps its defaults
        assert_eq!(config.queue.orchestration.attempts, 1);
    }

    #[test]
    fn test_exponential_delay() {
        let policy = RetryPolicy::new(4, Backoff::Exponential { delay_ms: 100 });
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
    }

    #[test]
    fn test_jitter_bounds() {
        let mut policy = RetryPolicy::new(2, Backoff::Fixed { delay_ms: 400 });
        policy.jitter = true;
        for _ in 0..20 {
            let d = policy.delay_for(1).as_millis();
            assert!((400..=500).contains(&d));
        }
    }

    #[test]
    fn test_seed_tables() {
        let toml_str = r#"
[[agents]]
name = "grammar"
display_name = "Grammar"
order = 1

[[agents]]
name = "tone"

[[connections]]
source = "grammar"
target = "tone"
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.agents.len(), 2);
        assert!(config.agents[1].is_active);
        assert_eq!(config.agents[1].display_name, None);
        assert_eq!(config.connections[0].source, "grammar");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("refinery.toml");
        std::fs::write(&path, "[workers]\nconcurrency = 9\n").unwrap();
        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.workers.concurrency, 9);

        let missing = AppConfig::load(&dir.path().join("nope.toml"));
        assert!(matches!(missing, Err(RefineryError::ConfigNotFound(_))));
    }

    #[test]
    fn test_store_path_expands_home() {
        std::env::set_var("HOME", "/home/tester");
        let config = AppConfig::default();
        assert_eq!(
            config.store_path(),
            PathBuf::from("/home/tester/.refinery/refinery.db")
        );
    }
}
