use std::io::Write;

use refinery_core::config::{AppConfig, Backoff, RetryPolicy};
use refinery_core::types::{Agent, Connection};

/// Agent whose id and system prompt are both `name`.
pub fn agent(name: &str) -> Agent {
    Agent::new(name, name.to_uppercase())
        .with_id(name)
        .with_system_prompt(name)
        .with_user_prompt_template("{{document}}")
}

pub fn connection(source: &str, target: &str) -> Connection {
    Connection::new(source, target)
}

/// Agents plus connections linking them in order.
pub fn chain(names: &[&str]) -> (Vec<Agent>, Vec<Connection>) {
    let agents = names.iter().map(|n| agent(n)).collect();
    let connections = names.windows(2).map(|w| connection(w[0], w[1])).collect();
    (agents, connections)
}

/// Config with immediate retries, no JSONL log and no exclusions.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.queue.agent = RetryPolicy::new(3, Backoff::Fixed { delay_ms: 0 });
    config.queue.orchestration = RetryPolicy::new(1, Backoff::Fixed { delay_ms: 0 });
    config.workers.concurrency = 4;
    config.graph.excluded_agents = vec![];
    config.log.enabled = false;
    config
}

pub fn config_from_toml(toml_str: &str) -> AppConfig {
    toml::from_str(toml_str).expect("valid test config")
}

/// Write `content` to a temp file that lives as long as the handle.
pub fn temp_config_file(content: &str) -> tempfile::NamedTempFile {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(content.as_bytes()).expect("write config");
    tmp
}
