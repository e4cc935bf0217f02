use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;

use refinery_core::error::{RefineryError, Result};
use refinery_core::traits::AgentProcessor;

/// One recorded `process` call.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorCall {
    pub system_prompt: String,
    pub user_prompt: String,
}

/// Scripted processor.
///
/// Returns `"{user_prompt}|{system_prompt}"`, so with fixture agents whose system
/// prompt is their name, a chain a -> b -> c over `doc` ends in `doc|a|b|c`.
/// Failures and delays are keyed by system prompt.
#[derive(Default)]
pub struct MockProcessor {
    calls: Mutex<Vec<ProcessorCall>>,
    failures: Mutex<HashMap<String, usize>>,
    delays: HashMap<String, Duration>,
}

impl MockProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` calls for this system prompt.
    pub fn failing(self, system_prompt: &str, times: usize) -> Self {
        if let Ok(mut failures) = self.failures.lock() {
            failures.insert(system_prompt.to_string(), times);
        }
        self
    }

    /// Fail every call for this system prompt.
    pub fn always_failing(self, system_prompt: &str) -> Self {
        self.failing(system_prompt, usize::MAX)
    }

    /// Sleep before answering calls for this system prompt.
    pub fn delayed(mut self, system_prompt: &str, delay: Duration) -> Self {
        self.delays.insert(system_prompt.to_string(), delay);
        self
    }

    pub fn calls(&self) -> Vec<ProcessorCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Calls made with this system prompt.
    pub fn calls_for(&self, system_prompt: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.system_prompt == system_prompt)
            .count()
    }

    fn take_failure(&self, system_prompt: &str) -> bool {
        let Ok(mut failures) = self.failures.lock() else {
            return false;
        };
        match failures.get_mut(system_prompt) {
            Some(remaining) if *remaining > 0 => {
                if *remaining != usize::MAX {
                    *remaining -= 1;
                }
                true
            }
            _ => false,
        }
    }
}

impl AgentProcessor for MockProcessor {
    fn name(&self) -> &str {
        "mock"
    }

    fn process(&self, system_prompt: &str, user_prompt: &str) -> BoxFuture<'_, Result<String>> {
        let system_prompt = system_prompt.to_string();
        let user_prompt = user_prompt.to_string();
        Box::pin(async move {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(ProcessorCall {
                    system_prompt: system_prompt.clone(),
                    user_prompt: user_prompt.clone(),
                });
            }

            if let Some(delay) = self.delays.get(&system_prompt) {
                tokio::time::sleep(*delay).await;
            }

            if self.take_failure(&system_prompt) {
                return Err(RefineryError::ProcessorRequest(format!(
                    "mock failure for {system_prompt}"
                )));
            }

            Ok(format!("{user_prompt}|{system_prompt}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo_and_record() {
        let mock = MockProcessor::new();
        let out = mock.process("A", "doc").await.unwrap();
        assert_eq!(out, "doc|A");
        assert_eq!(mock.call_count(), 1);
        assert_eq!(mock.calls()[0].user_prompt, "doc");
    }

    #[tokio::test]
    async fn test_scripted_failures() {
        let mock = MockProcessor::new().failing("A", 2);
        assert!(mock.process("A", "doc").await.is_err());
        assert!(mock.process("A", "doc").await.is_err());
        assert!(mock.process("A", "doc").await.is_ok());
        assert!(mock.process("B", "doc").await.is_ok());
        assert_eq!(mock.calls_for("A"), 3);
    }
}
