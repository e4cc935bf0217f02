use std::time::Duration;

use futures::future::BoxFuture;
use tracing::warn;

use refinery_core::error::{RefineryError, Result};
use refinery_core::traits::AgentProcessor;

/// Bounds every call of the wrapped processor.
pub struct TimeoutProcessor<P> {
    inner: P,
    timeout: Duration,
}

impl<P: AgentProcessor> TimeoutProcessor<P> {
    pub fn new(inner: P, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

impl<P: AgentProcessor> AgentProcessor for TimeoutProcessor<P> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn process(&self, system_prompt: &str, user_prompt: &str) -> BoxFuture<'_, Result<String>> {
        let system_prompt = system_prompt.to_string();
        let user_prompt = user_prompt.to_string();
        Box::pin(async move {
            match tokio::time::timeout(
                self.timeout,
                self.inner.process(&system_prompt, &user_prompt),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => {
                    warn!(
                        processor = self.inner.name(),
                        timeout_secs = self.timeout.as_secs(),
                        "Processor call timed out"
                    );
                    Err(RefineryError::ProcessorTimeout(self.timeout.as_secs()))
                }
            }
        })
    }
}
