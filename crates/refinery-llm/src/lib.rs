pub mod openai;
pub mod timeout;

use std::sync::Arc;
use std::time::Duration;

use refinery_core::config::ProcessorConfig;
use refinery_core::traits::AgentProcessor;

pub use openai::OpenAiProcessor;
pub use timeout::TimeoutProcessor;

/// Create the processor described by the config, wrapped in a timeout when
/// `timeout_secs` is non-zero.
pub fn create_processor(config: &ProcessorConfig) -> Arc<dyn AgentProcessor> {
    // Every provider currently speaks the OpenAI chat completions protocol
    let inner = OpenAiProcessor::new(config.clone());
    if config.timeout_secs > 0 {
        Arc::new(TimeoutProcessor::new(
            inner,
            Duration::from_secs(config.timeout_secs),
        ))
    } else {
        Arc::new(inner)
    }
}
