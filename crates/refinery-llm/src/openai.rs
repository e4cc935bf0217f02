use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use refinery_core::config::ProcessorConfig;
use refinery_core::error::{RefineryError, Result};
use refinery_core::traits::AgentProcessor;

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

/// OpenAI-compatible chat completions processor. Works with OpenAI, Ollama,
/// vLLM, Groq, OpenRouter, etc.
pub struct OpenAiProcessor {
    http: Client,
    config: ProcessorConfig,
}

impl OpenAiProcessor {
    pub fn new(config: ProcessorConfig) -> Self {
        Self {
            http: Client::new(),
            config,
        }
    }

    fn build_request(&self, system_prompt: &str, user_prompt: &str) -> ChatRequest {
        let mut messages = Vec::with_capacity(2);
        if !system_prompt.is_empty() {
            messages.push(OaiMessage {
                role: "system".to_string(),
                content: system_prompt.to_string(),
            });
        }
        messages.push(OaiMessage {
            role: "user".to_string(),
            content: user_prompt.to_string(),
        });

        ChatRequest {
            model: self.config.model_id.clone(),
            messages,
            max_tokens: self.config.max_tokens,
            temperature: if self.config.temperature > 0.0 {
                Some(self.config.temperature)
            } else {
                None
            },
            stream: false,
        }
    }
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<OaiMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
}

#[derive(Serialize)]
struct OaiMessage {
    role: String,
    content: String,
}

#[derive(Deserialize, Debug)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize, Debug)]
struct Choice {
    message: ChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Pull the first choice's text out of a completion body.
fn extract_text(response: ChatResponse) -> Result<String> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| RefineryError::ProcessorRequest("response has no choices".into()))?;

    if choice.finish_reason.as_deref() == Some("length") {
        warn!("Completion truncated at max_tokens");
    }

    match choice.message.content {
        Some(text) if !text.trim().is_empty() => Ok(text),
        _ => Err(RefineryError::ProcessorRequest(
            "response has empty content".into(),
        )),
    }
}

impl AgentProcessor for OpenAiProcessor {
    fn name(&self) -> &str {
        &self.config.provider
    }

    fn process(&self, system_prompt: &str, user_prompt: &str) -> BoxFuture<'_, Result<String>> {
        let body = self.build_request(system_prompt, user_prompt);

        Box::pin(async move {
            let url = self.config.base_url.as_deref().unwrap_or(OPENAI_API_URL);

            let mut req = self.http.post(url).json(&body);
            if let Some(api_key) = &self.config.api_key {
                req = req.header("Authorization", format!("Bearer {}", api_key));
            }

            let response = req
                .send()
                .await
                .map_err(|e| RefineryError::ProcessorRequest(e.to_string()))?;

            if !response.status().is_success() {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                return Err(RefineryError::ProcessorRequest(format!(
                    "HTTP {}: {}",
                    status, text
                )));
            }

            let parsed: ChatResponse = response
                .json()
                .await
                .map_err(|e| RefineryError::ProcessorRequest(e.to_string()))?;

            let text = extract_text(parsed)?;
            debug!(model = %self.config.model_id, chars = text.len(), "Completion received");
            Ok(text)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_body() {
        let processor = OpenAiProcessor::new(ProcessorConfig::default());
        let body = serde_json::to_value(processor.build_request("Be concise.", "Fix this")).unwrap();
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["stream"], false);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "Fix this");
    }

    #[test]
    fn test_request_omits_empty_system_and_zero_temperature() {
        let config = ProcessorConfig {
            temperature: 0.0,
            ..Default::default()
        };
        let processor = OpenAiProcessor::new(config);
        let body = serde_json::to_value(processor.build_request("", "doc")).unwrap();
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert!(body.get("temperature").is_none());
    }

    #[test]
    fn test_extract_text() {
        let response: ChatResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"role":"assistant","content":"Improved."},"finish_reason":"stop"}]}"#,
        )
        .unwrap();
        assert_eq!(extract_text(response).unwrap(), "Improved.");
    }

    #[test]
    fn test_extract_text_errors() {
        let empty: ChatResponse = serde_json::from_str(r#"{"choices":[]}"#).unwrap();
        assert!(extract_text(empty).is_err());

        let blank: ChatResponse =
            serde_json::from_str(r#"{"choices":[{"message":{"content":"  "}}]}"#).unwrap();
        assert!(matches!(
            extract_text(blank),
            Err(RefineryError::ProcessorRequest(_))
        ));
    }
}
