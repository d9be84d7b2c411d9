//! Multimodal language model client for the analytics stage
//!
//! Speaks the OpenAI-compatible chat-completions shape (which local Ollama
//! endpoints also accept), sending the prompt plus the combined group image
//! as a base64 data URL. Transient failures retry with backoff; the caller
//! treats any residual error as non-fatal.

use crate::error::{PipelineError, Result};
use serde::Deserialize;
use std::time::Duration;

const DEFAULT_API_URL: &str = "http://localhost:11434/v1/chat/completions";
const DEFAULT_MODEL: &str = "gemma3:27b";
const MAX_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct VisionModelConfig {
    pub api_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl Default for VisionModelConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            max_tokens: 500,
            timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

pub struct VisionModelClient {
    agent: ureq::Agent,
    config: VisionModelConfig,
}

impl VisionModelClient {
    pub fn new(config: VisionModelConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(10))
            .timeout(config.timeout)
            .build();
        Self { agent, config }
    }

    /// Ask the model about one combined image. `jpeg_b64` is the image's
    /// base64 JPEG bytes as carried in the unified envelope.
    pub fn describe(&self, system_prompt: &str, prompt: &str, jpeg_b64: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.config.model,
            "temperature": 0,
            "max_tokens": self.config.max_tokens,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": [
                    {"type": "text", "text": prompt},
                    {"type": "image_url", "image_url": {
                        "url": format!("data:image/jpeg;base64,{jpeg_b64}")
                    }}
                ]}
            ]
        });

        let mut last_error = None;
        for attempt in 1..=MAX_ATTEMPTS {
            let mut request = self
                .agent
                .post(&self.config.api_url)
                .set("content-type", "application/json");
            if let Some(key) = &self.config.api_key {
                request = request.set("authorization", &format!("Bearer {key}"));
            }

            match request.send_json(body.clone()) {
                Ok(response) => {
                    let parsed: ChatResponse = response
                        .into_json()
                        .map_err(|e| PipelineError::llm(format!("malformed response: {e}")))?;
                    let content = parsed
                        .choices
                        .into_iter()
                        .next()
                        .map(|c| c.message.content.trim().to_string())
                        .ok_or_else(|| PipelineError::llm("response carried no choices"))?;
                    return Ok(content);
                }
                Err(ureq::Error::Status(code, response)) => {
                    let detail = response.into_string().unwrap_or_default();
                    log::warn!(
                        "language model returned {code} (attempt {attempt}/{MAX_ATTEMPTS}): {detail}"
                    );
                    last_error = Some(PipelineError::llm(format!("status {code}: {detail}")));
                    // Client errors other than rate limiting will not heal
                    if code != 429 && code < 500 {
                        break;
                    }
                }
                Err(ureq::Error::Transport(err)) => {
                    log::warn!(
                        "language model transport error (attempt {attempt}/{MAX_ATTEMPTS}): {err}"
                    );
                    last_error = Some(PipelineError::llm(err.to_string()));
                }
            }

            if attempt < MAX_ATTEMPTS {
                std::thread::sleep(RETRY_BACKOFF * attempt);
            }
        }

        Err(last_error.unwrap_or_else(|| PipelineError::llm("request failed")))
    }
}
