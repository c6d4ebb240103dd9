//! Groq chat-completions client
//!
//! Talks to any OpenAI-compatible `/chat/completions` endpoint.
//! Uses a long-lived reqwest::Client for connection pooling.

use crate::error::OrchestrationError;
use crate::generation::{GenerationOptions, GenerationService, Prompt, TokenStream};
use crate::Result;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{error, info};

/// Reusable Groq client (connection-pooled)
pub struct GroqClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl GroqClient {
    pub fn new(api_key: String, base_url: String, model: String) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
        })
    }

    fn request_body(&self, prompt: &Prompt, options: &GenerationOptions, stream: bool) -> ChatRequest {
        ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: prompt.system.clone(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: prompt.user.clone(),
                },
            ],
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            stream,
        }
    }

    async fn send(&self, body: &ChatRequest) -> Result<reqwest::Response> {
        if self.api_key.is_empty() {
            return Err(OrchestrationError::GenerationUnavailable(
                "GROQ_API_KEY not configured".to_string(),
            ));
        }

        let url = format!("{}/chat/completions", self.base_url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                error!("Groq API request failed: {}", e);
                OrchestrationError::GenerationUnavailable(format!("Groq API error: {}", e))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            error!("Groq API error response ({}): {}", status, error_text);
            return Err(OrchestrationError::GenerationUnavailable(format!(
                "Groq API returned {}: {}",
                status, error_text
            )));
        }

        Ok(response)
    }
}

#[async_trait]
impl GenerationService for GroqClient {
    fn name(&self) -> &'static str {
        "groq"
    }

    async fn generate(&self, prompt: &Prompt, options: &GenerationOptions) -> Result<String> {
        let body = self.request_body(prompt, options, false);

        info!(model = %self.model, "Calling Groq API");
        let response = self.send(&body).await?;

        let parsed: ChatResponse = response.json().await.map_err(|e| {
            error!("Failed to parse Groq response: {}", e);
            OrchestrationError::GenerationUnavailable(format!("Groq parse error: {}", e))
        })?;

        let answer = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| {
                OrchestrationError::GenerationUnavailable("Empty response from Groq".to_string())
            })?;

        Ok(answer.trim().to_string())
    }

    async fn stream(&self, prompt: &Prompt, options: &GenerationOptions) -> Result<TokenStream> {
        let body = self.request_body(prompt, options, true);

        info!(model = %self.model, "Opening Groq stream");
        let response = self.send(&body).await?;

        let bytes = Box::pin(response.bytes_stream());
        let state = (bytes, SseDecoder::default(), VecDeque::<String>::new());

        let stream = futures::stream::unfold(state, |(mut bytes, mut decoder, mut pending)| async move {
            loop {
                if let Some(fragment) = pending.pop_front() {
                    return Some((Ok(fragment), (bytes, decoder, pending)));
                }
                if decoder.done {
                    return None;
                }
                match bytes.next().await {
                    Some(Ok(chunk)) => match decoder.push(&chunk) {
                        Ok(fragments) => pending.extend(fragments),
                        Err(e) => {
                            decoder.done = true;
                            return Some((Err(e), (bytes, decoder, pending)));
                        }
                    },
                    Some(Err(e)) => {
                        decoder.done = true;
                        let err = OrchestrationError::GenerationUnavailable(format!(
                            "Groq stream interrupted: {}",
                            e
                        ));
                        return Some((Err(err), (bytes, decoder, pending)));
                    }
                    None => {
                        let tail = decoder.finish();
                        decoder.done = true;
                        match tail {
                            Ok(fragments) => pending.extend(fragments),
                            Err(e) => return Some((Err(e), (bytes, decoder, pending))),
                        }
                    }
                }
            }
        });

        Ok(Box::pin(stream))
    }
}

/// Incremental decoder for `data: {...}` server-sent event lines.
#[derive(Debug, Default)]
struct SseDecoder {
    buffer: Vec<u8>,
    done: bool,
}

impl SseDecoder {
    /// Feed raw bytes; returns the content fragments of every complete line.
    fn push(&mut self, bytes: &[u8]) -> Result<Vec<String>> {
        self.buffer.extend_from_slice(bytes);
        let mut fragments = Vec::new();

        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line);
            if let Some(fragment) = self.decode_line(line.trim_end())? {
                fragments.push(fragment);
            }
            if self.done {
                break;
            }
        }

        Ok(fragments)
    }

    /// Decode whatever is left once the byte stream ends.
    fn finish(&mut self) -> Result<Vec<String>> {
        if self.buffer.is_empty() || self.done {
            return Ok(Vec::new());
        }
        let rest = std::mem::take(&mut self.buffer);
        let line = String::from_utf8_lossy(&rest);
        Ok(self.decode_line(line.trim_end())?.into_iter().collect())
    }

    fn decode_line(&mut self, line: &str) -> Result<Option<String>> {
        let Some(payload) = line.strip_prefix("data:") else {
            return Ok(None);
        };
        let payload = payload.trim();

        if payload == "[DONE]" {
            self.done = true;
            return Ok(None);
        }
        if payload.is_empty() {
            return Ok(None);
        }

        let chunk: StreamChunk = serde_json::from_str(payload).map_err(|e| {
            OrchestrationError::GenerationUnavailable(format!("Malformed stream chunk: {}", e))
        })?;

        let content: String = chunk
            .choices
            .into_iter()
            .filter_map(|c| c.delta.content)
            .collect();

        Ok((!content.is_empty()).then_some(content))
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Delta,
}

#[derive(Debug, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization() {
        let client = GroqClient::new(
            "key".to_string(),
            "https://api.groq.com/openai/v1/".to_string(),
            "openai/gpt-oss-20b".to_string(),
        )
        .unwrap();
        let prompt = Prompt::new("system text", "What is the onboarding checklist?");
        let body = client.request_body(&prompt, &GenerationOptions::default(), true);

        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["stream"], true);
        assert_eq!(json["messages"][1]["content"], "What is the onboarding checklist?");
        assert_eq!(client.base_url, "https://api.groq.com/openai/v1");
    }

    #[test]
    fn test_sse_decoder_handles_split_lines() {
        let mut decoder = SseDecoder::default();

        let first = decoder
            .push(b"data: {\"choices\":[{\"delta\":{\"content\":\"Hel")
            .unwrap();
        assert!(first.is_empty());

        let second = decoder
            .push(b"lo\"}}]}\n\ndata: {\"choices\":[{\"delta\":{}}]}\n")
            .unwrap();
        assert_eq!(second, vec!["Hello".to_string()]);

        let third = decoder.push(b": keep-alive\ndata: [DONE]\n").unwrap();
        assert!(third.is_empty());
        assert!(decoder.done);
    }

    #[test]
    fn test_sse_decoder_rejects_garbage_payload() {
        let mut decoder = SseDecoder::default();
        let result = decoder.push(b"data: {not json}\n");
        assert!(matches!(
            result,
            Err(OrchestrationError::GenerationUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_api_key() {
        let client = GroqClient::new(
            String::new(),
            "http://127.0.0.1:9".to_string(),
            "m".to_string(),
        )
        .unwrap();
        let result = client
            .generate(&Prompt::new("s", "u"), &GenerationOptions::default())
            .await;
        let error_msg = result.unwrap_err().to_string();
        assert!(error_msg.contains("GROQ_API_KEY"));
    }
}
