//! Ollama chat adapter — newline-delimited JSON streaming over `/api/chat`.

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use voxflow_core::config::EngineSettings;
use voxflow_core::dialogue::{Role, Turn};

use crate::{
    Capability, EngineDescriptor, EngineError, EngineKind, LlmEngine, LlmEvent, LlmStream, Result,
};

const DEFAULT_BASE_URL: &str = "http://localhost:11434";
const DEFAULT_MODEL: &str = "llama3.1";
const RECOGNIZED_OPTIONS: &[&str] = &["temperature", "num_ctx"];

pub struct OllamaLlm {
    client: reqwest::Client,
    base_url: String,
    model: String,
    temperature: Option<f64>,
    num_ctx: Option<u64>,
}

impl OllamaLlm {
    pub fn from_settings(settings: &EngineSettings) -> Result<Self> {
        settings.warn_unknown_options(RECOGNIZED_OPTIONS);

        let client = reqwest::Client::builder()
            .connect_timeout(settings.timeout())
            .build()
            .map_err(|e| EngineError::ConfigInvalid(e.to_string()))?;

        Ok(Self {
            client,
            base_url: settings
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.into()),
            model: settings
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_MODEL.into()),
            temperature: settings.options.get("temperature").and_then(|v| v.as_f64()),
            num_ctx: settings.option_u64("num_ctx"),
        })
    }

    fn request_body(&self, history: &[Turn], stream: bool) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = history
            .iter()
            .map(|turn| {
                let role = match turn.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                };
                json!({"role": role, "content": turn.content})
            })
            .collect();

        let mut options = serde_json::Map::new();
        if let Some(t) = self.temperature {
            options.insert("temperature".into(), json!(t));
        }
        if let Some(n) = self.num_ctx {
            options.insert("num_ctx".into(), json!(n));
        }

        json!({
            "model": self.model,
            "messages": messages,
            "stream": stream,
            "options": options,
        })
    }

    async fn post_chat(&self, body: serde_json::Value) -> Result<reqwest::Response> {
        let url = format!("{}/api/chat", self.base_url);
        let resp = self.client.post(&url).json(&body).send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                EngineError::Unreachable(e.to_string())
            } else {
                EngineError::Failed(e.to_string())
            }
        })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(EngineError::Failed(format!(
                "ollama API error {status}: {body}"
            )));
        }
        Ok(resp)
    }
}

#[derive(Deserialize)]
struct ChatLine {
    #[serde(default)]
    message: Option<ChatMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: String,
}

#[async_trait]
impl LlmEngine for OllamaLlm {
    fn descriptor(&self) -> EngineDescriptor {
        EngineDescriptor {
            kind: EngineKind::Llm,
            provider: "ollama".into(),
            model: self.model.clone(),
            capabilities: vec![Capability::Batch, Capability::Stream],
        }
    }

    async fn initialize(&self) -> Result<()> {
        let url = format!("{}/api/tags", self.base_url);
        self.client
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::Unreachable(e.to_string()))?
            .error_for_status()
            .map_err(|e| EngineError::Unreachable(e.to_string()))?;
        Ok(())
    }

    async fn chat_stream(&self, history: &[Turn], cancel: CancellationToken) -> Result<LlmStream> {
        let resp = self.post_chat(self.request_body(history, true)).await?;
        debug!(model = %self.model, turns = history.len(), "Ollama stream opened");

        let (tx, rx) = mpsc::channel::<Result<LlmEvent>>(32);
        tokio::spawn(async move {
            let mut body = resp.bytes_stream();
            let mut buffer = String::new();
            let mut content = String::new();

            loop {
                let chunk = tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Ollama stream cancelled");
                        return;
                    }
                    chunk = body.next() => chunk,
                };

                match chunk {
                    Some(Ok(bytes)) => {
                        buffer.push_str(&String::from_utf8_lossy(&bytes));
                        while let Some(pos) = buffer.find('\n') {
                            let line = buffer[..pos].trim().to_string();
                            buffer.drain(..=pos);
                            if line.is_empty() {
                                continue;
                            }
                            let Ok(parsed) = serde_json::from_str::<ChatLine>(&line) else {
                                continue;
                            };
                            if let Some(error) = parsed.error {
                                let _ = tx.send(Err(EngineError::Failed(error))).await;
                                return;
                            }
                            if let Some(message) = parsed.message {
                                if !message.content.is_empty() {
                                    content.push_str(&message.content);
                                    if tx
                                        .send(Ok(LlmEvent::Delta(message.content)))
                                        .await
                                        .is_err()
                                    {
                                        return;
                                    }
                                }
                            }
                            if parsed.done {
                                let _ = tx.send(Ok(LlmEvent::Complete { content })).await;
                                return;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        let _ = tx
                            .send(Err(EngineError::Failed(format!("stream error: {e}"))))
                            .await;
                        return;
                    }
                    None => {
                        let _ = tx.send(Ok(LlmEvent::Complete { content })).await;
                        return;
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn chat(&self, history: &[Turn]) -> Result<String> {
        let resp = self.post_chat(self.request_body(history, false)).await?;
        let parsed: ChatLine = resp
            .json()
            .await
            .map_err(|e| EngineError::Failed(e.to_string()))?;
        if let Some(error) = parsed.error {
            return Err(EngineError::Failed(error));
        }
        Ok(parsed.message.map(|m| m.content).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_api_key_needed() {
        let settings = EngineSettings {
            provider: "ollama".into(),
            ..EngineSettings::default()
        };
        let engine = OllamaLlm::from_settings(&settings).unwrap();
        assert_eq!(engine.base_url, DEFAULT_BASE_URL);
        assert_eq!(engine.model, DEFAULT_MODEL);
    }

    #[test]
    fn request_body_includes_options() {
        let mut settings = EngineSettings {
            provider: "ollama".into(),
            model: Some("qwen2.5".into()),
            ..EngineSettings::default()
        };
        settings
            .options
            .insert("temperature".into(), serde_json::json!(0.2));
        let engine = OllamaLlm::from_settings(&settings).unwrap();

        let body = engine.request_body(&[Turn::user("hi")], true);
        assert_eq!(body["model"], "qwen2.5");
        assert_eq!(body["options"]["temperature"], 0.2);
        assert_eq!(body["stream"], true);
    }

    #[test]
    fn chat_line_parsing() {
        let line: ChatLine = serde_json::from_str(
            r#"{"model":"llama3.1","message":{"role":"assistant","content":"hi"},"done":false}"#,
        )
        .unwrap();
        assert_eq!(line.message.unwrap().content, "hi");
        assert!(!line.done);

        let done: ChatLine =
            serde_json::from_str(r#"{"model":"llama3.1","done":true}"#).unwrap();
        assert!(done.done);
    }
}
