//! OpenAI chat-completions adapter with SSE streaming.

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use voxflow_core::config::EngineSettings;
use voxflow_core::dialogue::{Role, Turn};

use crate::sse;
use crate::{
    Capability, EngineDescriptor, EngineError, EngineKind, LlmEngine, LlmEvent, LlmStream, Result,
};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";
const RECOGNIZED_OPTIONS: &[&str] = &["temperature", "max_tokens", "context_turns"];

pub struct OpenAiLlm {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    temperature: Option<f64>,
    max_tokens: u64,
    /// Advisory view limit: at most this many trailing non-system turns are
    /// sent. The conversation itself is never mutated.
    context_turns: Option<usize>,
}

impl OpenAiLlm {
    pub fn from_settings(settings: &EngineSettings) -> Result<Self> {
        let api_key = settings
            .resolve_api_key()
            .ok_or_else(|| EngineError::ConfigInvalid("LLM provider requires an API key".into()))?;
        settings.warn_unknown_options(RECOGNIZED_OPTIONS);

        let client = reqwest::Client::builder()
            .connect_timeout(settings.timeout())
            .build()
            .map_err(|e| EngineError::ConfigInvalid(e.to_string()))?;

        Ok(Self {
            client,
            api_key,
            base_url: settings
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.into()),
            model: settings
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_MODEL.into()),
            temperature: settings.options.get("temperature").and_then(|v| v.as_f64()),
            max_tokens: settings.option_u64("max_tokens").unwrap_or(1024),
            context_turns: settings.option_u64("context_turns").map(|n| n as usize),
        })
    }

    fn messages(&self, history: &[Turn]) -> Vec<serde_json::Value> {
        let view = trimmed_view(history, self.context_turns);
        view.iter()
            .map(|turn| {
                let role = match turn.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                };
                json!({"role": role, "content": turn.content})
            })
            .collect()
    }

    fn request_body(&self, history: &[Turn], stream: bool) -> serde_json::Value {
        let mut body = json!({
            "model": self.model,
            "messages": self.messages(history),
            "max_tokens": self.max_tokens,
            "stream": stream,
        });
        if let Some(t) = self.temperature {
            body["temperature"] = json!(t);
        }
        body
    }

    async fn post_chat(&self, body: serde_json::Value) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.base_url);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
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
                "chat API error {status}: {body}"
            )));
        }
        Ok(resp)
    }
}

/// Trailing-window view of the history: the leading system turn plus the
/// last `limit` other turns.
fn trimmed_view(history: &[Turn], limit: Option<usize>) -> Vec<Turn> {
    let Some(limit) = limit else {
        return history.to_vec();
    };
    let mut view = Vec::new();
    let mut rest: Vec<&Turn> = Vec::new();
    for (i, turn) in history.iter().enumerate() {
        if i == 0 && turn.role == Role::System {
            view.push(turn.clone());
        } else {
            rest.push(turn);
        }
    }
    let skip = rest.len().saturating_sub(limit);
    view.extend(rest.into_iter().skip(skip).cloned());
    view
}

#[derive(Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct BatchResponse {
    choices: Vec<BatchChoice>,
}

#[derive(Deserialize)]
struct BatchChoice {
    message: BatchMessage,
}

#[derive(Deserialize)]
struct BatchMessage {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl LlmEngine for OpenAiLlm {
    fn descriptor(&self) -> EngineDescriptor {
        EngineDescriptor {
            kind: EngineKind::Llm,
            provider: "openai".into(),
            model: self.model.clone(),
            capabilities: vec![Capability::Batch, Capability::Stream, Capability::FunctionCall],
        }
    }

    async fn initialize(&self) -> Result<()> {
        let url = format!("{}/models", self.base_url);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| EngineError::Unreachable(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(EngineError::Unreachable(format!(
                "chat API returned {}",
                resp.status()
            )));
        }
        Ok(())
    }

    async fn chat_stream(&self, history: &[Turn], cancel: CancellationToken) -> Result<LlmStream> {
        let resp = self.post_chat(self.request_body(history, true)).await?;
        debug!(model = %self.model, turns = history.len(), "LLM stream opened");

        let (tx, rx) = mpsc::channel::<Result<LlmEvent>>(32);
        tokio::spawn(async move {
            let mut events = std::pin::pin!(sse::event_stream(resp));
            let mut content = String::new();

            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("LLM stream cancelled");
                        return; // dropping the response closes the connection
                    }
                    next = events.next() => next,
                };

                match next {
                    Some(Ok(event)) => {
                        if event.data == "[DONE]" {
                            let _ = tx.send(Ok(LlmEvent::Complete { content })).await;
                            return;
                        }
                        match serde_json::from_str::<StreamChunk>(&event.data) {
                            Ok(chunk) => {
                                if let Some(delta) =
                                    chunk.choices.first().and_then(|c| c.delta.content.clone())
                                {
                                    if !delta.is_empty() {
                                        content.push_str(&delta);
                                        if tx.send(Ok(LlmEvent::Delta(delta))).await.is_err() {
                                            return;
                                        }
                                    }
                                }
                            }
                            Err(e) => {
                                warn!(%e, "Skipping unparseable stream chunk");
                            }
                        }
                    }
                    Some(Err(e)) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                    None => {
                        // Body ended without [DONE]; still terminate the
                        // stream with what we have.
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
        let parsed: BatchResponse = resp
            .json()
            .await
            .map_err(|e| EngineError::Failed(e.to_string()))?;
        Ok(parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> OpenAiLlm {
        let settings = EngineSettings {
            provider: "openai".into(),
            api_key: Some("sk-test".into()),
            ..EngineSettings::default()
        };
        OpenAiLlm::from_settings(&settings).unwrap()
    }

    #[test]
    fn requires_api_key() {
        let settings = EngineSettings {
            provider: "openai".into(),
            ..EngineSettings::default()
        };
        assert!(matches!(
            OpenAiLlm::from_settings(&settings),
            Err(EngineError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn message_mapping() {
        let history = vec![
            Turn::system("be brief"),
            Turn::user("hi"),
            Turn::assistant("hello"),
        ];
        let messages = engine().messages(&history);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["role"], "user");
        assert_eq!(messages[2]["role"], "assistant");
        assert_eq!(messages[2]["content"], "hello");
    }

    #[test]
    fn trimmed_view_keeps_system_and_tail() {
        let history = vec![
            Turn::system("sys"),
            Turn::user("1"),
            Turn::assistant("2"),
            Turn::user("3"),
        ];
        let view = trimmed_view(&history, Some(2));
        assert_eq!(view.len(), 3);
        assert_eq!(view[0].role, Role::System);
        assert_eq!(view[1].content, "2");
        assert_eq!(view[2].content, "3");

        // Source history untouched by construction: the view is a copy.
        assert_eq!(history.len(), 4);
    }

    #[test]
    fn request_body_shape() {
        let body = engine().request_body(&[Turn::user("hi")], true);
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["stream"], true);
        assert_eq!(body["max_tokens"], 1024);
        assert!(body["messages"].is_array());
    }

    #[test]
    fn stream_chunk_parsing() {
        let chunk: StreamChunk = serde_json::from_str(
            r#"{"choices":[{"delta":{"content":"hel"},"index":0}],"id":"x","object":"chat.completion.chunk"}"#,
        )
        .unwrap();
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("hel"));
    }
}
