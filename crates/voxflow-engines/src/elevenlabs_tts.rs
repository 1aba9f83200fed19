//! ElevenLabs streaming text-to-speech adapter.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use voxflow_core::config::EngineSettings;

use crate::{
    Capability, EngineDescriptor, EngineError, EngineKind, Result, TtsEngine, TtsEvent, TtsStream,
};

const DEFAULT_BASE_URL: &str = "https://api.elevenlabs.io/v1";
const DEFAULT_MODEL: &str = "eleven_turbo_v2";
const DEFAULT_VOICE: &str = "Rachel";
const RECOGNIZED_OPTIONS: &[&str] = &["voice", "output_format"];

pub struct ElevenLabsTts {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    voice: String,
    output_format: String,
}

impl ElevenLabsTts {
    pub fn from_settings(settings: &EngineSettings) -> Result<Self> {
        let api_key = settings
            .resolve_api_key()
            .ok_or_else(|| EngineError::ConfigInvalid("TTS provider requires an API key".into()))?;
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
            voice: settings
                .option_str("voice")
                .unwrap_or(DEFAULT_VOICE)
                .to_string(),
            output_format: settings
                .option_str("output_format")
                .unwrap_or("pcm_16000")
                .to_string(),
        })
    }

    fn stream_url(&self) -> String {
        format!("{}/text-to-speech/{}/stream", self.base_url, self.voice)
    }

    async fn request(&self, text: &str) -> Result<reqwest::Response> {
        debug!(
            voice = %self.voice,
            model = %self.model,
            text_len = text.len(),
            "Starting TTS stream"
        );

        let resp = self
            .client
            .post(self.stream_url())
            .header("xi-api-key", &self.api_key)
            .json(&json!({
                "text": text,
                "model_id": self.model,
                "output_format": self.output_format,
            }))
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
                "TTS API error {status}: {body}"
            )));
        }
        Ok(resp)
    }
}

#[async_trait]
impl TtsEngine for ElevenLabsTts {
    fn descriptor(&self) -> EngineDescriptor {
        EngineDescriptor {
            kind: EngineKind::Tts,
            provider: "elevenlabs".into(),
            model: self.model.clone(),
            capabilities: vec![Capability::Batch, Capability::Stream],
        }
    }

    async fn initialize(&self) -> Result<()> {
        let url = format!("{}/voices", self.base_url);
        let resp = self
            .client
            .get(&url)
            .header("xi-api-key", &self.api_key)
            .send()
            .await
            .map_err(|e| EngineError::Unreachable(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(EngineError::Unreachable(format!(
                "TTS API returned {}",
                resp.status()
            )));
        }
        Ok(())
    }

    async fn synthesize_stream(&self, text: &str, cancel: CancellationToken) -> Result<TtsStream> {
        let resp = self.request(text).await?;

        let (tx, rx) = mpsc::channel::<Result<TtsEvent>>(32);
        tokio::spawn(async move {
            let mut body = resp.bytes_stream();
            loop {
                let chunk = tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("TTS stream cancelled");
                        return;
                    }
                    chunk = body.next() => chunk,
                };

                match chunk {
                    Some(Ok(bytes)) => {
                        if !bytes.is_empty()
                            && tx.send(Ok(TtsEvent::Audio(bytes.to_vec()))).await.is_err()
                        {
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        let _ = tx
                            .send(Err(EngineError::Failed(format!("TTS stream error: {e}"))))
                            .await;
                        return;
                    }
                    None => {
                        let _ = tx.send(Ok(TtsEvent::Complete)).await;
                        return;
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        let resp = self.request(text).await?;
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| EngineError::Failed(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requires_api_key() {
        let settings = EngineSettings {
            provider: "elevenlabs".into(),
            ..EngineSettings::default()
        };
        assert!(matches!(
            ElevenLabsTts::from_settings(&settings),
            Err(EngineError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn stream_url_contains_voice() {
        let mut settings = EngineSettings {
            provider: "elevenlabs".into(),
            api_key: Some("xi-test".into()),
            ..EngineSettings::default()
        };
        settings
            .options
            .insert("voice".into(), serde_json::json!("Bella"));
        let engine = ElevenLabsTts::from_settings(&settings).unwrap();
        let url = engine.stream_url();
        assert!(url.contains("Bella"));
        assert!(url.ends_with("/stream"));
        assert!(url.starts_with("https://api.elevenlabs.io"));
    }
}
