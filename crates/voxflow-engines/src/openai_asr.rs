//! Whisper-compatible speech-to-text adapter (OpenAI audio transcriptions
//! API). Batch-oriented: the streaming call resolves to a single final
//! transcript.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use voxflow_core::config::EngineSettings;
use voxflow_core::protocol::AudioFormat;

use crate::{
    AsrEngine, AsrEvent, AsrStream, Capability, EngineDescriptor, EngineError, EngineKind, Result,
    Transcript, Utterance,
};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "whisper-1";
const RECOGNIZED_OPTIONS: &[&str] = &["language", "sample_rate"];

pub struct OpenAiAsr {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    language: Option<String>,
    sample_rate: u32,
}

impl OpenAiAsr {
    pub fn from_settings(settings: &EngineSettings) -> Result<Self> {
        let api_key = settings
            .resolve_api_key()
            .ok_or_else(|| EngineError::ConfigInvalid("ASR provider requires an API key".into()))?;
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
            language: settings.option_str("language").map(str::to_string),
            sample_rate: settings.option_u64("sample_rate").unwrap_or(16_000) as u32,
        })
    }

    /// Wrap the utterance in a container the transcription API accepts.
    fn to_upload(&self, utterance: &Utterance) -> (Vec<u8>, &'static str, &'static str) {
        match utterance.format {
            AudioFormat::Pcm16khz16bit => (
                pcm_to_wav(&utterance.audio, self.sample_rate, 1, 16),
                "audio.wav",
                "audio/wav",
            ),
            AudioFormat::Wav => (utterance.audio.clone(), "audio.wav", "audio/wav"),
            AudioFormat::Mp3 => (utterance.audio.clone(), "audio.mp3", "audio/mpeg"),
            AudioFormat::Opus => (utterance.audio.clone(), "audio.ogg", "audio/ogg"),
        }
    }
}

#[async_trait]
impl AsrEngine for OpenAiAsr {
    fn descriptor(&self) -> EngineDescriptor {
        EngineDescriptor {
            kind: EngineKind::Asr,
            provider: "openai".into(),
            model: self.model.clone(),
            capabilities: vec![Capability::Batch],
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
                "transcription API returned {}",
                resp.status()
            )));
        }
        Ok(())
    }

    async fn transcribe_stream(
        &self,
        utterance: Utterance,
        cancel: CancellationToken,
    ) -> Result<AsrStream> {
        // Batch backend: the stream is the single final transcript.
        let transcript = tokio::select! {
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            result = self.transcribe(utterance) => result?,
        };
        Ok(Box::pin(futures::stream::iter([Ok(AsrEvent::Final {
            text: transcript.text,
            confidence: transcript.confidence,
        })])))
    }

    async fn transcribe(&self, utterance: Utterance) -> Result<Transcript> {
        let (body, file_name, mime) = self.to_upload(&utterance);
        let url = format!("{}/audio/transcriptions", self.base_url);

        debug!(
            url,
            model = %self.model,
            upload_bytes = body.len(),
            "Sending audio for transcription"
        );

        let part = reqwest::multipart::Part::bytes(body)
            .file_name(file_name)
            .mime_str(mime)
            .map_err(|e| EngineError::Failed(e.to_string()))?;

        let mut form = reqwest::multipart::Form::new()
            .text("model", self.model.clone())
            .text("response_format", "text")
            .part("file", part);
        if let Some(lang) = &self.language {
            form = form.text("language", lang.clone());
        }

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .multipart(form)
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
                "transcription API error {status}: {body}"
            )));
        }

        let text = resp
            .text()
            .await
            .map_err(|e| EngineError::Failed(e.to_string()))?;
        Ok(Transcript {
            text: text.trim().to_string(),
            confidence: 1.0,
        })
    }
}

/// Wrap raw 16-bit PCM in a WAV container.
pub fn pcm_to_wav(pcm: &[u8], sample_rate: u32, channels: u16, bits_per_sample: u16) -> Vec<u8> {
    let data_len = pcm.len() as u32;
    let byte_rate = sample_rate * channels as u32 * bits_per_sample as u32 / 8;
    let block_align = channels * bits_per_sample / 8;

    let mut wav = Vec::with_capacity(44 + pcm.len());

    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data_len).to_le_bytes());
    wav.extend_from_slice(b"WAVE");

    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes()); // PCM format
    wav.extend_from_slice(&channels.to_le_bytes());
    wav.extend_from_slice(&sample_rate.to_le_bytes());
    wav.extend_from_slice(&byte_rate.to_le_bytes());
    wav.extend_from_slice(&block_align.to_le_bytes());
    wav.extend_from_slice(&bits_per_sample.to_le_bytes());

    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_len.to_le_bytes());
    wav.extend_from_slice(pcm);

    wav
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wav_header() {
        let pcm = vec![0u8; 32000]; // 1 second of 16kHz 16-bit mono
        let wav = pcm_to_wav(&pcm, 16000, 1, 16);

        assert_eq!(wav.len(), 44 + 32000);
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(&wav[12..16], b"fmt ");
        assert_eq!(&wav[36..40], b"data");

        let sr = u32::from_le_bytes([wav[24], wav[25], wav[26], wav[27]]);
        assert_eq!(sr, 16000);
    }

    #[test]
    fn requires_api_key() {
        let settings = EngineSettings {
            provider: "openai".into(),
            ..EngineSettings::default()
        };
        assert!(matches!(
            OpenAiAsr::from_settings(&settings),
            Err(EngineError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn descriptor_is_batch_only() {
        let settings = EngineSettings {
            provider: "openai".into(),
            api_key: Some("sk-test".into()),
            ..EngineSettings::default()
        };
        let engine = OpenAiAsr::from_settings(&settings).unwrap();
        let desc = engine.descriptor();
        assert_eq!(desc.provider, "openai");
        assert_eq!(desc.model, "whisper-1");
        assert!(desc.supports(Capability::Batch));
        assert!(!desc.supports(Capability::Stream));
    }
}
