//! Deterministic mock engines.
//!
//! Scripted through the provider options block, these let the gateway run
//! end-to-end without credentials and give the integration tests exact
//! control over stage behavior (partials, deltas, mid-stream failures,
//! paced audio chunks).

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use voxflow_core::config::EngineSettings;
use voxflow_core::dialogue::{Role, Turn};

use crate::{
    AsrEngine, AsrEvent, AsrStream, Capability, EngineDescriptor, EngineError, EngineKind,
    LlmEngine, LlmEvent, LlmStream, Result, Transcript, TtsEngine, TtsEvent, TtsStream, Utterance,
};

const ASR_OPTIONS: &[&str] = &["transcript", "partials", "confidence", "delay_ms"];
const LLM_OPTIONS: &[&str] = &["reply", "delta_size", "fail_after_deltas", "delay_ms"];
const TTS_OPTIONS: &[&str] = &["audio_bytes", "chunks", "delay_ms"];

/// Scripted ASR. With no `transcript` option it "recognizes" the utterance
/// bytes as UTF-8 text, which makes ad-hoc testing trivial.
pub struct MockAsr {
    transcript: Option<String>,
    partials: usize,
    confidence: f64,
    delay: Duration,
}

impl MockAsr {
    pub fn from_settings(settings: &EngineSettings) -> Self {
        settings.warn_unknown_options(ASR_OPTIONS);
        Self {
            transcript: settings.option_str("transcript").map(str::to_string),
            partials: settings.option_u64("partials").unwrap_or(0) as usize,
            confidence: settings
                .options
                .get("confidence")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.95),
            delay: Duration::from_millis(settings.option_u64("delay_ms").unwrap_or(0)),
        }
    }

    fn recognize(&self, utterance: &Utterance) -> String {
        match &self.transcript {
            Some(text) => text.clone(),
            None => String::from_utf8_lossy(&utterance.audio)
                .trim_matches(char::from(0))
                .trim()
                .to_string(),
        }
    }
}

#[async_trait]
impl AsrEngine for MockAsr {
    fn descriptor(&self) -> EngineDescriptor {
        EngineDescriptor {
            kind: EngineKind::Asr,
            provider: "mock".into(),
            model: "mock-asr".into(),
            capabilities: vec![Capability::Batch, Capability::Stream],
        }
    }

    async fn transcribe_stream(
        &self,
        utterance: Utterance,
        cancel: CancellationToken,
    ) -> Result<AsrStream> {
        let text = self.recognize(&utterance);
        let confidence = self.confidence;
        let partials = self.partials;
        let delay = self.delay;

        let (tx, rx) = mpsc::channel::<Result<AsrEvent>>(8);
        tokio::spawn(async move {
            for i in 0..partials {
                if pace(delay, &cancel).await.is_err() {
                    return;
                }
                // Growing prefixes stand in for refinement passes.
                let cut = text
                    .char_indices()
                    .map(|(idx, _)| idx)
                    .nth((i + 1) * text.chars().count() / (partials + 1))
                    .unwrap_or(text.len());
                let event = AsrEvent::Partial {
                    text: text[..cut].to_string(),
                    confidence: confidence * 0.8,
                };
                if tx.send(Ok(event)).await.is_err() {
                    return;
                }
            }
            if pace(delay, &cancel).await.is_err() {
                return;
            }
            let _ = tx.send(Ok(AsrEvent::Final { text, confidence })).await;
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn transcribe(&self, utterance: Utterance) -> Result<Transcript> {
        Ok(Transcript {
            text: self.recognize(&utterance),
            confidence: self.confidence,
        })
    }
}

/// Scripted LLM. Streams the reply in fixed-size character deltas; can be
/// told to fail mid-stream after N deltas.
pub struct MockLlm {
    reply: Option<String>,
    delta_size: usize,
    fail_after_deltas: Option<usize>,
    delay: Duration,
}

impl MockLlm {
    pub fn from_settings(settings: &EngineSettings) -> Self {
        settings.warn_unknown_options(LLM_OPTIONS);
        Self {
            reply: settings.option_str("reply").map(str::to_string),
            delta_size: settings.option_u64("delta_size").unwrap_or(4).max(1) as usize,
            fail_after_deltas: settings.option_u64("fail_after_deltas").map(|n| n as usize),
            delay: Duration::from_millis(settings.option_u64("delay_ms").unwrap_or(0)),
        }
    }

    fn reply_for(&self, history: &[Turn]) -> String {
        match &self.reply {
            Some(text) => text.clone(),
            None => {
                let last_user = history
                    .iter()
                    .rev()
                    .find(|t| t.role == Role::User)
                    .map(|t| t.content.as_str())
                    .unwrap_or("");
                format!("You said: {last_user}")
            }
        }
    }
}

#[async_trait]
impl LlmEngine for MockLlm {
    fn descriptor(&self) -> EngineDescriptor {
        EngineDescriptor {
            kind: EngineKind::Llm,
            provider: "mock".into(),
            model: "mock-llm".into(),
            capabilities: vec![Capability::Batch, Capability::Stream],
        }
    }

    async fn chat_stream(&self, history: &[Turn], cancel: CancellationToken) -> Result<LlmStream> {
        let reply = self.reply_for(history);
        let deltas = split_chars(&reply, self.delta_size);
        let fail_after = self.fail_after_deltas;
        let delay = self.delay;

        let (tx, rx) = mpsc::channel::<Result<LlmEvent>>(8);
        tokio::spawn(async move {
            for (i, delta) in deltas.into_iter().enumerate() {
                if fail_after == Some(i) {
                    let _ = tx.send(Err(EngineError::Timeout)).await;
                    return;
                }
                if pace(delay, &cancel).await.is_err() {
                    return;
                }
                if tx.send(Ok(LlmEvent::Delta(delta))).await.is_err() {
                    return;
                }
            }
            if pace(delay, &cancel).await.is_err() {
                return;
            }
            let _ = tx.send(Ok(LlmEvent::Complete { content: reply })).await;
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn chat(&self, history: &[Turn]) -> Result<String> {
        if self.fail_after_deltas.is_some() {
            return Err(EngineError::Timeout);
        }
        Ok(self.reply_for(history))
    }
}

/// Scripted TTS emitting `chunks` blocks of `audio_bytes` zero-crossing PCM.
pub struct MockTts {
    audio_bytes: usize,
    chunks: usize,
    delay: Duration,
}

impl MockTts {
    pub fn from_settings(settings: &EngineSettings) -> Self {
        settings.warn_unknown_options(TTS_OPTIONS);
        Self {
            audio_bytes: settings.option_u64("audio_bytes").unwrap_or(1600).max(1) as usize,
            chunks: settings.option_u64("chunks").unwrap_or(1).max(1) as usize,
            delay: Duration::from_millis(settings.option_u64("delay_ms").unwrap_or(0)),
        }
    }
}

#[async_trait]
impl TtsEngine for MockTts {
    fn descriptor(&self) -> EngineDescriptor {
        EngineDescriptor {
            kind: EngineKind::Tts,
            provider: "mock".into(),
            model: "mock-tts".into(),
            capabilities: vec![Capability::Batch, Capability::Stream],
        }
    }

    async fn synthesize_stream(&self, _text: &str, cancel: CancellationToken) -> Result<TtsStream> {
        let audio_bytes = self.audio_bytes;
        let chunks = self.chunks;
        let delay = self.delay;

        let (tx, rx) = mpsc::channel::<Result<TtsEvent>>(8);
        tokio::spawn(async move {
            for i in 0..chunks {
                if pace(delay, &cancel).await.is_err() {
                    return;
                }
                let chunk = vec![(i % 251) as u8; audio_bytes];
                if tx.send(Ok(TtsEvent::Audio(chunk))).await.is_err() {
                    return;
                }
            }
            let _ = tx.send(Ok(TtsEvent::Complete)).await;
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn synthesize(&self, _text: &str) -> Result<Vec<u8>> {
        Ok(vec![0u8; self.audio_bytes * self.chunks])
    }
}

/// Sleep for `delay` unless cancelled first.
async fn pace(delay: Duration, cancel: &CancellationToken) -> Result<()> {
    if delay.is_zero() {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        return Ok(());
    }
    tokio::select! {
        _ = cancel.cancelled() => Err(EngineError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Split into chunks of at most `size` characters, respecting UTF-8.
fn split_chars(text: &str, size: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(size)
        .map(|chunk| chunk.iter().collect())
        .collect()
}
