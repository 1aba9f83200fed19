//! Engine abstraction layer.
//!
//! Each of the three pipeline stages (ASR, LLM, TTS) is a capability trait
//! with a streaming and a batch call. Adapters are process-wide, stateless
//! with respect to sessions, and receive all context as parameters. A
//! [`EngineRegistry`] maps provider names to factories, populated at process
//! start and queried at session setup.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use voxflow_core::config::{EngineSettings, EnginesConfig};
use voxflow_core::dialogue::Turn;
use voxflow_core::error::GatewayError;
use voxflow_core::protocol::{AudioFormat, Stage};

pub mod elevenlabs_tts;
pub mod mock;
pub mod ollama_llm;
pub mod openai_asr;
pub mod openai_llm;
pub mod sse;

/// Which stage an engine serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    Asr,
    Llm,
    Tts,
}

/// Capabilities an adapter may advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Batch,
    Stream,
    FunctionCall,
}

/// Static description of a constructed engine.
#[derive(Debug, Clone, Serialize)]
pub struct EngineDescriptor {
    pub kind: EngineKind,
    pub provider: String,
    pub model: String,
    pub capabilities: Vec<Capability>,
}

impl EngineDescriptor {
    pub fn supports(&self, cap: Capability) -> bool {
        self.capabilities.contains(&cap)
    }
}

/// Adapter-level errors, classified by the caller into the gateway taxonomy.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid engine config: {0}")]
    ConfigInvalid(String),

    #[error("backend unreachable: {0}")]
    Unreachable(String),

    #[error("engine call timed out")]
    Timeout,

    #[error("{0}")]
    Failed(String),

    #[error("cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Classify into the wire-facing taxonomy, tagged with the stage it
    /// originated from.
    pub fn into_gateway(self, stage: Stage, during_init: bool) -> GatewayError {
        match self {
            Self::ConfigInvalid(msg) => GatewayError::Config(msg),
            Self::Unreachable(message) => GatewayError::ProviderUnreachable {
                stage,
                message,
                during_init,
            },
            Self::Timeout => GatewayError::ProviderTimeout { stage },
            Self::Failed(message) => GatewayError::StageFailed { stage, message },
            Self::Cancelled => GatewayError::Cancelled,
        }
    }
}

/// A finished utterance handed to ASR.
#[derive(Debug, Clone)]
pub struct Utterance {
    pub format: AudioFormat,
    pub audio: Vec<u8>,
}

/// Batch transcription result.
#[derive(Debug, Clone)]
pub struct Transcript {
    pub text: String,
    pub confidence: f64,
}

/// Streamed ASR output. The stream terminates with exactly one `Final`.
#[derive(Debug, Clone)]
pub enum AsrEvent {
    Partial { text: String, confidence: f64 },
    Final { text: String, confidence: f64 },
}

/// Streamed LLM output. The stream terminates with exactly one `Complete`
/// carrying the full accumulated content.
#[derive(Debug, Clone)]
pub enum LlmEvent {
    Delta(String),
    Complete { content: String },
}

/// Streamed TTS output. The stream terminates with exactly one `Complete`.
#[derive(Debug, Clone)]
pub enum TtsEvent {
    Audio(Vec<u8>),
    Complete,
}

pub type AsrStream = Pin<Box<dyn Stream<Item = Result<AsrEvent>> + Send>>;
pub type LlmStream = Pin<Box<dyn Stream<Item = Result<LlmEvent>> + Send>>;
pub type TtsStream = Pin<Box<dyn Stream<Item = Result<TtsEvent>> + Send>>;

/// Speech-to-text capability.
#[async_trait]
pub trait AsrEngine: Send + Sync {
    fn descriptor(&self) -> EngineDescriptor;

    /// Verify the backend is reachable. Called once at gateway startup.
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    /// Transcribe a finished utterance, streaming partial hypotheses.
    async fn transcribe_stream(
        &self,
        utterance: Utterance,
        cancel: CancellationToken,
    ) -> Result<AsrStream>;

    /// The same logic folded to one final transcript.
    async fn transcribe(&self, utterance: Utterance) -> Result<Transcript>;

    /// Release external handles.
    async fn close(&self) {}
}

/// Dialogue-generation capability. The history is read-only; adapters may
/// build a trimmed view of it but never persist one.
#[async_trait]
pub trait LlmEngine: Send + Sync {
    fn descriptor(&self) -> EngineDescriptor;

    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    /// Stream a reply conditioned on the conversation history.
    async fn chat_stream(&self, history: &[Turn], cancel: CancellationToken) -> Result<LlmStream>;

    /// The same logic folded to one final reply.
    async fn chat(&self, history: &[Turn]) -> Result<String>;

    async fn close(&self) {}
}

/// Text-to-speech capability.
#[async_trait]
pub trait TtsEngine: Send + Sync {
    fn descriptor(&self) -> EngineDescriptor;

    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    /// Synthesize audio for the full reply text, streaming chunks.
    async fn synthesize_stream(&self, text: &str, cancel: CancellationToken) -> Result<TtsStream>;

    /// The same logic folded to one audio buffer.
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>>;

    async fn close(&self) {}
}

type AsrFactory = Box<dyn Fn(&EngineSettings) -> Result<Arc<dyn AsrEngine>> + Send + Sync>;
type LlmFactory = Box<dyn Fn(&EngineSettings) -> Result<Arc<dyn LlmEngine>> + Send + Sync>;
type TtsFactory = Box<dyn Fn(&EngineSettings) -> Result<Arc<dyn TtsEngine>> + Send + Sync>;

/// Late-bound provider registry: `provider_name -> factory`, one table per
/// capability.
#[derive(Default)]
pub struct EngineRegistry {
    asr: HashMap<String, AsrFactory>,
    llm: HashMap<String, LlmFactory>,
    tts: HashMap<String, TtsFactory>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_asr<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&EngineSettings) -> Result<Arc<dyn AsrEngine>> + Send + Sync + 'static,
    {
        self.asr.insert(name.into(), Box::new(factory));
    }

    pub fn register_llm<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&EngineSettings) -> Result<Arc<dyn LlmEngine>> + Send + Sync + 'static,
    {
        self.llm.insert(name.into(), Box::new(factory));
    }

    pub fn register_tts<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&EngineSettings) -> Result<Arc<dyn TtsEngine>> + Send + Sync + 'static,
    {
        self.tts.insert(name.into(), Box::new(factory));
    }

    pub fn build_asr(
        &self,
        settings: &EngineSettings,
    ) -> std::result::Result<Arc<dyn AsrEngine>, GatewayError> {
        let factory =
            self.asr
                .get(&settings.provider)
                .ok_or_else(|| GatewayError::UnsupportedProvider {
                    kind: "asr",
                    name: settings.provider.clone(),
                })?;
        factory(settings).map_err(|e| e.into_gateway(Stage::Asr, true))
    }

    pub fn build_llm(
        &self,
        settings: &EngineSettings,
    ) -> std::result::Result<Arc<dyn LlmEngine>, GatewayError> {
        let factory =
            self.llm
                .get(&settings.provider)
                .ok_or_else(|| GatewayError::UnsupportedProvider {
                    kind: "llm",
                    name: settings.provider.clone(),
                })?;
        factory(settings).map_err(|e| e.into_gateway(Stage::Llm, true))
    }

    pub fn build_tts(
        &self,
        settings: &EngineSettings,
    ) -> std::result::Result<Arc<dyn TtsEngine>, GatewayError> {
        let factory =
            self.tts
                .get(&settings.provider)
                .ok_or_else(|| GatewayError::UnsupportedProvider {
                    kind: "tts",
                    name: settings.provider.clone(),
                })?;
        factory(settings).map_err(|e| e.into_gateway(Stage::Tts, true))
    }

    pub fn asr_providers(&self) -> Vec<&str> {
        self.asr.keys().map(String::as_str).collect()
    }

    pub fn llm_providers(&self) -> Vec<&str> {
        self.llm.keys().map(String::as_str).collect()
    }

    pub fn tts_providers(&self) -> Vec<&str> {
        self.tts.keys().map(String::as_str).collect()
    }
}

/// Registry preloaded with every shipped adapter.
pub fn builtin_registry() -> EngineRegistry {
    let mut registry = EngineRegistry::new();

    registry.register_asr("openai", |s| {
        Ok(Arc::new(openai_asr::OpenAiAsr::from_settings(s)?) as Arc<dyn AsrEngine>)
    });
    registry.register_asr("mock", |s| {
        Ok(Arc::new(mock::MockAsr::from_settings(s)) as Arc<dyn AsrEngine>)
    });

    registry.register_llm("openai", |s| {
        Ok(Arc::new(openai_llm::OpenAiLlm::from_settings(s)?) as Arc<dyn LlmEngine>)
    });
    registry.register_llm("ollama", |s| {
        Ok(Arc::new(ollama_llm::OllamaLlm::from_settings(s)?) as Arc<dyn LlmEngine>)
    });
    registry.register_llm("mock", |s| {
        Ok(Arc::new(mock::MockLlm::from_settings(s)) as Arc<dyn LlmEngine>)
    });

    registry.register_tts("elevenlabs", |s| {
        Ok(Arc::new(elevenlabs_tts::ElevenLabsTts::from_settings(s)?) as Arc<dyn TtsEngine>)
    });
    registry.register_tts("mock", |s| {
        Ok(Arc::new(mock::MockTts::from_settings(s)) as Arc<dyn TtsEngine>)
    });

    registry
}

/// The three engines one gateway process runs with, plus their per-call
/// timeouts.
pub struct EngineSet {
    pub asr: Arc<dyn AsrEngine>,
    pub llm: Arc<dyn LlmEngine>,
    pub tts: Arc<dyn TtsEngine>,
    pub asr_timeout: std::time::Duration,
    pub llm_timeout: std::time::Duration,
    pub tts_timeout: std::time::Duration,
}

impl EngineSet {
    /// Build all three engines from config via the registry.
    pub fn from_config(
        registry: &EngineRegistry,
        config: &EnginesConfig,
    ) -> std::result::Result<Self, GatewayError> {
        Ok(Self {
            asr: registry.build_asr(&config.asr)?,
            llm: registry.build_llm(&config.llm)?,
            tts: registry.build_tts(&config.tts)?,
            asr_timeout: config.asr.timeout(),
            llm_timeout: config.llm.timeout(),
            tts_timeout: config.tts.timeout(),
        })
    }

    pub fn timeout_for(&self, stage: Stage) -> std::time::Duration {
        match stage {
            Stage::Asr => self.asr_timeout,
            Stage::Llm => self.llm_timeout,
            Stage::Tts => self.tts_timeout,
        }
    }

    /// Initialize every engine, mapping failures to stage-tagged init errors.
    pub async fn initialize(&self) -> std::result::Result<(), GatewayError> {
        self.asr
            .initialize()
            .await
            .map_err(|e| e.into_gateway(Stage::Asr, true))?;
        self.llm
            .initialize()
            .await
            .map_err(|e| e.into_gateway(Stage::Llm, true))?;
        self.tts
            .initialize()
            .await
            .map_err(|e| e.into_gateway(Stage::Tts, true))?;
        Ok(())
    }

    /// Release every engine's external handles.
    pub async fn close(&self) {
        self.asr.close().await;
        self.llm.close().await;
        self.tts.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_has_expected_providers() {
        let registry = builtin_registry();
        let mut asr = registry.asr_providers();
        asr.sort_unstable();
        assert_eq!(asr, vec!["mock", "openai"]);

        let mut llm = registry.llm_providers();
        llm.sort_unstable();
        assert_eq!(llm, vec!["mock", "ollama", "openai"]);

        let mut tts = registry.tts_providers();
        tts.sort_unstable();
        assert_eq!(tts, vec!["elevenlabs", "mock"]);
    }

    #[test]
    fn unknown_provider_is_classified() {
        let registry = builtin_registry();
        let settings = EngineSettings {
            provider: "carrier-pigeon".into(),
            ..EngineSettings::default()
        };
        let err = match registry.build_asr(&settings) {
            Err(e) => e,
            Ok(_) => panic!("expected build_asr to fail"),
        };
        assert!(matches!(
            err,
            GatewayError::UnsupportedProvider { kind: "asr", ref name } if name == "carrier-pigeon"
        ));
        assert!(!err.recoverable());
    }

    #[test]
    fn engine_set_from_default_config_uses_mocks() {
        let registry = builtin_registry();
        let set = EngineSet::from_config(&registry, &EnginesConfig::default()).unwrap();
        assert_eq!(set.asr.descriptor().provider, "mock");
        assert_eq!(set.llm.descriptor().provider, "mock");
        assert_eq!(set.tts.descriptor().provider, "mock");
        assert_eq!(set.timeout_for(Stage::Llm), std::time::Duration::from_secs(30));
    }

    #[test]
    fn engine_error_classification() {
        let err = EngineError::Timeout.into_gateway(Stage::Llm, false);
        assert_eq!(err.code(), "LLM_FAILED");
        assert!(err.recoverable());

        let err = EngineError::Unreachable("refused".into()).into_gateway(Stage::Asr, true);
        assert!(!err.recoverable());

        let err = EngineError::Cancelled.into_gateway(Stage::Tts, false);
        assert!(matches!(err, GatewayError::Cancelled));
    }

    #[test]
    fn descriptor_capabilities() {
        let desc = EngineDescriptor {
            kind: EngineKind::Llm,
            provider: "openai".into(),
            model: "gpt-4o-mini".into(),
            capabilities: vec![Capability::Batch, Capability::Stream],
        };
        assert!(desc.supports(Capability::Stream));
        assert!(!desc.supports(Capability::FunctionCall));
    }
}
