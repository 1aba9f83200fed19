//! Gateway shared state.

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;

use voxflow_core::config::Config;
use voxflow_core::dialogue::{DialogueStore, MemoryDialogueStore};
use voxflow_engines::EngineSet;

use crate::registry::SessionRegistry;

/// Shared gateway state accessible from all connections and pipelines.
pub struct GatewayState {
    pub config: Config,
    pub engines: Arc<EngineSet>,
    pub dialogue: Arc<dyn DialogueStore>,
    pub registry: Arc<SessionRegistry>,
    /// Live WebSocket connections, for the connection cap and `/health`.
    pub active_connections: AtomicUsize,
}

impl GatewayState {
    /// Build gateway state with the process-local dialogue store.
    pub fn new(config: Config, engines: EngineSet) -> Self {
        let dialogue: Arc<dyn DialogueStore> = Arc::new(MemoryDialogueStore::new(
            config.dialogue.limits(),
            config.dialogue.system_prompt.clone(),
        ));
        Self::with_dialogue(config, engines, dialogue)
    }

    /// Build gateway state around an externally-provided dialogue store.
    pub fn with_dialogue(
        config: Config,
        engines: EngineSet,
        dialogue: Arc<dyn DialogueStore>,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new(config.session.max_concurrent_sessions));
        Self {
            config,
            engines: Arc::new(engines),
            dialogue,
            registry,
            active_connections: AtomicUsize::new(0),
        }
    }
}
