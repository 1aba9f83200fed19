//! Per-session state machine.
//!
//! Every session owns an FSM, an audio accumulation buffer, and the handle to
//! its in-flight pipeline (at most one). All mutations go through the
//! session's `tokio::sync::Mutex`, so inbound frames for one session are
//! applied strictly in receive order.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use voxflow_core::error::{GatewayError, Result};
use voxflow_core::protocol::{
    AudioFormat, AudioPayload, CommandKind, CommandPayload, Envelope, MessageType, SessionInfo,
    SessionMode, StatusPayload, WireState,
};
use voxflow_engines::Utterance;

use crate::pipeline::{self, PipelineHandle};
use crate::state::GatewayState;

/// FSM states. Wire status frames additionally report the connection-level
/// `connected`/`disconnected` pseudo-states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Listening,
    Processing,
    Speaking,
    Error,
}

impl SessionState {
    pub fn wire(self) -> WireState {
        match self {
            Self::Idle => WireState::Idle,
            Self::Listening => WireState::Listening,
            Self::Processing => WireState::Processing,
            Self::Speaking => WireState::Speaking,
            Self::Error => WireState::Error,
        }
    }
}

/// Per-client execution context.
pub struct Session {
    pub id: String,
    pub state: SessionState,
    pub mode: SessionMode,
    pub paused: bool,
    pub conversation_id: String,
    pub buffer: Vec<u8>,
    pub buffer_format: AudioFormat,
    /// Last accepted chunk id of the current utterance; ids must be strictly
    /// increasing and reset at utterance boundaries.
    pub last_chunk_id: Option<u64>,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub pipeline: Option<PipelineHandle>,
    /// Bumped on every launch so a finished pipeline can tell whether it is
    /// still the current one.
    pub pipeline_gen: u64,
    pub outbound: Option<mpsc::Sender<Envelope>>,
    pub conn_cancel: Option<CancellationToken>,
    pub conn_id: Option<String>,
}

/// What the FSM decided to do with an accepted audio chunk. The async driver
/// performs the side effects.
#[derive(Debug)]
pub enum AudioDecision {
    /// Chunk dropped (wrong state for this mode).
    Ignore,
    /// Chunk buffered; nothing to run yet.
    Accumulate,
    /// Buffer flushed into a new pipeline.
    Flush(Utterance),
    /// Speaking was interrupted: cancel this pipeline, then re-apply the
    /// chunk to a fresh buffer.
    Interrupt(Option<PipelineHandle>),
}

impl Session {
    pub fn new(id: String, mode: SessionMode) -> Self {
        let now = Utc::now();
        Self {
            id,
            state: SessionState::Idle,
            mode,
            paused: false,
            conversation_id: format!("conv-{}", uuid::Uuid::new_v4()),
            buffer: Vec::new(),
            buffer_format: AudioFormat::default(),
            last_chunk_id: None,
            started_at: now,
            last_activity: now,
            pipeline: None,
            pipeline_gen: 0,
            outbound: None,
            conn_cancel: None,
            conn_id: None,
        }
    }

    /// Apply one audio chunk to the FSM. Pure with respect to tasks: side
    /// effects are returned as an [`AudioDecision`].
    pub fn accept_chunk(
        &mut self,
        payload: &AudioPayload,
        watermark: usize,
        enable_interrupt: bool,
    ) -> Result<AudioDecision> {
        self.last_activity = Utc::now();

        if let Some(last) = self.last_chunk_id {
            if payload.chunk_id <= last {
                return Err(GatewayError::ChunkOutOfOrder {
                    last,
                    got: payload.chunk_id,
                });
            }
        }

        match self.state {
            SessionState::Error => Ok(AudioDecision::Ignore),

            SessionState::Idle => {
                if self.mode != SessionMode::Continuous {
                    debug!(session_id = %self.id, "Dropping audio outside a session");
                    return Ok(AudioDecision::Ignore);
                }
                // Continuous mode wakes the session up; the chunk only
                // accumulates, so a flush can never follow a stop directly.
                self.state = SessionState::Listening;
                self.accumulate(payload);
                Ok(AudioDecision::Accumulate)
            }

            SessionState::Listening => {
                self.accumulate(payload);
                if self.paused {
                    return Ok(AudioDecision::Accumulate);
                }
                if payload.is_final || self.buffer.len() >= watermark {
                    return Ok(AudioDecision::Flush(self.flush_utterance()));
                }
                Ok(AudioDecision::Accumulate)
            }

            // Mid-turn audio is accepted but deferred.
            SessionState::Processing => {
                self.accumulate(payload);
                Ok(AudioDecision::Accumulate)
            }

            SessionState::Speaking => {
                let may_interrupt = enable_interrupt
                    && matches!(self.mode, SessionMode::Continuous | SessionMode::Interrupt);
                if may_interrupt {
                    Ok(AudioDecision::Interrupt(self.pipeline.take()))
                } else {
                    self.accumulate(payload);
                    Ok(AudioDecision::Accumulate)
                }
            }
        }
    }

    fn accumulate(&mut self, payload: &AudioPayload) {
        self.buffer_format = payload.format;
        self.last_chunk_id = Some(payload.chunk_id);
        self.buffer.extend_from_slice(&payload.audio_data);
    }

    /// Drain the buffer into an utterance and enter `Processing`.
    pub fn flush_utterance(&mut self) -> Utterance {
        self.state = SessionState::Processing;
        self.last_chunk_id = None;
        Utterance {
            format: self.buffer_format,
            audio: std::mem::take(&mut self.buffer),
        }
    }

    /// Drop buffered audio and utterance bookkeeping.
    pub fn reset_buffer(&mut self) {
        self.buffer.clear();
        self.last_chunk_id = None;
    }

    pub fn status_payload(&self, concurrent_streams: usize) -> StatusPayload {
        StatusPayload {
            state: self.state.wire(),
            mode: self.mode,
            concurrent_streams,
            session_info: None,
        }
    }

    pub fn session_info(&self, message_count: usize) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            conversation_id: self.conversation_id.clone(),
            start_time: self.started_at,
            last_activity: self.last_activity,
            message_count,
            duration: (Utc::now() - self.started_at).num_seconds(),
        }
    }

    /// Enqueue a frame without blocking, dropping it if the queue is full.
    pub fn send_frame(&self, env: Envelope) {
        send_on(&self.outbound, env);
    }
}

/// Non-blocking enqueue used for every frame that is not pipeline audio.
pub fn send_on(outbound: &Option<mpsc::Sender<Envelope>>, env: Envelope) {
    if let Some(tx) = outbound {
        match tx.try_send(env) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Outbound queue full, dropping frame");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

/// Dispatch one decoded envelope to the session FSM.
pub async fn dispatch(
    state: &Arc<GatewayState>,
    session: &Arc<Mutex<Session>>,
    env: Envelope,
) -> Result<()> {
    match env.kind {
        MessageType::AudioStream => {
            let payload = env.audio_payload()?;
            handle_audio(state, session, payload).await
        }
        MessageType::Command => {
            let payload = env.command_payload()?;
            handle_command(state, session, payload).await
        }
        MessageType::Response | MessageType::Status | MessageType::Error => Err(
            GatewayError::UnsupportedMessageType(format!("{:?}", env.kind).to_lowercase()),
        ),
    }
}

async fn handle_audio(
    state: &Arc<GatewayState>,
    session: &Arc<Mutex<Session>>,
    payload: AudioPayload,
) -> Result<()> {
    let watermark = state.config.session.audio_buffer_size;
    let enable_interrupt = state.config.session.enable_interrupt;

    let decision = {
        let mut s = session.lock().await;
        s.accept_chunk(&payload, watermark, enable_interrupt)?
    };

    match decision {
        AudioDecision::Ignore | AudioDecision::Accumulate => Ok(()),

        AudioDecision::Flush(utterance) => {
            pipeline::launch(state, session, utterance).await;
            Ok(())
        }

        AudioDecision::Interrupt(handle) => {
            if let Some(handle) = handle {
                if !pipeline::cancel_and_wait(handle).await {
                    escalate_teardown(session).await;
                    return Ok(());
                }
            }

            // The interrupting chunk starts a fresh utterance.
            let streams = state.registry.count().await;
            let utterance = {
                let mut s = session.lock().await;
                s.reset_buffer();
                s.accumulate(&payload);
                let utterance = if payload.is_final {
                    Some(s.flush_utterance())
                } else {
                    s.state = SessionState::Listening;
                    None
                };
                let status = s.status_payload(streams);
                s.send_frame(Envelope::status(s.id.clone(), status));
                utterance
            };

            if let Some(utterance) = utterance {
                pipeline::launch(state, session, utterance).await;
            }
            Ok(())
        }
    }
}

async fn handle_command(
    state: &Arc<GatewayState>,
    session: &Arc<Mutex<Session>>,
    payload: CommandPayload,
) -> Result<()> {
    let streams = state.registry.count().await;

    match payload.command {
        CommandKind::StartSession => {
            cancel_inflight(session).await?;
            let mut s = session.lock().await;
            if let Some(mode) = payload.mode {
                s.mode = mode;
            }
            s.reset_buffer();
            s.paused = false;
            s.state = SessionState::Listening;
            s.last_activity = Utc::now();
            debug!(session_id = %s.id, mode = ?s.mode, "Session started");
            let status = s.status_payload(streams);
            s.send_frame(Envelope::status(s.id.clone(), status));
            Ok(())
        }

        CommandKind::StopSession => {
            cancel_inflight(session).await?;
            let mut s = session.lock().await;
            s.reset_buffer();
            s.paused = false;
            s.state = SessionState::Idle;
            s.last_activity = Utc::now();
            debug!(session_id = %s.id, "Session stopped");
            let status = s.status_payload(streams);
            s.send_frame(Envelope::status(s.id.clone(), status));
            Ok(())
        }

        CommandKind::Pause => {
            let mut s = session.lock().await;
            s.paused = true;
            let status = s.status_payload(streams);
            s.send_frame(Envelope::status(s.id.clone(), status));
            Ok(())
        }

        CommandKind::Resume => {
            let utterance = {
                let mut s = session.lock().await;
                s.paused = false;
                let utterance = if s.state == SessionState::Listening
                    && s.buffer.len() >= state.config.session.audio_buffer_size
                {
                    Some(s.flush_utterance())
                } else {
                    None
                };
                let status = s.status_payload(streams);
                s.send_frame(Envelope::status(s.id.clone(), status));
                utterance
            };
            if let Some(utterance) = utterance {
                pipeline::launch(state, session, utterance).await;
            }
            Ok(())
        }

        CommandKind::SetMode => {
            let mode = payload.mode.or_else(|| {
                payload
                    .parameters
                    .as_ref()
                    .and_then(|p| p.get("mode"))
                    .and_then(|m| m.as_str())
                    .and_then(SessionMode::from_str_mode)
            });
            let Some(mode) = mode else {
                return Err(GatewayError::InvalidCommand(
                    "set_mode requires a mode".into(),
                ));
            };
            let mut s = session.lock().await;
            s.mode = mode;
            s.last_activity = Utc::now();
            let status = s.status_payload(streams);
            s.send_frame(Envelope::status(s.id.clone(), status));
            Ok(())
        }

        CommandKind::GetStatus => {
            let (conv_id, snapshot_id) = {
                let s = session.lock().await;
                (s.conversation_id.clone(), s.id.clone())
            };
            let message_count = state.dialogue.turn_count(&conv_id).await;
            let s = session.lock().await;
            let mut status = s.status_payload(streams);
            status.session_info = Some(s.session_info(message_count));
            s.send_frame(Envelope::status(snapshot_id, status));
            Ok(())
        }

        CommandKind::Interrupt => {
            if !state.config.session.enable_interrupt {
                return Err(GatewayError::UnsupportedCommand(
                    "interrupt (disabled by configuration)".into(),
                ));
            }
            cancel_inflight(session).await?;
            let mut s = session.lock().await;
            s.reset_buffer();
            s.state = if s.mode == SessionMode::Continuous {
                SessionState::Listening
            } else {
                SessionState::Idle
            };
            let status = s.status_payload(streams);
            s.send_frame(Envelope::status(s.id.clone(), status));
            Ok(())
        }

        CommandKind::ClearContext => {
            let conv_id = { session.lock().await.conversation_id.clone() };
            state.dialogue.clear(&conv_id).await;
            debug!(conv_id = %conv_id, "Conversation context cleared");
            let s = session.lock().await;
            let status = s.status_payload(streams);
            s.send_frame(Envelope::status(s.id.clone(), status));
            Ok(())
        }
    }
}

/// Cancel the in-flight pipeline, if any, and wait for its acknowledgement.
async fn cancel_inflight(session: &Arc<Mutex<Session>>) -> Result<()> {
    let handle = { session.lock().await.pipeline.take() };
    if let Some(handle) = handle {
        if !pipeline::cancel_and_wait(handle).await {
            escalate_teardown(session).await;
            return Err(GatewayError::Internal(
                "pipeline did not acknowledge cancellation".into(),
            ));
        }
    }
    Ok(())
}

/// A cancellation that never completed: the session cannot be reused, so it
/// is driven to `Error` and its connection closed.
async fn escalate_teardown(session: &Arc<Mutex<Session>>) {
    let mut s = session.lock().await;
    warn!(session_id = %s.id, "Cancellation not acknowledged, tearing session down");
    s.state = SessionState::Error;
    if let Some(cancel) = &s.conn_cancel {
        cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: u64, bytes: usize, is_final: bool) -> AudioPayload {
        AudioPayload {
            format: AudioFormat::Pcm16khz16bit,
            chunk_id: id,
            is_final,
            audio_data: vec![0; bytes],
        }
    }

    fn listening_session() -> Session {
        let mut s = Session::new("s1".into(), SessionMode::Continuous);
        s.state = SessionState::Listening;
        s
    }

    #[test]
    fn accumulates_below_watermark() {
        let mut s = listening_session();
        let decision = s.accept_chunk(&chunk(1, 100, false), 1024, true).unwrap();
        assert!(matches!(decision, AudioDecision::Accumulate));
        assert_eq!(s.buffer.len(), 100);
        assert_eq!(s.state, SessionState::Listening);
    }

    #[test]
    fn watermark_boundary() {
        // One byte short of the watermark: no flush.
        let mut s = listening_session();
        let decision = s.accept_chunk(&chunk(1, 1023, false), 1024, true).unwrap();
        assert!(matches!(decision, AudioDecision::Accumulate));

        // Exactly at the watermark: flush.
        let decision = s.accept_chunk(&chunk(2, 1, false), 1024, true).unwrap();
        match decision {
            AudioDecision::Flush(utterance) => assert_eq!(utterance.audio.len(), 1024),
            other => panic!("expected flush, got {other:?}"),
        }
        assert_eq!(s.state, SessionState::Processing);
        assert!(s.buffer.is_empty());
    }

    #[test]
    fn final_chunk_flushes() {
        let mut s = listening_session();
        let decision = s.accept_chunk(&chunk(1, 10, true), 1024, true).unwrap();
        assert!(matches!(decision, AudioDecision::Flush(_)));
        assert_eq!(s.state, SessionState::Processing);
        // Chunk ids reset at the utterance boundary.
        assert_eq!(s.last_chunk_id, None);
    }

    #[test]
    fn chunk_reordering_is_protocol_error() {
        let mut s = listening_session();
        s.accept_chunk(&chunk(2, 10, false), 1024, true).unwrap();
        let err = s.accept_chunk(&chunk(2, 10, false), 1024, true).unwrap_err();
        assert!(matches!(
            err,
            GatewayError::ChunkOutOfOrder { last: 2, got: 2 }
        ));
        let err = s.accept_chunk(&chunk(1, 10, false), 1024, true).unwrap_err();
        assert!(matches!(err, GatewayError::ChunkOutOfOrder { .. }));
    }

    #[test]
    fn idle_continuous_wakes_but_never_flushes() {
        let mut s = Session::new("s1".into(), SessionMode::Continuous);
        assert_eq!(s.state, SessionState::Idle);

        // Even a final chunk only accumulates from Idle, so a stop_session
        // processed just before it can never launch a pipeline.
        let decision = s.accept_chunk(&chunk(1, 10, true), 1024, true).unwrap();
        assert!(matches!(decision, AudioDecision::Accumulate));
        assert_eq!(s.state, SessionState::Listening);
        assert_eq!(s.buffer.len(), 10);
    }

    #[test]
    fn idle_single_mode_drops_audio() {
        let mut s = Session::new("s1".into(), SessionMode::Single);
        let decision = s.accept_chunk(&chunk(1, 10, false), 1024, true).unwrap();
        assert!(matches!(decision, AudioDecision::Ignore));
        assert!(s.buffer.is_empty());
        assert_eq!(s.state, SessionState::Idle);
    }

    #[test]
    fn processing_defers_audio() {
        let mut s = listening_session();
        s.state = SessionState::Processing;
        let decision = s.accept_chunk(&chunk(1, 10, true), 1024, true).unwrap();
        assert!(matches!(decision, AudioDecision::Accumulate));
        assert_eq!(s.state, SessionState::Processing);
        assert_eq!(s.buffer.len(), 10);
    }

    #[test]
    fn speaking_interrupts_when_allowed() {
        let mut s = listening_session();
        s.state = SessionState::Speaking;
        let decision = s.accept_chunk(&chunk(1, 10, false), 1024, true).unwrap();
        assert!(matches!(decision, AudioDecision::Interrupt(None)));
    }

    #[test]
    fn speaking_defers_when_interrupt_disabled() {
        let mut s = listening_session();
        s.state = SessionState::Speaking;
        let decision = s.accept_chunk(&chunk(1, 10, false), 1024, false).unwrap();
        assert!(matches!(decision, AudioDecision::Accumulate));
        assert_eq!(s.state, SessionState::Speaking);
    }

    #[test]
    fn speaking_defers_in_single_mode() {
        let mut s = Session::new("s1".into(), SessionMode::Single);
        s.state = SessionState::Speaking;
        let decision = s.accept_chunk(&chunk(1, 10, false), 1024, true).unwrap();
        assert!(matches!(decision, AudioDecision::Accumulate));
    }

    #[test]
    fn paused_session_never_flushes() {
        let mut s = listening_session();
        s.paused = true;
        let decision = s.accept_chunk(&chunk(1, 2048, true), 1024, true).unwrap();
        assert!(matches!(decision, AudioDecision::Accumulate));
        assert_eq!(s.buffer.len(), 2048);
    }

    #[test]
    fn error_state_ignores_audio() {
        let mut s = listening_session();
        s.state = SessionState::Error;
        let decision = s.accept_chunk(&chunk(1, 10, true), 1024, true).unwrap();
        assert!(matches!(decision, AudioDecision::Ignore));
    }

    #[test]
    fn session_info_references_conversation() {
        let s = Session::new("s1".into(), SessionMode::Single);
        let info = s.session_info(3);
        assert_eq!(info.id, "s1");
        assert_eq!(info.conversation_id, s.conversation_id);
        assert_eq!(info.message_count, 3);
    }
}
