//! Pipeline coordinator — runs one utterance through ASR → LLM → TTS and
//! streams the results back as response frames.
//!
//! Each pipeline is a task tree rooted at a single cancellation token owned
//! by the session; cancelling it propagates to every engine call. A session
//! runs at most one pipeline at a time.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use voxflow_core::dialogue::Turn;
use voxflow_core::error::GatewayError;
use voxflow_core::protocol::{Envelope, ResponsePayload, SessionMode, Stage};
use voxflow_engines::{AsrEvent, LlmEvent, TtsEvent, Utterance};

use crate::session::{Session, SessionState, send_on};
use crate::state::GatewayState;

/// How long a cancelled pipeline gets to acknowledge before the session is
/// torn down.
pub const CANCEL_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to an in-flight pipeline, owned by its session.
#[derive(Debug)]
pub struct PipelineHandle {
    pub cancel: CancellationToken,
    pub task: JoinHandle<()>,
}

/// Cancel a pipeline and wait for its acknowledgement. Returns false if the
/// pipeline failed to stop within [`CANCEL_ACK_TIMEOUT`].
pub async fn cancel_and_wait(handle: PipelineHandle) -> bool {
    handle.cancel.cancel();
    timeout(CANCEL_ACK_TIMEOUT, handle.task).await.is_ok()
}

/// Bounded, single-producer view of the connection's outbound queue, with
/// the backpressure policy baked in: metadata frames are dropped when the
/// queue is full, audio frames stall up to the write deadline and then
/// escalate to connection shutdown.
#[derive(Clone)]
struct OutboundSender {
    tx: Option<mpsc::Sender<Envelope>>,
    write_wait: Duration,
    conn_cancel: Option<CancellationToken>,
}

impl OutboundSender {
    fn send_metadata(&self, env: Envelope) {
        send_on(&self.tx, env);
    }

    /// Returns false when the frame could not be delivered and the pipeline
    /// should stop.
    async fn send_audio(&self, env: Envelope) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        match timeout(self.write_wait, tx.send(env)).await {
            Ok(Ok(())) => true,
            Ok(Err(_closed)) => false,
            Err(_elapsed) => {
                warn!("Outbound audio stalled past the write deadline, closing connection");
                if let Some(cancel) = &self.conn_cancel {
                    cancel.cancel();
                }
                false
            }
        }
    }
}

struct RunCtx {
    session_id: String,
    conversation_id: String,
    outbound: OutboundSender,
    cancel: CancellationToken,
}

enum Outcome {
    Completed,
    /// ASR resolved to empty text; the turn ended without LLM/TTS.
    EmptyUtterance,
    Failed {
        recoverable: bool,
    },
    /// Silent to the client. Covers both interruption and a lost connection.
    Cancelled,
}

/// Launch a pipeline for a flushed utterance. The session must already be in
/// `Processing`.
pub async fn launch(state: &Arc<GatewayState>, session: &Arc<Mutex<Session>>, utterance: Utterance) {
    let cancel = CancellationToken::new();
    let mut s = session.lock().await;

    if s.pipeline.is_some() {
        // The FSM only flushes out of Listening, so this indicates a bug.
        warn!(session_id = %s.id, "Refusing to launch a second in-flight pipeline");
        return;
    }

    s.pipeline_gen += 1;
    let gen_ = s.pipeline_gen;
    let ctx = RunCtx {
        session_id: s.id.clone(),
        conversation_id: s.conversation_id.clone(),
        outbound: OutboundSender {
            tx: s.outbound.clone(),
            write_wait: state.config.transport.write_wait(),
            conn_cancel: s.conn_cancel.clone(),
        },
        cancel: cancel.clone(),
    };

    debug!(
        session_id = %s.id,
        audio_bytes = utterance.audio.len(),
        "Launching pipeline"
    );

    let task = tokio::spawn(run_to_completion(
        state.clone(),
        session.clone(),
        ctx,
        utterance,
        gen_,
    ));
    s.pipeline = Some(PipelineHandle { cancel, task });
}

async fn run_to_completion(
    state: Arc<GatewayState>,
    session: Arc<Mutex<Session>>,
    ctx: RunCtx,
    utterance: Utterance,
    gen_: u64,
) {
    let outcome = run(&state, &session, &ctx, utterance, gen_).await;

    // Ordering rule: registry before session lock.
    let streams = state.registry.count().await;
    let mut s = session.lock().await;
    if s.pipeline_gen != gen_ {
        // A newer pipeline owns the session now; whatever happened here is
        // already accounted for by the interrupt path.
        return;
    }
    s.pipeline = None;

    match outcome {
        Outcome::Completed | Outcome::EmptyUtterance => {
            s.state = if s.mode == SessionMode::Continuous {
                SessionState::Listening
            } else {
                SessionState::Idle
            };
            let status = s.status_payload(streams);
            s.send_frame(Envelope::status(s.id.clone(), status));
        }
        Outcome::Failed { recoverable } => {
            // The error frame was already emitted inside the run.
            s.state = if !recoverable {
                SessionState::Error
            } else if s.mode == SessionMode::Continuous {
                SessionState::Listening
            } else {
                SessionState::Idle
            };
        }
        Outcome::Cancelled => {
            // Whoever cancelled us already set the session state.
        }
    }
}

async fn run(
    state: &Arc<GatewayState>,
    session: &Arc<Mutex<Session>>,
    ctx: &RunCtx,
    utterance: Utterance,
    gen_: u64,
) -> Outcome {
    let engines = &state.engines;

    // ── ASR ──
    let asr = tokio::select! {
        _ = ctx.cancel.cancelled() => return Outcome::Cancelled,
        result = timeout(engines.asr_timeout, drive_asr(state, ctx, utterance)) => result,
    };
    let (text, _confidence) = match asr {
        Err(_elapsed) => return fail(ctx, GatewayError::ProviderTimeout { stage: Stage::Asr }),
        Ok(Err(e)) => return fail(ctx, e),
        Ok(Ok(result)) => result,
    };

    // Empty final transcript halts the turn successfully.
    if text.trim().is_empty() {
        debug!(session_id = %ctx.session_id, "Empty transcript, skipping LLM/TTS");
        return Outcome::EmptyUtterance;
    }

    state
        .dialogue
        .get_or_create(
            &ctx.conversation_id,
            state.config.dialogue.system_prompt.as_deref(),
        )
        .await;
    state
        .dialogue
        .append(&ctx.conversation_id, Turn::user(text))
        .await;

    // ── LLM ──
    let history = state.dialogue.history(&ctx.conversation_id).await;
    let llm = tokio::select! {
        _ = ctx.cancel.cancelled() => return Outcome::Cancelled,
        result = timeout(engines.llm_timeout, drive_llm(state, ctx, &history)) => result,
    };
    let reply = match llm {
        Err(_elapsed) => return fail(ctx, GatewayError::ProviderTimeout { stage: Stage::Llm }),
        Ok(Err(e)) => return fail(ctx, e),
        Ok(Ok(reply)) => reply,
    };

    // ── TTS ──
    let tts = tokio::select! {
        _ = ctx.cancel.cancelled() => return Outcome::Cancelled,
        result = timeout(engines.tts_timeout, drive_tts(state, session, ctx, &reply, gen_)) => result,
    };
    match tts {
        Err(_elapsed) => return fail(ctx, GatewayError::ProviderTimeout { stage: Stage::Tts }),
        Ok(Err(e)) => return fail(ctx, e),
        Ok(Ok(())) => {}
    }

    // The assistant turn is recorded only once TTS finished uncancelled, so
    // an interrupted turn leaves no trace in the conversation.
    state
        .dialogue
        .append(&ctx.conversation_id, Turn::assistant(reply))
        .await;

    Outcome::Completed
}

/// Classify a stage error: cancelled pipelines end silently, everything else
/// is surfaced as an error frame.
fn fail(ctx: &RunCtx, err: GatewayError) -> Outcome {
    if matches!(err, GatewayError::Cancelled) || ctx.cancel.is_cancelled() {
        return Outcome::Cancelled;
    }
    warn!(session_id = %ctx.session_id, error = %err, "Pipeline stage failed");
    let recoverable = err.recoverable();
    ctx.outbound
        .send_metadata(Envelope::error(ctx.session_id.clone(), err.to_payload()));
    Outcome::Failed { recoverable }
}

async fn drive_asr(
    state: &Arc<GatewayState>,
    ctx: &RunCtx,
    utterance: Utterance,
) -> Result<(String, f64), GatewayError> {
    let mut stream = state
        .engines
        .asr
        .transcribe_stream(utterance, ctx.cancel.child_token())
        .await
        .map_err(|e| e.into_gateway(Stage::Asr, false))?;

    while let Some(event) = stream.next().await {
        match event.map_err(|e| e.into_gateway(Stage::Asr, false))? {
            AsrEvent::Partial { text, confidence } => {
                ctx.outbound.send_metadata(Envelope::response(
                    ctx.session_id.clone(),
                    ResponsePayload {
                        stage: Stage::Asr,
                        content: text,
                        confidence: Some(confidence),
                        is_final: false,
                        is_delta: false,
                        audio_data: None,
                        metadata: None,
                    },
                ));
            }
            AsrEvent::Final { text, confidence } => {
                ctx.outbound.send_metadata(Envelope::response(
                    ctx.session_id.clone(),
                    ResponsePayload {
                        stage: Stage::Asr,
                        content: text.clone(),
                        confidence: Some(confidence),
                        is_final: true,
                        is_delta: false,
                        audio_data: None,
                        metadata: None,
                    },
                ));
                return Ok((text, confidence));
            }
        }
    }

    if ctx.cancel.is_cancelled() {
        return Err(GatewayError::Cancelled);
    }
    Err(GatewayError::StageFailed {
        stage: Stage::Asr,
        message: "stream ended without a final transcript".into(),
    })
}

async fn drive_llm(
    state: &Arc<GatewayState>,
    ctx: &RunCtx,
    history: &[Turn],
) -> Result<String, GatewayError> {
    let mut stream = state
        .engines
        .llm
        .chat_stream(history, ctx.cancel.child_token())
        .await
        .map_err(|e| e.into_gateway(Stage::Llm, false))?;

    let mut accumulated = String::new();
    while let Some(event) = stream.next().await {
        match event.map_err(|e| e.into_gateway(Stage::Llm, false))? {
            LlmEvent::Delta(delta) => {
                accumulated.push_str(&delta);
                ctx.outbound.send_metadata(Envelope::response(
                    ctx.session_id.clone(),
                    ResponsePayload {
                        stage: Stage::Llm,
                        content: delta,
                        confidence: None,
                        is_final: false,
                        is_delta: true,
                        audio_data: None,
                        metadata: None,
                    },
                ));
            }
            LlmEvent::Complete { content } => {
                ctx.outbound.send_metadata(Envelope::response(
                    ctx.session_id.clone(),
                    ResponsePayload {
                        stage: Stage::Llm,
                        content: content.clone(),
                        confidence: None,
                        is_final: true,
                        is_delta: false,
                        audio_data: None,
                        metadata: None,
                    },
                ));
                return Ok(content);
            }
        }
    }

    if ctx.cancel.is_cancelled() {
        return Err(GatewayError::Cancelled);
    }
    // Terminal chunk got lost; settle for what was streamed.
    ctx.outbound.send_metadata(Envelope::response(
        ctx.session_id.clone(),
        ResponsePayload {
            stage: Stage::Llm,
            content: accumulated.clone(),
            confidence: None,
            is_final: true,
            is_delta: false,
            audio_data: None,
            metadata: None,
        },
    ));
    Ok(accumulated)
}

async fn drive_tts(
    state: &Arc<GatewayState>,
    session: &Arc<Mutex<Session>>,
    ctx: &RunCtx,
    text: &str,
    gen_: u64,
) -> Result<(), GatewayError> {
    let mut stream = state
        .engines
        .tts
        .synthesize_stream(text, ctx.cancel.child_token())
        .await
        .map_err(|e| e.into_gateway(Stage::Tts, false))?;

    // One chunk of lookahead so the last audio frame carries `is_final`.
    let mut pending: Option<Vec<u8>> = None;
    let mut speaking = false;

    while let Some(event) = stream.next().await {
        match event.map_err(|e| e.into_gateway(Stage::Tts, false))? {
            TtsEvent::Audio(bytes) => {
                if !speaking {
                    speaking = true;
                    let mut s = session.lock().await;
                    if s.pipeline_gen == gen_ && s.state == SessionState::Processing {
                        s.state = SessionState::Speaking;
                    }
                }
                if let Some(prev) = pending.replace(bytes) {
                    let delivered = ctx
                        .outbound
                        .send_audio(Envelope::response(
                            ctx.session_id.clone(),
                            audio_frame(prev, false),
                        ))
                        .await;
                    if !delivered {
                        return Err(GatewayError::Cancelled);
                    }
                }
            }
            TtsEvent::Complete => {
                let delivered = ctx
                    .outbound
                    .send_audio(Envelope::response(
                        ctx.session_id.clone(),
                        audio_frame(pending.take().unwrap_or_default(), true),
                    ))
                    .await;
                if !delivered {
                    return Err(GatewayError::Cancelled);
                }
                return Ok(());
            }
        }
    }

    if ctx.cancel.is_cancelled() {
        return Err(GatewayError::Cancelled);
    }
    Err(GatewayError::StageFailed {
        stage: Stage::Tts,
        message: "stream ended without completing".into(),
    })
}

fn audio_frame(audio: Vec<u8>, is_final: bool) -> ResponsePayload {
    ResponsePayload {
        stage: Stage::Tts,
        content: String::new(),
        confidence: None,
        is_final,
        is_delta: false,
        audio_data: Some(audio),
        metadata: None,
    }
}
