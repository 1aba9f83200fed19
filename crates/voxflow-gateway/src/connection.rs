//! WebSocket connection lifecycle — per-connection inbound and outbound
//! workers.
//!
//! Each connection runs two sibling tasks sharing a cancellation token: the
//! inbound worker decodes frames and dispatches them to the session FSM, the
//! outbound worker drains the session's bounded frame queue and runs the
//! heartbeat. Either worker failing stops the other.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use voxflow_core::error::GatewayError;
use voxflow_core::protocol::{Envelope, WireState};

use crate::session::{self, Session, SessionState, send_on};
use crate::state::GatewayState;

/// Bound on the per-session outbound frame queue.
const OUTBOUND_QUEUE_CAPACITY: usize = 64;

/// Handle a new WebSocket connection end to end.
pub async fn handle_ws_connection(
    state: Arc<GatewayState>,
    ws: WebSocket,
    requested_session: Option<String>,
) {
    let session_id = requested_session
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let conn_id = Uuid::new_v4().to_string();
    info!(conn_id = %conn_id, session_id = %session_id, "New WebSocket connection");

    let (ws_tx, ws_rx) = ws.split();
    let (out_tx, out_rx) = mpsc::channel::<Envelope>(OUTBOUND_QUEUE_CAPACITY);
    let conn_cancel = CancellationToken::new();

    let session = state
        .registry
        .bind(
            &session_id,
            state.config.session.default_mode,
            out_tx.clone(),
            conn_cancel.clone(),
            conn_id.clone(),
        )
        .await;

    // Connection greeting.
    let streams = state.registry.count().await;
    {
        let s = session.lock().await;
        let mut status = s.status_payload(streams);
        status.state = WireState::Connected;
        s.send_frame(Envelope::status(session_id.clone(), status));
    }

    let send_task = tokio::spawn(outbound_loop(
        ws_tx,
        out_rx,
        state.config.transport.ping_period(),
        state.config.transport.write_wait(),
        conn_cancel.clone(),
    ));

    inbound_loop(&state, &session, ws_rx, &out_tx, &conn_cancel).await;

    conn_cancel.cancel();
    let _ = send_task.await;
    state.registry.unbind(&session_id, &conn_id).await;
    info!(conn_id = %conn_id, session_id = %session_id, "WebSocket connection closed");
}

/// Read frames until the connection dies or the read deadline expires. The
/// deadline is refreshed by any inbound traffic, pongs included.
async fn inbound_loop(
    state: &Arc<GatewayState>,
    session: &Arc<Mutex<Session>>,
    mut ws_rx: SplitStream<WebSocket>,
    out_tx: &mpsc::Sender<Envelope>,
    conn_cancel: &CancellationToken,
) {
    let pong_wait = state.config.transport.pong_wait();

    loop {
        let next = tokio::select! {
            _ = conn_cancel.cancelled() => break,
            next = timeout(pong_wait, ws_rx.next()) => next,
        };

        let msg = match next {
            Err(_elapsed) => {
                warn!("Read deadline expired without traffic, closing connection");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!(error = %e, "WebSocket read error");
                break;
            }
            Ok(Some(Ok(msg))) => msg,
        };

        match msg {
            Message::Text(text) => {
                process_frame(state, session, out_tx, text.as_str()).await;
            }
            Message::Binary(_) => {
                // Binary framing is not negotiated on this endpoint.
                let err = GatewayError::UnsupportedMessageType("binary".into());
                send_on(
                    &Some(out_tx.clone()),
                    Envelope::error(current_session_id(session).await, err.to_payload()),
                );
            }
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(_) => {
                debug!("Client requested close");
                break;
            }
        }
    }
}

async fn process_frame(
    state: &Arc<GatewayState>,
    session: &Arc<Mutex<Session>>,
    out_tx: &mpsc::Sender<Envelope>,
    text: &str,
) {
    let session_id = current_session_id(session).await;

    match Envelope::decode(text) {
        Ok(env) => {
            if let Err(e) = session::dispatch(state, session, env).await {
                warn!(session_id = %session_id, error = %e, "Frame dispatch failed");
                send_on(
                    &Some(out_tx.clone()),
                    Envelope::error(session_id, e.to_payload()),
                );
                if !e.recoverable() {
                    session.lock().await.state = SessionState::Error;
                }
            }
        }
        Err(e) => {
            // Decode failures are protocol errors: surfaced, state unchanged.
            send_on(
                &Some(out_tx.clone()),
                Envelope::error(session_id, e.to_payload()),
            );
        }
    }
}

async fn current_session_id(session: &Arc<Mutex<Session>>) -> String {
    session.lock().await.id.clone()
}

/// Serialize frames from the outbound queue and run the heartbeat.
async fn outbound_loop(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut out_rx: mpsc::Receiver<Envelope>,
    ping_period: std::time::Duration,
    write_wait: std::time::Duration,
    conn_cancel: CancellationToken,
) {
    let mut ping = tokio::time::interval(ping_period);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = conn_cancel.cancelled() => break,

            _ = ping.tick() => {
                let sent = timeout(write_wait, ws_tx.send(Message::Ping(Vec::new().into()))).await;
                if !matches!(sent, Ok(Ok(()))) {
                    debug!("Heartbeat write failed, closing connection");
                    break;
                }
            }

            frame = out_rx.recv() => {
                let Some(env) = frame else { break };
                let text = match env.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "Dropping unserializable frame");
                        continue;
                    }
                };
                let sent = timeout(write_wait, ws_tx.send(Message::Text(text.into()))).await;
                if !matches!(sent, Ok(Ok(()))) {
                    debug!("Frame write failed, closing connection");
                    break;
                }
            }
        }
    }

    // Flush anything still queued (teardown statuses in particular), then
    // stop the sibling reader and close.
    while let Ok(env) = out_rx.try_recv() {
        let Ok(text) = env.encode() else { continue };
        if timeout(write_wait, ws_tx.send(Message::Text(text.into())))
            .await
            .is_err()
        {
            break;
        }
    }
    conn_cancel.cancel();
    let _ = ws_tx.close().await;
}
