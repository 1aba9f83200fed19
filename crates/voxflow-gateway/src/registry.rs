//! Session registry — allocates sessions, enforces the cap, evicts idle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use voxflow_core::error::GatewayError;
use voxflow_core::protocol::{Envelope, SessionMode, StatusPayload, WireState};

use crate::session::Session;

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Mutex<Session>>>>,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions,
        }
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<Mutex<Session>>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Bind a connection to its session, creating the session if needed. A
    /// reconnect with a known `session_id` rebinds without losing the
    /// conversation reference.
    pub async fn bind(
        &self,
        session_id: &str,
        default_mode: SessionMode,
        outbound: mpsc::Sender<Envelope>,
        conn_cancel: CancellationToken,
        conn_id: String,
    ) -> Arc<Mutex<Session>> {
        let mut map = self.sessions.write().await;

        let session = match map.get(session_id) {
            Some(existing) => {
                debug!(session_id, "Rebinding session to a new connection");
                existing.clone()
            }
            None => {
                if map.len() >= self.max_sessions {
                    evict_oldest(&mut map).await;
                }
                let session = Arc::new(Mutex::new(Session::new(
                    session_id.to_string(),
                    default_mode,
                )));
                map.insert(session_id.to_string(), session.clone());
                info!(session_id, "Session created");
                session
            }
        };

        let mut s = session.lock().await;
        s.outbound = Some(outbound);
        s.conn_cancel = Some(conn_cancel);
        s.conn_id = Some(conn_id);
        s.last_activity = Utc::now();
        drop(s);

        session
    }

    /// Detach a closed connection from its session. The session itself stays
    /// alive for a grace window so a reconnect can pick it back up.
    pub async fn unbind(&self, session_id: &str, conn_id: &str) {
        let session = self.get(session_id).await;
        if let Some(session) = session {
            let mut s = session.lock().await;
            if s.conn_id.as_deref() == Some(conn_id) {
                s.outbound = None;
                s.conn_cancel = None;
                s.conn_id = None;
                debug!(session_id, "Connection unbound from session");
            }
        }
    }

    pub async fn remove(&self, session_id: &str) {
        self.sessions.write().await.remove(session_id);
    }

    /// Evict every session whose last activity is older than `timeout`.
    pub async fn evict_idle(&self, timeout: Duration) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::seconds(0));
        let mut map = self.sessions.write().await;

        let mut stale = Vec::new();
        for (id, session) in map.iter() {
            if session.lock().await.last_activity < cutoff {
                stale.push(id.clone());
            }
        }
        for id in stale {
            if let Some(session) = map.remove(&id) {
                teardown(&id, &session, map.len(), None).await;
                info!(session_id = %id, "Evicted idle session");
            }
        }
    }

    /// Periodically sweep out idle sessions.
    pub fn spawn_idle_sweeper(self: &Arc<Self>, timeout: Duration) {
        let registry = self.clone();
        let period = (timeout / 4).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await; // the first tick fires immediately
            loop {
                ticker.tick().await;
                registry.evict_idle(timeout).await;
            }
        });
    }
}

/// Evict the session with the oldest last activity to make room for a new
/// one.
async fn evict_oldest(map: &mut HashMap<String, Arc<Mutex<Session>>>) {
    let mut oldest: Option<(String, chrono::DateTime<Utc>)> = None;
    for (id, session) in map.iter() {
        let last_activity = session.lock().await.last_activity;
        if oldest
            .as_ref()
            .is_none_or(|(_, current)| last_activity < *current)
        {
            oldest = Some((id.clone(), last_activity));
        }
    }

    if let Some((id, _)) = oldest {
        if let Some(session) = map.remove(&id) {
            teardown(&id, &session, map.len(), Some(GatewayError::SessionLimitExceeded)).await;
            info!(session_id = %id, "Evicted oldest session at capacity");
        }
    }
}

/// Cancel a session's pipeline, notify its client, and close its connection.
async fn teardown(
    id: &str,
    session: &Arc<Mutex<Session>>,
    remaining: usize,
    reason: Option<GatewayError>,
) {
    let mut s = session.lock().await;
    if let Some(handle) = s.pipeline.take() {
        handle.cancel.cancel();
    }
    if let Some(reason) = reason {
        s.send_frame(Envelope::error(id.to_string(), reason.to_payload()));
    }
    s.send_frame(Envelope::status(
        id.to_string(),
        StatusPayload {
            state: WireState::Disconnected,
            mode: s.mode,
            concurrent_streams: remaining,
            session_info: None,
        },
    ));
    if let Some(cancel) = s.conn_cancel.take() {
        cancel.cancel();
    }
    s.outbound = None;
    s.conn_id = None;
}
