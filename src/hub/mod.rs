//! Session registry and fan-out. The Hub is the only thing that ever
//! touches the transport layer's outbound sinks or a document engine's
//! handle — sessions, subscriber sets, and engines are all indexed here.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;

use crate::document::{Cursor, DocumentMetadata, Presence};
use crate::engine::{self, EngineConfig, EngineError, EngineEvent, EngineHandle, JoinRequest};
use crate::ot::Op;
use crate::store::{DocumentStore, StoreError};

#[derive(Debug, Error)]
pub enum HubError {
    #[error("unknown session {0}")]
    UnknownSession(String),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Every message the transport layer ever writes to a socket. `DocumentState`
/// is delivered directly to the joining session; everything else arrives
/// through the Hub's broadcast dispatcher.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum OutboundMessage {
    DocumentState {
        content: String,
        version: u64,
        metadata: DocumentMetadata,
        active_users: Vec<Presence>,
    },
    OperationImmediate {
        operation: Op,
        temp_content: String,
        user: Presence,
    },
    DocumentSync {
        content: String,
        version: u64,
        operations: Vec<Op>,
        metadata: DocumentMetadata,
    },
    UserJoined {
        user: Presence,
        socket_id: String,
    },
    UserLeft {
        user: Presence,
        socket_id: String,
    },
    UsersUpdated {
        active_users: Vec<Presence>,
    },
    CursorUpdate {
        user: Presence,
        cursor: Cursor,
        timestamp: DateTime<Utc>,
    },
    Error {
        message: String,
    },
    Fatal {
        message: String,
    },
}

impl From<EngineEvent> for OutboundMessage {
    fn from(event: EngineEvent) -> Self {
        match event {
            EngineEvent::OperationImmediate { operation, temp_content, user } => {
                OutboundMessage::OperationImmediate { operation, temp_content, user }
            }
            EngineEvent::DocumentSync { content, version, operations, metadata } => {
                OutboundMessage::DocumentSync { content, version, operations, metadata }
            }
            EngineEvent::UserJoined { user, socket_id } => OutboundMessage::UserJoined { user, socket_id },
            EngineEvent::UserLeft { user, socket_id } => OutboundMessage::UserLeft { user, socket_id },
            EngineEvent::UsersUpdated { active_users } => OutboundMessage::UsersUpdated { active_users },
            EngineEvent::CursorUpdate { user, cursor, timestamp } => {
                OutboundMessage::CursorUpdate { user, cursor, timestamp }
            }
            EngineEvent::Error { message } => OutboundMessage::Error { message },
            EngineEvent::Fatal { message } => OutboundMessage::Fatal { message },
        }
    }
}

struct SessionInfo {
    document_id: String,
    sink: mpsc::UnboundedSender<OutboundMessage>,
}

/// The session/document registry. Owns every [`EngineHandle`] and every
/// outbound sink; the transport layer talks only to `Hub`, never directly
/// to an engine.
pub struct Hub {
    engines: RwLock<HashMap<String, EngineHandle>>,
    sessions: RwLock<HashMap<String, SessionInfo>>,
    subscribers: RwLock<HashMap<String, HashSet<String>>>,
    idle_since: RwLock<HashMap<String, Instant>>,
    store: DocumentStore,
    config: EngineConfig,
    emit_tx: mpsc::UnboundedSender<engine::EngineEmission>,
    idle_eviction: Duration,
}

impl Hub {
    pub fn new(store: DocumentStore, config: EngineConfig, idle_eviction: Duration) -> Arc<Hub> {
        let (emit_tx, emit_rx) = mpsc::unbounded_channel();
        let hub = Arc::new(Hub {
            engines: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(HashMap::new()),
            idle_since: RwLock::new(HashMap::new()),
            store,
            config,
            emit_tx,
            idle_eviction,
        });
        tokio::spawn(Hub::dispatch(hub.clone(), emit_rx));
        hub
    }

    /// Start the background idle-eviction sweep. Separate from `new` so
    /// tests can construct a Hub without a sweep task running.
    pub fn spawn_idle_sweep(self: &Arc<Self>) {
        let hub = self.clone();
        tokio::spawn(async move {
            let period = hub.idle_eviction.min(Duration::from_secs(60)).max(Duration::from_secs(1));
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                hub.sweep_idle().await;
            }
        });
    }

    async fn dispatch(hub: Arc<Hub>, mut emit_rx: mpsc::UnboundedReceiver<engine::EngineEmission>) {
        while let Some(emission) = emit_rx.recv().await {
            hub.fan_out(emission).await;
        }
    }

    /// Copy the subscriber set out before sending — the Hub lock is
    /// never held across a sink write.
    async fn fan_out(&self, emission: engine::EngineEmission) {
        let recipients: Vec<String> = {
            let subs = self.subscribers.read().await;
            subs.get(&emission.document_id).cloned().unwrap_or_default().into_iter().collect()
        };
        let message: OutboundMessage = emission.event.into();

        let mut dead = Vec::new();
        {
            let sessions = self.sessions.read().await;
            for session_id in &recipients {
                if emission.exclude_session.as_deref() == Some(session_id.as_str()) {
                    continue;
                }
                if let Some(info) = sessions.get(session_id) {
                    if info.sink.send(message.clone()).is_err() {
                        dead.push(session_id.clone());
                    }
                }
            }
        }
        for session_id in dead {
            log::warn!("sink for session {session_id} failed, treating as disconnected");
            self.disconnect(&session_id).await;
        }
    }

    async fn get_or_spawn_engine(&self, document_id: &str) -> EngineHandle {
        if let Some(handle) = self.engines.read().await.get(document_id) {
            return handle.clone();
        }
        let mut engines = self.engines.write().await;
        engines
            .entry(document_id.to_string())
            .or_insert_with(|| {
                engine::spawn(document_id.to_string(), self.store.clone(), self.emit_tx.clone(), self.config)
            })
            .clone()
    }

    /// Attach `session_id` to `document_id`, sending the initial
    /// `document-state` directly to `sink` before anything else can
    /// reach it.
    pub async fn join(
        &self,
        session_id: String,
        document_id: String,
        user: JoinRequest,
        sink: mpsc::UnboundedSender<OutboundMessage>,
    ) -> Result<(), HubError> {
        let handle = self.get_or_spawn_engine(&document_id).await;
        let result = handle.join(session_id.clone(), user).await?;

        // Deliver document-state directly before this session is visible to
        // the fan-out dispatcher — otherwise a concurrent operation-immediate
        // or document-sync for this document could reach the sink first.
        let _ = sink.send(OutboundMessage::DocumentState {
            content: result.snapshot.content,
            version: result.snapshot.version,
            metadata: result.snapshot.metadata,
            active_users: result.active_users,
        });

        self.sessions.write().await.insert(session_id.clone(), SessionInfo { document_id: document_id.clone(), sink: sink.clone() });
        self.subscribers.write().await.entry(document_id).or_default().insert(session_id);
        self.idle_since.write().await.remove(handle.document_id());
        Ok(())
    }

    /// Remove `session_id` from both indices, then force the owning
    /// engine to detach it — this ordering hides the leaving session from
    /// its own `users-updated` broadcast.
    pub async fn disconnect(&self, session_id: &str) {
        let info = self.sessions.write().await.remove(session_id);
        let Some(info) = info else { return };

        if let Some(set) = self.subscribers.write().await.get_mut(&info.document_id) {
            set.remove(session_id);
        }

        if let Some(handle) = self.engines.read().await.get(&info.document_id).cloned() {
            let _ = handle.leave(session_id.to_string()).await;
        }
    }

    pub async fn enqueue(&self, session_id: &str, op: Op) -> Result<(), HubError> {
        let handle = self.engine_for_session(session_id).await?;
        handle.enqueue(session_id.to_string(), op).await?;
        Ok(())
    }

    pub async fn cursor(&self, session_id: &str, cursor: Cursor) -> Result<(), HubError> {
        let handle = self.engine_for_session(session_id).await?;
        handle.cursor(session_id.to_string(), cursor).await?;
        Ok(())
    }

    /// Send an `error` message directly to one session's sink, per the
    /// "recoverable errors surface to the originator only" policy.
    pub async fn send_error(&self, session_id: &str, message: String) {
        if let Some(info) = self.sessions.read().await.get(session_id) {
            let _ = info.sink.send(OutboundMessage::Error { message });
        }
    }

    async fn engine_for_session(&self, session_id: &str) -> Result<EngineHandle, HubError> {
        let document_id = self
            .sessions
            .read()
            .await
            .get(session_id)
            .map(|info| info.document_id.clone())
            .ok_or_else(|| HubError::UnknownSession(session_id.to_string()))?;
        Ok(self.get_or_spawn_engine(&document_id).await)
    }

    /// Used by the metadata API: get (lazily spawning) the engine for a
    /// document without attaching any session.
    pub async fn engine(&self, document_id: &str) -> EngineHandle {
        self.get_or_spawn_engine(document_id).await
    }

    pub fn store(&self) -> &DocumentStore {
        &self.store
    }

    pub async fn active_document_count(&self) -> usize {
        self.engines.read().await.len()
    }

    async fn sweep_idle(&self) {
        let now = Instant::now();
        let engine_ids: Vec<String> = self.engines.read().await.keys().cloned().collect();
        let mut to_evict = Vec::new();

        {
            let subs = self.subscribers.read().await;
            let mut idle_since = self.idle_since.write().await;
            for document_id in &engine_ids {
                let empty = subs.get(document_id).map_or(true, |s| s.is_empty());
                if empty {
                    let since = *idle_since.entry(document_id.clone()).or_insert(now);
                    if now.duration_since(since) >= self.idle_eviction {
                        to_evict.push(document_id.clone());
                    }
                } else {
                    idle_since.remove(document_id);
                }
            }
        }

        for document_id in to_evict {
            let handle = self.engines.write().await.remove(&document_id);
            if let Some(handle) = handle {
                let _ = handle.force_flush().await;
                self.idle_since.write().await.remove(&document_id);
                log::info!("evicted idle engine for document {document_id}");
            }
        }
    }

    /// Force-flush every live engine, bounded by `deadline`. Returns
    /// `false` if the deadline was exceeded (callers should exit
    /// non-zero in that case).
    pub async fn shutdown_drain(&self, deadline: Duration) -> bool {
        let handles: Vec<EngineHandle> = self.engines.read().await.values().cloned().collect();
        let flush_all = async {
            for handle in handles {
                let _ = handle.force_flush().await;
            }
        };
        tokio::time::timeout(deadline, flush_all).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hub() -> (Arc<Hub>, temp_dir::TempDir) {
        let dir = temp_dir::TempDir::new().unwrap();
        let store = DocumentStore::new(dir.path().to_path_buf());
        (Hub::new(store, EngineConfig::default(), Duration::from_secs(1800)), dir)
    }

    #[tokio::test]
    async fn join_delivers_document_state_directly() {
        let (hub, _dir) = hub();
        let (sink, mut rx) = mpsc::unbounded_channel();
        hub.join(
            "s1".into(),
            "doc-1".into(),
            JoinRequest { user_id: "u1".into(), display_name: "Alice".into() },
            sink,
        )
        .await
        .unwrap();

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, OutboundMessage::DocumentState { .. }));
    }

    #[tokio::test]
    async fn second_session_sees_first_users_joined_broadcast() {
        let (hub, _dir) = hub();
        let (sink1, mut rx1) = mpsc::unbounded_channel();
        hub.join("s1".into(), "doc-1".into(), JoinRequest { user_id: "u1".into(), display_name: "A".into() }, sink1)
            .await
            .unwrap();
        let _ = rx1.recv().await; // document-state

        let (sink2, _rx2) = mpsc::unbounded_channel();
        hub.join("s2".into(), "doc-1".into(), JoinRequest { user_id: "u2".into(), display_name: "B".into() }, sink2)
            .await
            .unwrap();

        let next = rx1.recv().await.unwrap();
        assert!(matches!(next, OutboundMessage::UserJoined { .. }));
    }

    #[tokio::test]
    async fn joining_session_always_sees_document_state_first() {
        let (hub, _dir) = hub();
        let (sink1, mut rx1) = mpsc::unbounded_channel();
        hub.join("s1".into(), "doc-1".into(), JoinRequest { user_id: "u1".into(), display_name: "A".into() }, sink1)
            .await
            .unwrap();
        let _ = rx1.recv().await; // document-state

        // Fire off activity on doc-1 concurrently with a second join, so the
        // dispatcher has an emission in flight while s2 is being registered.
        let op = Op {
            kind: crate::ot::OpKind::Insert,
            position: 0,
            content: Some("x".into()),
            length: None,
            user_id: "u1".into(),
            client_id: "c1".into(),
            timestamp: 1,
            id: "id1".into(),
            version: None,
            applied: false,
        };
        hub.enqueue("s1", op).await.unwrap();

        let (sink2, mut rx2) = mpsc::unbounded_channel();
        hub.join("s2".into(), "doc-1".into(), JoinRequest { user_id: "u2".into(), display_name: "B".into() }, sink2)
            .await
            .unwrap();

        let first = rx2.recv().await.unwrap();
        assert!(matches!(first, OutboundMessage::DocumentState { .. }));
    }

    #[tokio::test]
    async fn disconnect_removes_from_both_indices() {
        let (hub, _dir) = hub();
        let (sink, _rx) = mpsc::unbounded_channel();
        hub.join("s1".into(), "doc-1".into(), JoinRequest { user_id: "u1".into(), display_name: "A".into() }, sink)
            .await
            .unwrap();
        hub.disconnect("s1").await;
        assert!(hub.sessions.read().await.get("s1").is_none());
        assert!(hub.subscribers.read().await.get("doc-1").map_or(true, |s| s.is_empty()));
    }

    #[tokio::test]
    async fn enqueue_on_unknown_session_errors() {
        let (hub, _dir) = hub();
        let op = Op {
            kind: crate::ot::OpKind::Insert,
            position: 0,
            content: Some("x".into()),
            length: None,
            user_id: "u1".into(),
            client_id: "c1".into(),
            timestamp: 1,
            id: "id1".into(),
            version: None,
            applied: false,
        };
        let err = hub.enqueue("ghost", op).await.unwrap_err();
        assert!(matches!(err, HubError::UnknownSession(_)));
    }
}
