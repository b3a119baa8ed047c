//! The per-document serialized actor: one `tokio::spawn`ed task per
//! active document id, reached only through its [`EngineHandle`].
//!
//! All engine state (`content`, `operations_tail`, `queue`, presence) is
//! owned exclusively by the task running [`run`] — this is what gives
//! the admit/echo/enqueue/flush pipeline its serialization guarantee
//! without an explicit lock.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::document::{assign_color, Cursor, Document, DocumentMetadata, DocumentSnapshot, DocumentStats, Presence};
use crate::ot::{self, Op};
use crate::store::DocumentStore;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("engine task is no longer running")]
    Unavailable,
    #[error("engine fatal: {0}")]
    Fatal(String),
}

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub debounce_delay: Duration,
    pub tail_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { debounce_delay: Duration::from_millis(500), tail_size: 10 }
    }
}

#[derive(Debug, Clone)]
pub struct JoinRequest {
    pub user_id: String,
    pub display_name: String,
}

#[derive(Debug, Clone)]
pub struct JoinResult {
    pub snapshot: DocumentSnapshot,
    pub active_users: Vec<Presence>,
}

/// Every event an engine can emit, tagged exactly per the wire protocol.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EngineEvent {
    OperationImmediate { operation: Op, temp_content: String, user: Presence },
    DocumentSync { content: String, version: u64, operations: Vec<Op>, metadata: DocumentMetadata },
    UserJoined { user: Presence, socket_id: String },
    UserLeft { user: Presence, socket_id: String },
    UsersUpdated { active_users: Vec<Presence> },
    CursorUpdate { user: Presence, cursor: Cursor, timestamp: chrono::DateTime<Utc> },
    Error { message: String },
    Fatal { message: String },
}

/// One outbound event plus its routing instructions, handed to the Hub's
/// dispatcher over a shared channel the engine never inspects further.
#[derive(Debug, Clone)]
pub struct EngineEmission {
    pub document_id: String,
    pub event: EngineEvent,
    /// Session to skip during fan-out (only set for `operation-immediate`
    /// and `cursor-update`, which exclude their own originator).
    pub exclude_session: Option<String>,
}

enum EngineCommand {
    Join { session_id: String, user: JoinRequest, reply: oneshot::Sender<JoinResult> },
    Leave { session_id: String, reply: oneshot::Sender<()> },
    Enqueue { session_id: String, op: Op, reply: oneshot::Sender<Result<(), EngineError>> },
    Cursor { session_id: String, cursor: Cursor, reply: oneshot::Sender<Result<(), EngineError>> },
    Snapshot { reply: oneshot::Sender<DocumentSnapshot> },
    Stats { reply: oneshot::Sender<DocumentStats> },
    ForceFlush { reply: oneshot::Sender<()> },
}

/// Cheap, cloneable front for a running engine task.
#[derive(Clone)]
pub struct EngineHandle {
    document_id: String,
    sender: mpsc::UnboundedSender<EngineCommand>,
}

impl EngineHandle {
    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub async fn join(&self, session_id: String, user: JoinRequest) -> Result<JoinResult, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(EngineCommand::Join { session_id, user, reply })
            .map_err(|_| EngineError::Unavailable)?;
        rx.await.map_err(|_| EngineError::Unavailable)
    }

    pub async fn leave(&self, session_id: String) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(EngineCommand::Leave { session_id, reply })
            .map_err(|_| EngineError::Unavailable)?;
        rx.await.map_err(|_| EngineError::Unavailable)
    }

    pub async fn enqueue(&self, session_id: String, op: Op) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(EngineCommand::Enqueue { session_id, op, reply })
            .map_err(|_| EngineError::Unavailable)?;
        rx.await.map_err(|_| EngineError::Unavailable)?
    }

    pub async fn cursor(&self, session_id: String, cursor: Cursor) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(EngineCommand::Cursor { session_id, cursor, reply })
            .map_err(|_| EngineError::Unavailable)?;
        rx.await.map_err(|_| EngineError::Unavailable)?
    }

    pub async fn snapshot(&self) -> Result<DocumentSnapshot, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(EngineCommand::Snapshot { reply })
            .map_err(|_| EngineError::Unavailable)?;
        rx.await.map_err(|_| EngineError::Unavailable)
    }

    pub async fn stats(&self) -> Result<DocumentStats, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(EngineCommand::Stats { reply })
            .map_err(|_| EngineError::Unavailable)?;
        rx.await.map_err(|_| EngineError::Unavailable)
    }

    pub async fn force_flush(&self) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(EngineCommand::ForceFlush { reply })
            .map_err(|_| EngineError::Unavailable)?;
        rx.await.map_err(|_| EngineError::Unavailable)
    }
}

/// Spawn a new engine task for `document_id`, loading its snapshot (or
/// creating a fresh record) from `store`. Returns immediately; loading
/// happens inside the spawned task so a slow disk never blocks the Hub.
pub fn spawn(
    document_id: String,
    store: DocumentStore,
    emit: mpsc::UnboundedSender<EngineEmission>,
    config: EngineConfig,
) -> EngineHandle {
    let (sender, commands_rx) = mpsc::unbounded_channel();
    let handle = EngineHandle { document_id: document_id.clone(), sender };
    tokio::spawn(run(document_id, store, emit, config, commands_rx));
    handle
}

async fn run(
    document_id: String,
    store: DocumentStore,
    emit: mpsc::UnboundedSender<EngineEmission>,
    config: EngineConfig,
    mut commands_rx: mpsc::UnboundedReceiver<EngineCommand>,
) {
    let doc = match store.load(&document_id).await {
        Ok(Some(doc)) => doc,
        Ok(None) => {
            let doc = Document::new(document_id.clone(), "Untitled", None);
            if let Err(err) = store.save(&doc).await {
                log::error!("engine {document_id}: failed to persist new document: {err}");
            }
            doc
        }
        Err(err) => {
            log::error!("engine {document_id}: load failed, starting empty: {err}");
            Document::new(document_id.clone(), "Untitled", None)
        }
    };

    let mut state = EngineState {
        document_id,
        store,
        doc,
        sessions: HashMap::new(),
        queue: Vec::new(),
        debounce_deadline: None,
        emit,
        config,
    };

    loop {
        let deadline = state.debounce_deadline;
        let timer = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => futures::future::pending::<()>().await,
            }
        };

        tokio::select! {
            maybe_cmd = commands_rx.recv() => {
                match maybe_cmd {
                    Some(cmd) => state.handle(cmd).await,
                    None => {
                        state.flush().await;
                        break;
                    }
                }
            }
            _ = timer => {
                state.flush().await;
            }
        }
    }
}

struct EngineState {
    document_id: String,
    store: DocumentStore,
    doc: Document,
    sessions: HashMap<String, Presence>,
    queue: Vec<Op>,
    debounce_deadline: Option<Instant>,
    emit: mpsc::UnboundedSender<EngineEmission>,
    config: EngineConfig,
}

impl EngineState {
    fn emit(&self, event: EngineEvent, exclude_session: Option<String>) {
        let _ = self.emit.send(EngineEmission {
            document_id: self.document_id.clone(),
            event,
            exclude_session,
        });
    }

    fn active_users(&self) -> Vec<Presence> {
        self.sessions.values().cloned().collect()
    }

    async fn handle(&mut self, cmd: EngineCommand) {
        match cmd {
            EngineCommand::Join { session_id, user, reply } => {
                let result = self.handle_join(session_id, user);
                let _ = reply.send(result);
            }
            EngineCommand::Leave { session_id, reply } => {
                self.handle_leave(session_id).await;
                let _ = reply.send(());
            }
            EngineCommand::Enqueue { session_id, op, reply } => {
                let result = self.handle_enqueue(&session_id, op);
                let _ = reply.send(result);
            }
            EngineCommand::Cursor { session_id, cursor, reply } => {
                let result = self.handle_cursor(&session_id, cursor);
                let _ = reply.send(result);
            }
            EngineCommand::Snapshot { reply } => {
                let _ = reply.send(self.doc.snapshot());
            }
            EngineCommand::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            EngineCommand::ForceFlush { reply } => {
                self.flush().await;
                let _ = reply.send(());
            }
        }
    }

    fn handle_join(&mut self, session_id: String, user: JoinRequest) -> JoinResult {
        self.doc.metadata.last_accessed_at = Utc::now();
        self.doc.metadata.last_accessed_by = Some(user.user_id.clone());

        let presence = Presence {
            color: assign_color(&user.user_id),
            user_id: user.user_id,
            display_name: user.display_name,
            avatar: None,
            joined_at: Utc::now(),
            cursor: None,
            last_cursor_update: None,
        };
        self.sessions.insert(session_id.clone(), presence.clone());

        self.emit(EngineEvent::UserJoined { user: presence, socket_id: session_id }, None);
        self.emit(EngineEvent::UsersUpdated { active_users: self.active_users() }, None);

        JoinResult { snapshot: self.doc.snapshot(), active_users: self.active_users() }
    }

    async fn handle_leave(&mut self, session_id: String) {
        if !self.queue.is_empty() {
            self.flush().await;
        }
        if let Some(presence) = self.sessions.remove(&session_id) {
            self.emit(EngineEvent::UserLeft { user: presence, socket_id: session_id }, None);
            self.emit(EngineEvent::UsersUpdated { active_users: self.active_users() }, None);
        }
    }

    fn handle_enqueue(&mut self, session_id: &str, op: Op) -> Result<(), EngineError> {
        op.validate(self.doc.content.len())
            .map_err(|e| EngineError::InvalidOperation(e.to_string()))?;
        op.check_char_boundaries(&self.doc.content)
            .map_err(|e| EngineError::InvalidOperation(e.to_string()))?;

        if let Some(transformed) = ot::transform_against_sequence(&op, &self.doc.operations_tail) {
            let temp_content = ot::apply(&self.doc.content, &transformed);
            let user = self.sessions.get(session_id).cloned().unwrap_or_else(|| Presence {
                user_id: op.user_id.clone(),
                display_name: op.user_id.clone(),
                color: assign_color(&op.user_id),
                avatar: None,
                joined_at: Utc::now(),
                cursor: None,
                last_cursor_update: None,
            });
            self.emit(
                EngineEvent::OperationImmediate { operation: transformed, temp_content, user },
                Some(session_id.to_string()),
            );
        }

        self.queue.push(op);
        self.debounce_deadline = Some(Instant::now() + self.config.debounce_delay);
        Ok(())
    }

    fn handle_cursor(&mut self, session_id: &str, cursor: Cursor) -> Result<(), EngineError> {
        let presence = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| EngineError::InvalidOperation("unknown session".to_string()))?;
        presence.cursor = Some(cursor);
        let now = Utc::now();
        presence.last_cursor_update = Some(now);
        let user = presence.clone();
        self.emit(
            EngineEvent::CursorUpdate { user, cursor, timestamp: now },
            Some(session_id.to_string()),
        );
        Ok(())
    }

    fn stats(&self) -> DocumentStats {
        DocumentStats {
            id: self.doc.id.clone(),
            version: self.doc.version,
            active_user_count: self.sessions.len(),
            tail_length: self.doc.operations_tail.len(),
            queued_count: self.queue.len(),
            metadata: self.doc.metadata.clone(),
            updated_at: self.doc.metadata.updated_at,
        }
    }

    /// Step 4 of the pipeline: group, merge, sort, transform, apply,
    /// commit, persist, emit. Any operation that fails a final
    /// char-boundary safety check aborts the whole batch (the queue,
    /// already drained into a local, is simply discarded) and the
    /// engine emits a fatal diagnostic but keeps running.
    async fn flush(&mut self) {
        self.debounce_deadline = None;
        if self.queue.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.queue);

        match self.try_apply_batch(batch) {
            Ok(Some((text, applied))) => self.commit(text, applied).await,
            Ok(None) => {}
            Err(err) => {
                log::error!("engine {}: flush aborted: {err}", self.document_id);
                self.emit(EngineEvent::Fatal { message: err.to_string() }, None);
            }
        }
    }

    fn try_apply_batch(&self, batch: Vec<Op>) -> Result<Option<(String, Vec<Op>)>, EngineError> {
        let mut by_user: HashMap<String, Vec<Op>> = HashMap::new();
        for op in batch {
            by_user.entry(op.user_id.clone()).or_default().push(op);
        }
        let mut merged: Vec<Op> = by_user.into_values().flat_map(|ops| ot::merge(&ops)).collect();
        merged.sort_by(|a, b| (a.timestamp, a.user_id.clone()).cmp(&(b.timestamp, b.user_id.clone())));

        let mut applied: Vec<Op> = Vec::new();
        let mut text = self.doc.content.clone();
        for op in merged {
            let Some(mut transformed) = ot::transform_against_sequence(&op, &applied) else {
                continue;
            };
            transformed
                .check_char_boundaries(&text)
                .map_err(|e| EngineError::Fatal(e.to_string()))?;
            text = ot::apply(&text, &transformed);
            transformed.applied = true;
            applied.push(transformed);
        }

        if applied.is_empty() {
            Ok(None)
        } else {
            Ok(Some((text, applied)))
        }
    }

    async fn commit(&mut self, text: String, applied: Vec<Op>) {
        self.doc.content = text;
        self.doc.operations_tail.extend(applied.iter().cloned());
        let tail_len = self.doc.operations_tail.len();
        if tail_len > self.config.tail_size {
            let excess = tail_len - self.config.tail_size;
            self.doc.operations_tail.drain(0..excess);
        }
        self.doc.version += 1;
        self.doc.recount();
        self.doc.metadata.updated_at = Utc::now();
        if let Some(last) = applied.last() {
            self.doc.metadata.last_modified_by = Some(last.user_id.clone());
        }

        if let Err(err) = self.store.save(&self.doc).await {
            log::error!("engine {}: store save failed, retaining in-memory state: {err}", self.document_id);
        }

        self.emit(
            EngineEvent::DocumentSync {
                content: self.doc.content.clone(),
                version: self.doc.version,
                operations: applied,
                metadata: self.doc.metadata.clone(),
            },
            None,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ot::OpKind;
    use pretty_assertions::assert_eq;

    fn op(kind: OpKind, position: usize, content: Option<&str>, length: Option<usize>, user: &str, ts: i64) -> Op {
        Op {
            kind,
            position,
            content: content.map(String::from),
            length,
            user_id: user.to_string(),
            client_id: format!("{user}-client"),
            timestamp: ts,
            id: format!("{user}-{ts}-{position}"),
            version: None,
            applied: false,
        }
    }

    async fn test_engine() -> (EngineHandle, temp_dir::TempDir, mpsc::UnboundedReceiver<EngineEmission>) {
        let dir = temp_dir::TempDir::new().unwrap();
        let store = DocumentStore::new(dir.path().to_path_buf());
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = spawn("doc-1".to_string(), store, tx, EngineConfig::default());
        (handle, dir, rx)
    }

    #[tokio::test]
    async fn join_returns_snapshot_and_active_users() {
        let (engine, _dir, _rx) = test_engine().await;
        let result = engine
            .join("s1".into(), JoinRequest { user_id: "u1".into(), display_name: "Alice".into() })
            .await
            .unwrap();
        assert_eq!(result.snapshot.content, "");
        assert_eq!(result.active_users.len(), 1);
    }

    #[tokio::test]
    async fn scenario_a_concurrent_inserts_same_position() {
        let (engine, _dir, _rx) = test_engine().await;
        engine.join("s1".into(), JoinRequest { user_id: "u1".into(), display_name: "U1".into() }).await.unwrap();
        engine.join("s2".into(), JoinRequest { user_id: "u2".into(), display_name: "U2".into() }).await.unwrap();

        engine.enqueue("s1".into(), op(OpKind::Insert, 0, Some("HELLO"), None, "u1", 1)).await.unwrap();
        engine.force_flush().await.unwrap();

        engine.enqueue("s1".into(), op(OpKind::Insert, 5, Some("X"), None, "u1", 100)).await.unwrap();
        engine.enqueue("s2".into(), op(OpKind::Insert, 5, Some("Y"), None, "u2", 101)).await.unwrap();
        engine.force_flush().await.unwrap();

        let snapshot = engine.snapshot().await.unwrap();
        assert_eq!(snapshot.content, "HELLOXY");
        assert_eq!(snapshot.version, 2);
    }

    #[tokio::test]
    async fn scenario_d_debounce_coalesces_into_one_version_bump() {
        let (engine, _dir, _rx) = test_engine().await;
        engine.join("s1".into(), JoinRequest { user_id: "u1".into(), display_name: "U1".into() }).await.unwrap();

        for (i, ch) in "abcde".chars().enumerate() {
            engine
                .enqueue("s1".into(), op(OpKind::Insert, i, Some(&ch.to_string()), None, "u1", i as i64))
                .await
                .unwrap();
        }
        engine.force_flush().await.unwrap();

        let snapshot = engine.snapshot().await.unwrap();
        assert_eq!(snapshot.content, "abcde");
        assert_eq!(snapshot.version, 1);
    }

    #[tokio::test]
    async fn invalid_operation_is_rejected_without_state_change() {
        let (engine, _dir, _rx) = test_engine().await;
        engine.join("s1".into(), JoinRequest { user_id: "u1".into(), display_name: "U1".into() }).await.unwrap();
        let bad = op(OpKind::Delete, 0, None, Some(5), "u1", 1);
        let err = engine.enqueue("s1".into(), bad).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidOperation(_)));
        let snapshot = engine.snapshot().await.unwrap();
        assert_eq!(snapshot.content, "");
    }

    #[tokio::test]
    async fn leave_forces_flush_before_detach() {
        let (engine, _dir, mut rx) = test_engine().await;
        engine.join("s1".into(), JoinRequest { user_id: "u1".into(), display_name: "U1".into() }).await.unwrap();
        // Drain the join-time UserJoined/UsersUpdated pair before asserting ordering.
        let _ = rx.recv().await;
        let _ = rx.recv().await;

        engine.enqueue("s1".into(), op(OpKind::Insert, 0, Some("hi"), None, "u1", 1)).await.unwrap();
        let _ = rx.recv().await; // operation-immediate (no other session to exclude it, but still emitted)

        engine.leave("s1".into()).await.unwrap();

        let sync = rx.recv().await.unwrap();
        assert!(matches!(sync.event, EngineEvent::DocumentSync { .. }));
        let left = rx.recv().await.unwrap();
        assert!(matches!(left.event, EngineEvent::UserLeft { .. }));

        let snapshot = engine.snapshot().await.unwrap();
        assert_eq!(snapshot.content, "hi");
        assert_eq!(snapshot.version, 1);
    }

    #[tokio::test]
    async fn stats_reflect_live_counters() {
        let (engine, _dir, _rx) = test_engine().await;
        engine.join("s1".into(), JoinRequest { user_id: "u1".into(), display_name: "U1".into() }).await.unwrap();
        engine.enqueue("s1".into(), op(OpKind::Insert, 0, Some("hi"), None, "u1", 1)).await.unwrap();
        let stats = engine.stats().await.unwrap();
        assert_eq!(stats.active_user_count, 1);
        assert_eq!(stats.queued_count, 1);
    }
}
