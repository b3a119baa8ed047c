//! The axum websocket upgrade handler: one task pair (forwarder + receive
//! loop) per connected session. The adapter owns both halves of the
//! socket and is the only thing that ever writes to it — the Hub only
//! ever sends into a session's `mpsc` sink.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::document::Cursor;
use crate::engine::JoinRequest;
use crate::hub::Hub;
use crate::ot::Op;

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
}

/// Inbound client frames, tagged exactly per the wire protocol.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum ClientMessage {
    JoinDocument { document_id: String },
    Operation { document_id: String, operation: Op },
    CursorUpdate { document_id: String, cursor: Cursor },
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(document_id): Path<String>,
    Query(query): Query<ConnectQuery>,
    State(hub): State<Arc<Hub>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, document_id, query, hub))
}

async fn handle_socket(socket: WebSocket, document_id: String, query: ConnectQuery, hub: Arc<Hub>) {
    let session_id = Uuid::new_v4().to_string();
    let user_id = query.user_id.unwrap_or_else(|| session_id.clone());
    let display_name = query.display_name.unwrap_or_else(|| user_id.clone());

    let (mut outbound_sink, mut inbound_stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel();

    if let Err(err) = hub
        .join(session_id.clone(), document_id.clone(), JoinRequest { user_id, display_name }, tx)
        .await
    {
        log::warn!("join failed for session {session_id}: {err}");
        let _ = outbound_sink.close().await;
        return;
    }

    let forwarder = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let Ok(text) = serde_json::to_string(&message) else { continue };
            if outbound_sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = inbound_stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                log::warn!("session {session_id} socket error: {err}");
                break;
            }
        };
        let text = match frame {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        handle_client_message(&hub, &session_id, &document_id, &text).await;
    }

    hub.disconnect(&session_id).await;
    forwarder.abort();
}

async fn handle_client_message(hub: &Arc<Hub>, session_id: &str, document_id: &str, text: &str) {
    let parsed: Result<ClientMessage, _> = serde_json::from_str(text);
    let message = match parsed {
        Ok(message) => message,
        Err(err) => {
            hub.send_error(session_id, format!("malformed message: {err}")).await;
            return;
        }
    };

    match message {
        ClientMessage::JoinDocument { document_id: requested } => {
            if requested != document_id {
                hub.send_error(session_id, "join-document targets a different document than the socket's"
                    .to_string())
                    .await;
            }
        }
        ClientMessage::Operation { operation, .. } => {
            if let Err(err) = hub.enqueue(session_id, operation).await {
                hub.send_error(session_id, err.to_string()).await;
            }
        }
        ClientMessage::CursorUpdate { cursor, .. } => {
            if let Err(err) = hub.cursor(session_id, cursor).await {
                hub.send_error(session_id, err.to_string()).await;
            }
        }
    }
}
