//! Realtime `WebSocket` endpoint.
//!
//! Each socket gets a registry entry, a write task draining its outbound
//! queue and a read loop handling subscription frames. Whichever side ends
//! first disconnects the entry, which cancels the other. The writer flushes
//! what is already queued before honouring cancellation, so a close frame
//! queued during shutdown still goes out.

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::Extension;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use rulebase_core::AuthContext;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::AppState;
use crate::realtime::{
    ConnectMessage, ConnectionHandle, ErrorMessage, OutboundMessage, SendError,
    SubscribedMessage, SubscriptionsMessage, Topic, TopicError,
};

/// Upgrades to a realtime socket. The `Authorization` header of the
/// upgrade request becomes the initial connection identity.
pub async fn realtime_handler(
    State(state): State<AppState>,
    Extension(auth): Extension<Arc<AuthContext>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let config = &state.config.connection;
    ws.write_buffer_size(config.ws_write_buffer_size)
        .max_write_buffer_size(config.ws_max_write_buffer_size)
        .on_upgrade(move |socket| handle_socket(socket, state, auth))
}

async fn handle_socket(socket: WebSocket, state: AppState, auth: Arc<AuthContext>) {
    let registry = Arc::clone(&state.app.registry);
    let (handle, rx) = registry.register(auth, &state.config.connection);
    info!(connection = %handle.id, client = %handle.client_id, "realtime client connected");

    let (sink, mut stream) = socket.split();
    let writer = tokio::spawn(write_loop(sink, rx, handle.cancel.clone()));

    reply(
        &state,
        &handle,
        &ConnectMessage {
            client_id: handle.client_id.clone(),
        },
    );

    loop {
        tokio::select! {
            () = handle.cancel.cancelled() => break,
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => handle_control(&state, &handle, text.as_str()).await,
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    registry.disconnect(handle.id);
    if writer.await.is_err() {
        warn!(connection = %handle.id, "realtime writer task panicked");
    }
    info!(connection = %handle.id, "realtime client disconnected");
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<OutboundMessage>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            msg = rx.recv() => match msg {
                Some(OutboundMessage::Text(text)) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Some(OutboundMessage::Close(reason)) => {
                    let frame = CloseFrame {
                        code: close_code::AWAY,
                        reason: reason.unwrap_or_default().into(),
                    };
                    // The peer may already be gone.
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    break;
                }
                None => break,
            },
            () = cancel.cancelled() => break,
        }
    }
    let _ = sink.close().await;
}

/// Applies a `{ subscriptions, authorization? }` frame.
///
/// The identity is refreshed before the topic set is swapped, so events
/// dispatched after the swap see the new identity.
async fn handle_control(state: &AppState, handle: &ConnectionHandle, text: &str) {
    let message: SubscriptionsMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(err) => {
            debug!(connection = %handle.id, error = %err, "malformed realtime frame");
            reply(state, handle, &ErrorMessage {
                error: format!("invalid message: {err}"),
            });
            return;
        }
    };

    let limit = state.config.connection.max_topics;
    if message.subscriptions.len() > limit {
        debug!(
            connection = %handle.id,
            requested = message.subscriptions.len(),
            limit,
            "too many realtime topics"
        );
        reply(state, handle, &ErrorMessage {
            error: format!("at most {limit} subscriptions are allowed"),
        });
        return;
    }

    let topics = match message
        .subscriptions
        .iter()
        .map(|s| s.parse::<Topic>())
        .collect::<Result<BTreeSet<_>, TopicError>>()
    {
        Ok(topics) => topics,
        Err(err) => {
            reply(state, handle, &ErrorMessage {
                error: err.to_string(),
            });
            return;
        }
    };

    let registry = &state.app.registry;
    if let Some(raw) = message.authorization.as_deref() {
        let auth = state.app.auth.resolve(Some(raw)).await;
        debug!(connection = %handle.id, kind = ?auth.kind(), "realtime identity refreshed");
        registry.set_auth(handle.id, Arc::new(auth));
    }

    let Some(diff) = registry.replace(handle.id, topics) else {
        return;
    };
    debug!(
        connection = %handle.id,
        added = diff.added.len(),
        removed = diff.removed.len(),
        "subscriptions replaced"
    );

    let subscriptions = registry
        .topics_for(handle.id)
        .iter()
        .map(ToString::to_string)
        .collect();
    reply(state, handle, &SubscribedMessage { subscriptions });
}

/// Queues a control reply; a full queue disconnects like any other send.
fn reply<T: Serialize>(state: &AppState, handle: &ConnectionHandle, message: &T) {
    let text = match serde_json::to_string(message) {
        Ok(text) => text,
        Err(err) => {
            warn!(connection = %handle.id, error = %err, "failed to encode realtime reply");
            return;
        }
    };
    match handle.try_send(OutboundMessage::Text(text)) {
        Ok(()) => {}
        Err(SendError::Full) => {
            warn!(connection = %handle.id, "outbound queue full, disconnecting client");
            state.app.registry.disconnect(handle.id);
        }
        Err(SendError::Disconnected) => {
            state.app.registry.disconnect(handle.id);
        }
    }
}
