//! Voice WebSocket endpoint.

use crate::registry::SessionLease;
use crate::session::{client_link, spawn_session, ClientFeed};
use crate::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, Extension, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parley_types::{encode_audio_frame, ClientControl, OutboundFrame, BYTES_PER_SAMPLE};
use std::{net::SocketAddr, sync::Arc};

/// Largest client frame accepted (1 MiB, about 30 s of 16 kHz PCM).
const MAX_CLIENT_FRAME_BYTES: usize = 1024 * 1024;

/// Admits or rejects the connection before the upgrade completes.
///
/// A disallowed origin gets `403`; a full server or one shutting down gets
/// `503`. No session exists for a rejected connection.
pub async fn ws_handler(
    Extension(state): Extension<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let lease = match state.admission.admit(&headers, &state.registry) {
        Ok(lease) => lease,
        Err(e) => {
            tracing::warn!(
                remote_addr = %addr,
                status = %e.status(),
                "voice connection rejected: {}",
                e
            );
            return e.into_response();
        }
    };

    tracing::info!(
        remote_addr = %addr,
        session_id = %lease.id(),
        sessions = state.registry.len(),
        "voice connection admitted"
    );
    ws.max_message_size(MAX_CLIENT_FRAME_BYTES)
        .on_upgrade(move |socket| handle_socket(socket, state, lease, addr))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, lease: SessionLease, addr: SocketAddr) {
    let (sender, mut receiver) = socket.split();
    let (link, feed) = client_link(state.config.session.outbound_buffer);
    let session = spawn_session(
        lease.id().to_string(),
        state.providers.clone(),
        state.settings.clone(),
        link,
        lease.token(),
    );
    let mut writer = tokio::spawn(write_frames(sender, feed));
    let mut writer_finished = false;

    loop {
        tokio::select! {
            message = receiver.next() => match message {
                Some(Ok(Message::Binary(pcm))) => {
                    if pcm.len() % BYTES_PER_SAMPLE != 0 {
                        tracing::warn!(
                            session_id = %session.id(),
                            bytes = pcm.len(),
                            "ignoring audio frame with a partial sample"
                        );
                        continue;
                    }
                    session.send_audio(pcm.to_vec());
                }
                Some(Ok(Message::Text(text))) => match ClientControl::parse(&text) {
                    Some(control) => session.send_control(control).await,
                    None => tracing::warn!(
                        session_id = %session.id(),
                        "ignoring malformed control frame"
                    ),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(session_id = %session.id(), "websocket receive error: {}", e);
                    break;
                }
            },
            _ = &mut writer => {
                writer_finished = true;
                break;
            }
        }
    }

    let session_id = session.id().to_string();
    session.close().await;
    if !writer_finished {
        writer.abort();
    }
    drop(lease);
    tracing::info!(session_id = %session_id, remote_addr = %addr, "voice connection closed");
}

/// Writes session output to the socket until the session ends or the
/// client goes away.
async fn write_frames(mut sender: SplitSink<WebSocket, Message>, mut feed: ClientFeed) {
    while let Some(frame) = feed.next().await {
        let message = match frame {
            OutboundFrame::Event(event) => match serde_json::to_string(&event) {
                Ok(json) => Message::Text(json.into()),
                Err(e) => {
                    tracing::warn!("failed to serialize server event: {}", e);
                    continue;
                }
            },
            OutboundFrame::Audio { pcm, .. } => Message::Binary(encode_audio_frame(&pcm).into()),
        };
        if sender.send(message).await.is_err() {
            return;
        }
    }
    let _ = sender.send(Message::Close(None)).await;
}
