//! `GET /websocket/chat`: the chat room over `WebSocket`.
//!
//! Each socket gets an inbound read loop (this task) and an outbound write
//! loop draining the connection's channel. Either side ending tears the
//! connection down and announces the departure.

use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::AppState;
use crate::network::{ConnectionId, OutboundMessage};

/// Upgrades to a chat `WebSocket`, or answers 503 once shutdown has begun.
pub async fn chat_upgrade_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    if state.shutdown.is_shutting_down() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    ws.on_upgrade(move |socket| handle_chat_socket(socket, state))
}

async fn handle_chat_socket(socket: WebSocket, state: AppState) {
    let (handle, rx) = state.connections.register(&state.config.connection);
    let room = state.services.chat().clone();
    let nickname = room.join(&handle);
    info!(connection = %handle.id, %nickname, "chat participant joined");

    let (sink, mut stream) = socket.split();
    let mut writer = tokio::spawn(write_loop(sink, rx));
    let mut shutdown = state.shutdown.shutdown_receiver();
    let idle_timeout = state.config.connection.idle_timeout;

    loop {
        tokio::select! {
            frame = tokio::time::timeout(idle_timeout, stream.next()) => {
                match frame {
                    Err(_) => {
                        debug!(connection = %handle.id, "idle timeout");
                        let _ = handle.try_send(OutboundMessage::Close(Some("idle timeout".to_string())));
                        break;
                    }
                    Ok(frame) => match inbound(handle.id, frame) {
                        Inbound::Post(text) => room.post(&nickname, Arc::clone(&handle), text),
                        Inbound::Ignore => {}
                        Inbound::End => break,
                    },
                }
            }
            _ = shutdown.wait_for(|stopping| *stopping) => {
                let _ = handle.try_send(OutboundMessage::Close(Some("server shutting down".to_string())));
                break;
            }
            _ = &mut writer => {
                debug!(connection = %handle.id, "write loop ended");
                break;
            }
        }
    }

    state.connections.remove(handle.id);
    room.leave(&nickname);
    info!(connection = %handle.id, %nickname, "chat participant left");
    drop(handle);
    if !writer.is_finished() {
        let _ = tokio::time::timeout(std::time::Duration::from_secs(1), &mut writer).await;
        writer.abort();
    }
}

/// What the read loop does with one inbound frame.
#[derive(Debug, PartialEq, Eq)]
enum Inbound {
    Post(String),
    Ignore,
    End,
}

fn inbound(connection: ConnectionId, frame: Option<Result<Message, axum::Error>>) -> Inbound {
    match frame {
        Some(Ok(Message::Text(text))) => Inbound::Post(text.as_str().to_owned()),
        Some(Ok(Message::Close(_))) | None => Inbound::End,
        Some(Err(err)) => {
            warn!(connection = %connection, error = %err, "chat socket read failed");
            Inbound::End
        }
        Some(Ok(_)) => Inbound::Ignore,
    }
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<OutboundMessage>,
) {
    while let Some(message) = rx.recv().await {
        let frame = match message {
            OutboundMessage::Text(text) => Message::Text(text.into()),
            OutboundMessage::Ping(payload) => Message::Ping(payload.into()),
            OutboundMessage::Close(reason) => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code: close_code::AWAY,
                        reason: reason.unwrap_or_default().into(),
                    })))
                    .await;
                break;
            }
        };
        if sink.send(frame).await.is_err() {
            break;
        }
    }
}
