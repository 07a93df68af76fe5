//! WebSocket ingress.
//!
//! The push channel runs on its own listener port. A connection
//! authenticates during the handshake with a `token` query parameter, gets
//! registered (superseding any prior connection of the same player), and is
//! then driven by two tasks: this handler's read loop and a writer task that
//! pumps the outbound channel into the socket with a bounded timeout per
//! write.
//!
//! Disconnects happen from two places, both gated on the connection's own
//! id and therefore safe to race: the read loop calls
//! `disconnect(player_id, my_connection_id)` when the connection ends, and
//! the writer task calls it when a send fails or exceeds its timeout. The
//! registry's gating makes the second call a no-op. Message-handling
//! routines never disconnect; they report errors to the client and return.

use crate::api::AppState;
use crate::game::Intent;
use crate::registry::{Sink, SubscriptionRegistry};
use crate::store::{Player, Store};
use chrono::Utc;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde_json::Value;
use shared::{ClientMessage, ServerMessage};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use uuid::Uuid;

/// Accept connections until shutdown is signalled.
pub async fn run_listener(
    listener: TcpListener,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) {
    if let Ok(addr) = listener.local_addr() {
        info!("websocket listener on {addr}");
    }

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let state = state.clone();
                    tokio::spawn(async move {
                        handle_socket(stream, addr, state).await;
                    });
                }
                Err(err) => {
                    error!("websocket accept failed: {err}");
                }
            }
        }
    }
}

/// Extract the `token` query parameter from a request URI.
fn token_from_query(uri: &str) -> Option<String> {
    let (_, query) = uri.split_once('?')?;
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix("token="))
        .map(str::to_string)
}

/// Resolve a session token to its player, cleaning up expired sessions.
async fn authenticate(store: &Arc<dyn Store>, token: &str) -> Option<Player> {
    let session = store.find_session(token).await.ok()??;
    if session.is_expired() {
        let _ = store.delete_session(token).await;
        return None;
    }
    store.get_player(session.player_id).await.ok()?
}

async fn handle_socket(stream: TcpStream, addr: SocketAddr, state: AppState) {
    let mut request_uri: Option<String> = None;
    let ws_stream = match accept_hdr_async(stream, |req: &Request, resp: Response| {
        request_uri = Some(req.uri().to_string());
        Ok(resp)
    })
    .await
    {
        Ok(ws) => ws,
        Err(err) => {
            warn!("websocket handshake failed for {addr}: {err}");
            return;
        }
    };

    let Some(token) = request_uri.as_deref().and_then(token_from_query) else {
        debug!("rejecting {addr}: missing token");
        return;
    };
    let Some(player) = authenticate(&state.store, &token).await else {
        debug!("rejecting {addr}: invalid or expired token");
        return;
    };

    let (ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, rx) = mpsc::unbounded_channel();
    let connection_id = state.registry.register(player.id, &player.username, tx.clone());
    let writer = tokio::spawn(write_loop(
        ws_sender,
        rx,
        Arc::clone(&state.registry),
        player.id,
        connection_id,
        state.config.send_timeout(),
    ));

    info!(
        "websocket connection established: player {} ({}) from {addr}",
        player.username, player.id
    );

    while let Some(frame) = ws_receiver.next().await {
        let message = match frame {
            Ok(message) => message,
            Err(err) => {
                warn!("websocket error from player {}: {err}", player.id);
                break;
            }
        };

        match message {
            Message::Text(text) => {
                // Unparseable frames are a protocol violation and close the
                // connection; a well-formed but unsupported message only
                // earns an error envelope.
                let value: Value = match serde_json::from_str(&text) {
                    Ok(value) => value,
                    Err(err) => {
                        warn!("invalid frame from player {}: {err}, closing", player.id);
                        break;
                    }
                };
                match serde_json::from_value::<ClientMessage>(value) {
                    Ok(message) => {
                        handle_message(&state, &player, connection_id, &tx, message).await;
                    }
                    Err(err) => {
                        let _ = tx.send(ServerMessage::Error {
                            message: format!("unsupported message: {err}"),
                        });
                    }
                }
            }
            Message::Binary(_) => {
                let _ = tx.send(ServerMessage::Error {
                    message: "this channel speaks text frames".to_string(),
                });
            }
            Message::Close(_) => {
                debug!("websocket closed by player {}", player.id);
                break;
            }
            _ => {}
        }
    }

    // Gated on our own connection id: a no-op if a newer connection
    // superseded this one, or if the writer task already disconnected us
    // after a failed send.
    state.registry.disconnect(player.id, connection_id);
    drop(tx);
    let _ = writer.await;
    info!(
        "player {} connection {connection_id} closed",
        player.username
    );
}

async fn handle_message(
    state: &AppState,
    player: &Player,
    connection_id: u64,
    tx: &Sink,
    message: ClientMessage,
) {
    match message {
        ClientMessage::Subscribe { zone_id } => match state.store.get_zone(zone_id).await {
            Ok(Some(_)) => match state.registry.subscribe(player.id, connection_id, zone_id) {
                Ok(()) => {
                    let _ = tx.send(ServerMessage::Subscribed { zone_id });
                }
                Err(err) => {
                    let _ = tx.send(ServerMessage::Error {
                        message: err.to_string(),
                    });
                }
            },
            Ok(None) => {
                let _ = tx.send(ServerMessage::Error {
                    message: "zone not found".to_string(),
                });
            }
            Err(err) => {
                warn!("zone lookup failed for player {}: {err}", player.id);
                let _ = tx.send(ServerMessage::Error {
                    message: "zone lookup failed, try again".to_string(),
                });
            }
        },
        ClientMessage::Intent { data } => {
            let zone_id = match state.registry.subscribed_zone(player.id, connection_id) {
                Ok(Some(zone_id)) => zone_id,
                Ok(None) => {
                    let _ = tx.send(ServerMessage::Error {
                        message: "must subscribe to a zone first".to_string(),
                    });
                    return;
                }
                Err(err) => {
                    let _ = tx.send(ServerMessage::Error {
                        message: err.to_string(),
                    });
                    return;
                }
            };

            let intent = Intent {
                player_id: player.id,
                connection_id,
                zone_id,
                data,
                queued_at: Utc::now(),
            };
            // The acknowledgement must not be sent before the intent is
            // durably queued.
            state.intents.enqueue(intent).await;
            let _ = tx.send(ServerMessage::IntentReceived);
        }
    }
}

/// Pump outbound messages into the socket. Each write is bounded; a failed
/// or timed-out write schedules a disconnect (gated on the connection id)
/// and ends the task.
async fn write_loop(
    mut ws_sender: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut rx: mpsc::UnboundedReceiver<ServerMessage>,
    registry: Arc<SubscriptionRegistry>,
    player_id: Uuid,
    connection_id: u64,
    send_timeout: Duration,
) {
    while let Some(message) = rx.recv().await {
        let text = match serde_json::to_string(&message) {
            Ok(text) => text,
            Err(err) => {
                error!("failed to encode message for player {player_id}: {err}");
                continue;
            }
        };
        match timeout(send_timeout, ws_sender.send(Message::Text(text))).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!("send to player {player_id} failed: {err}");
                registry.disconnect(player_id, connection_id);
                break;
            }
            Err(_) => {
                warn!("send to player {player_id} timed out after {send_timeout:?}");
                registry.disconnect(player_id, connection_id);
                break;
            }
        }
    }
    let _ = ws_sender.close().await;
}
