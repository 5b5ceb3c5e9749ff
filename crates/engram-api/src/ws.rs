use axum::extract::State;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;

use engram_types::{BusEvent, Channel};

use crate::server::AppState;

// NOTE: Fan-out Policy
//
// Each client gets a bounded send buffer. Events that cannot be buffered
// (client not draining) close the connection - backpressure by disconnect,
// never by queueing unbounded history. Reconnecting clients re-subscribe;
// there is no replay, the REST surface is the source of record.

const SEND_BUFFER: usize = 64;
const HEARTBEAT: Duration = Duration::from_secs(30);
const MAX_MISSED_PONGS: u32 = 2;
const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Subscribe { channels: Vec<String> },
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| client_loop(socket, state))
}

async fn client_loop(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();

    // First frame must be a subscription
    let channels = match wait_for_subscribe(&mut stream).await {
        Some(channels) => channels,
        None => {
            let _ = sink.close().await;
            return;
        }
    };

    let (tx, mut rx) = mpsc::channel::<BusEvent>(SEND_BUFFER);
    for channel in channels {
        let mut bus_rx = state.handle.bus.subscribe(channel);
        let tx = tx.clone();
        tokio::spawn(async move {
            loop {
                match bus_rx.recv().await {
                    Ok(event) => {
                        // Full buffer means a slow client; dropping the
                        // sender ends the client loop below
                        if tx.try_send(event).is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "ws subscriber lagged the bus");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
    drop(tx);

    let mut heartbeat = tokio::time::interval(HEARTBEAT);
    heartbeat.tick().await; // immediate first tick
    let mut outstanding_pings: u32 = 0;
    let cancel = state.handle.cancel.clone();

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else {
                    // Slow client or bus gone
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::POLICY,
                            reason: "send buffer exceeded".into(),
                        })))
                        .await;
                    return;
                };
                let Ok(json) = serde_json::to_string(&event) else { continue };
                if sink.send(Message::Text(json.into())).await.is_err() {
                    return;
                }
            }

            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Pong(_))) => outstanding_pings = 0,
                    Some(Ok(Message::Close(_))) | None => return,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => return,
                }
            }

            _ = heartbeat.tick() => {
                if outstanding_pings >= MAX_MISSED_PONGS {
                    let _ = sink.send(Message::Close(None)).await;
                    return;
                }
                outstanding_pings += 1;
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    return;
                }
            }

            _ = cancel.cancelled() => {
                // 1001: going away
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code: close_code::AWAY,
                        reason: "daemon shutting down".into(),
                    })))
                    .await;
                return;
            }
        }
    }
}

async fn wait_for_subscribe(
    stream: &mut futures::stream::SplitStream<WebSocket>,
) -> Option<Vec<Channel>> {
    let deadline = tokio::time::sleep(SUBSCRIBE_TIMEOUT);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            message = stream.next() => {
                match message? {
                    Ok(Message::Text(text)) => {
                        let Ok(ClientMessage::Subscribe { channels }) =
                            serde_json::from_str::<ClientMessage>(&text)
                        else {
                            continue;
                        };
                        let parsed: Vec<Channel> = channels
                            .iter()
                            .filter_map(|name| Channel::parse(name))
                            .collect();
                        if parsed.is_empty() {
                            continue;
                        }
                        return Some(parsed);
                    }
                    Ok(Message::Close(_)) => return None,
                    Ok(_) => continue,
                    Err(_) => return None,
                }
            }
            _ = &mut deadline => return None,
        }
    }
}
