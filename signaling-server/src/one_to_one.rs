use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::{SinkExt, StreamExt, TryFutureExt};
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use warp::ws::{Message, WebSocket};

use callpeer_protocol::one_to_one::{ClientMessage, ServerMessage};
use callpeer_protocol::{ChannelId, ParticipantId, ProtocolError, WireFormat};

use crate::registry::{ConnectionId, Outbox, Registry};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Serve one websocket connection until it closes, then drop every membership it created.
pub async fn user_connected(ws: WebSocket, format: WireFormat, registry: Registry) {
    let connection = ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed));
    info!("new connection: {connection} ({format:?})");

    let (mut user_ws_tx, mut user_ws_rx) = ws.split();

    let (tx, rx) = mpsc::unbounded_channel::<ServerMessage>();
    let mut rx = UnboundedReceiverStream::new(rx);

    tokio::task::spawn(async move {
        while let Some(message) = rx.next().await {
            let frame = match encode_frame(format, &message) {
                Ok(frame) => frame,
                Err(e) => {
                    error!("failed to encode {message:?} for {connection}: {e}");
                    continue;
                }
            };
            user_ws_tx
                .send(frame)
                .unwrap_or_else(|e| warn!("websocket send error ({connection}): {e}"))
                .await;
        }
    });

    if tx.send(ServerMessage::Connected).is_err() {
        return;
    }

    let mut joined: Vec<(ChannelId, ParticipantId)> = Vec::new();
    while let Some(result) = user_ws_rx.next().await {
        let msg = match result {
            Ok(msg) => msg,
            Err(e) => {
                warn!("websocket error ({connection}): {e}");
                break;
            }
        };
        if msg.is_close() {
            break;
        }
        user_message(connection, msg, &tx, &registry, &mut joined).await;
    }

    info!("connection closed: {connection}");
    user_disconnected(connection, joined, &registry).await;
}

fn encode_frame(format: WireFormat, message: &ServerMessage) -> Result<Message, ProtocolError> {
    let bytes = callpeer_protocol::encode(format, message)?;
    Ok(match format {
        WireFormat::Msgpack => Message::binary(bytes),
        // serde_json only ever produces valid utf-8
        WireFormat::Json => Message::text(String::from_utf8_lossy(&bytes)),
    })
}

fn decode_frame(msg: &Message) -> Option<Result<ClientMessage, ProtocolError>> {
    if msg.is_text() {
        Some(callpeer_protocol::decode(WireFormat::Json, msg.as_bytes()))
    } else if msg.is_binary() {
        Some(callpeer_protocol::decode(WireFormat::Msgpack, msg.as_bytes()))
    } else {
        None
    }
}

async fn user_message(
    connection: ConnectionId,
    msg: Message,
    tx: &Outbox,
    registry: &Registry,
    joined: &mut Vec<(ChannelId, ParticipantId)>,
) {
    let request = match decode_frame(&msg) {
        Some(Ok(request)) => {
            debug!("message received from {connection}: {request:?}");
            request
        }
        Some(Err(e)) => {
            warn!("undecodable frame from {connection}: {e}");
            reply_error(tx, format!("malformed request: {e}"));
            return;
        }
        // ping / pong
        None => return,
    };

    match request {
        ClientMessage::Join {
            channel,
            participant,
        } => {
            let membership = (channel.clone(), participant.clone());
            match registry
                .join(channel, participant, connection, tx.clone())
                .await
            {
                Ok(()) => {
                    if !joined.contains(&membership) {
                        joined.push(membership);
                    }
                }
                Err(e) => {
                    warn!("rejected join from {connection}: {e}");
                    reply_error(tx, e.to_string());
                }
            }
        }
        ClientMessage::Leave {
            channel,
            participant,
        } => {
            joined.retain(|(c, p)| !(c == &channel && p == &participant));
            registry.release(&channel, &participant, connection).await;
        }
        ClientMessage::Message(envelope) => {
            if let Err(e) = registry.route(envelope).await {
                warn!("rejected envelope from {connection}: {e}");
                reply_error(tx, e.to_string());
            }
        }
    }
}

fn reply_error(tx: &Outbox, reason: String) {
    if tx.send(ServerMessage::Error { reason }).is_err() {
        debug!("connection went away before the error could be reported");
    }
}

async fn user_disconnected(
    connection: ConnectionId,
    joined: Vec<(ChannelId, ParticipantId)>,
    registry: &Registry,
) {
    for (channel, participant) in joined {
        registry.release(&channel, &participant, connection).await;
    }
}
