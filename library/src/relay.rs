/*!
Websocket connection to a callpeer signaling server.
 */

use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use callpeer_protocol::one_to_one::{ClientMessage, ServerMessage};
use callpeer_protocol::{ProtocolError, WireFormat};

use crate::error::Error;

/// Both directions of a relay connection. The socket itself lives in two background
/// tasks; dropping `outbound` closes it.
#[derive(Debug)]
pub struct RelayConnection {
    pub outbound: mpsc::UnboundedSender<ClientMessage>,
    /// Ends with [`ServerMessage::Close`] once the socket is gone
    pub inbound: mpsc::UnboundedReceiver<ServerMessage>,
}

impl RelayConnection {
    /// Connect to `url`. Requests go out as msgpack; replies are read in whatever
    /// format the server picked.
    pub async fn connect(url: &str) -> Result<Self, Error> {
        let (ws_stream, _) = connect_async(url).await?;
        info!("connected to relay at {url}");
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel::<ServerMessage>();

        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let bytes = match callpeer_protocol::encode(WireFormat::Msgpack, &message) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!("failed to encode {message:?}: {e}");
                        continue;
                    }
                };
                if let Err(e) = ws_write.send(Message::binary(bytes)).await {
                    warn!("relay send error: {e}");
                    break;
                }
            }
            if ws_write.close().await.is_err() {
                debug!("relay socket was already closed");
            }
        });

        tokio::spawn(async move {
            while let Some(frame) = ws_read.next().await {
                let decoded = match frame {
                    Ok(Message::Text(text)) => decode(WireFormat::Json, text.as_bytes()),
                    Ok(Message::Binary(data)) => decode(WireFormat::Msgpack, &data),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("relay connection error: {e}");
                        break;
                    }
                };
                match decoded {
                    Ok(message) => {
                        if inbound_tx.send(message).is_err() {
                            return;
                        }
                    }
                    Err(e) => warn!("undecodable frame from relay: {e}"),
                }
            }
            info!("relay connection closed");
            let _ = inbound_tx.send(ServerMessage::Close);
        });

        Ok(RelayConnection { outbound, inbound })
    }
}

fn decode(format: WireFormat, bytes: &[u8]) -> Result<ServerMessage, ProtocolError> {
    callpeer_protocol::decode(format, bytes)
}
