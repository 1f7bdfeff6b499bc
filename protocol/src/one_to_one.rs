/*!
Events exchanged between a participant and the signaling server over one websocket
connection while two peers negotiate a call.
 */

use crate::{ChannelId, Envelope, ParticipantId, RawEnvelope};
use serde::{Deserialize, Serialize};

/// Messages a participant sends to the signaling server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Enter a channel under the given identity
    Join {
        channel: ChannelId,
        participant: ParticipantId,
    },
    /// Leave a channel before disconnecting
    Leave {
        channel: ChannelId,
        participant: ParticipantId,
    },
    /// Negotiation envelope to hand to the other members of `to`
    Message(RawEnvelope),
}

/// Messages the signaling server sends to a participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Websocket handshake finished, the participant may join now
    Connected,
    /// Join acknowledged, only ever sent to the joining participant
    Ready {
        channel: ChannelId,
        participant: ParticipantId,
    },
    /// Envelope sent by another member of the channel
    Message(Envelope),
    /// Generic error containing detailed information about the cause
    Error { reason: String },
    /// Connection to the server is gone
    Close,
}
