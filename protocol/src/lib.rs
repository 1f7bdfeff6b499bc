/*!
Helper crate that declares common types and structures shared between [callpeer](../callpeer/index.html)
clients and the callpeer signaling server.
*/

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt::{Display, Formatter};

pub mod envelope;
pub mod one_to_one;

pub use envelope::{
    Envelope, IceCandidate, Payload, RawEnvelope, SdpType, SessionDescription, SignalKind,
};

/// Errors raised while validating or (de)serializing protocol messages.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("envelope is missing the `{0}` field")]
    MissingField(&'static str),
    #[error("unknown signal kind: {0:?}")]
    UnknownSignal(String),
    #[error("payload is not a valid {expected}: {source}")]
    InvalidPayload {
        expected: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("expected a session description of type {expected}, got {actual}")]
    UnexpectedSdpType { expected: SdpType, actual: SdpType },
    #[error("msgpack encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("msgpack decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Name of the rendezvous group that participants join in order to find each other.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    /// Wrap String into a ChannelId struct
    pub fn new(inner: impl Into<String>) -> Self {
        ChannelId(inner.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Acquire the underlying type
    pub fn into_inner(self) -> String {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl Display for ChannelId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ChannelId {
    fn from(val: &str) -> Self {
        ChannelId::new(val)
    }
}

/// Identity a participant picks for itself. It is opaque to the server and
/// only has to be unique within a channel for the duration of a call.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    /// Wrap String into a ParticipantId struct
    pub fn new(inner: impl Into<String>) -> Self {
        ParticipantId(inner.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Acquire the underlying type
    pub fn into_inner(self) -> String {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl Display for ParticipantId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(val: &str) -> Self {
        ParticipantId::new(val)
    }
}

/// Encoding used for the frames of one relay connection.
/// Binary frames always carry MessagePack and text frames always carry JSON,
/// this only selects what the server answers with.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    #[default]
    Msgpack,
    Json,
}

/// Serialize a message in the given wire format.
pub fn encode<T: Serialize>(format: WireFormat, message: &T) -> Result<Vec<u8>, ProtocolError> {
    match format {
        WireFormat::Msgpack => Ok(rmp_serde::to_vec_named(message)?),
        WireFormat::Json => Ok(serde_json::to_vec(message)?),
    }
}

/// Deserialize a message from the given wire format.
pub fn decode<T: DeserializeOwned>(format: WireFormat, bytes: &[u8]) -> Result<T, ProtocolError> {
    match format {
        WireFormat::Msgpack => Ok(rmp_serde::from_slice(bytes)?),
        WireFormat::Json => Ok(serde_json::from_slice(bytes)?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::one_to_one::{ClientMessage, ServerMessage};

    #[test]
    fn test_identifiers_serialize_as_plain_strings() {
        let json = serde_json::to_string(&ParticipantId::new("long")).unwrap();
        assert_eq!(json, "\"long\"");
        let channel: ChannelId = serde_json::from_str("\"LongVideo\"").unwrap();
        assert_eq!(channel.as_str(), "LongVideo");
    }

    #[test]
    fn test_blank_identifiers_are_empty() {
        assert!(ChannelId::new("   ").is_empty());
        assert!(ParticipantId::new("").is_empty());
        assert!(!ParticipantId::new("a").is_empty());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let result = decode::<ClientMessage>(WireFormat::Msgpack, &[0xc1, 0x00]);
        assert!(matches!(result, Err(ProtocolError::Decode(_))));
        let result = decode::<ClientMessage>(WireFormat::Json, b"{\"event\":");
        assert!(matches!(result, Err(ProtocolError::Json(_))));
    }

    #[test]
    fn test_msgpack_carries_envelope_payload() {
        let envelope = Envelope::new(
            ParticipantId::new("long"),
            ChannelId::new("room1"),
            SignalKind::IceCandidate,
            Payload::from_candidate(&IceCandidate {
                candidate: "candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_m_line_index: Some(0),
            }),
        );
        let bytes = encode(WireFormat::Msgpack, &ServerMessage::Message(envelope)).unwrap();
        match decode::<ServerMessage>(WireFormat::Msgpack, &bytes).unwrap() {
            ServerMessage::Message(received) => {
                let candidate = received.message.ice_candidate().unwrap();
                assert_eq!(candidate.sdp_m_line_index, Some(0));
                assert_eq!(received.signal, SignalKind::IceCandidate);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
