/*!
The envelope is the unit participants exchange through the relay while negotiating a call.
The relay only looks at `from`, `to` and `signal`; `message` is interpreted by the receiving peer.
 */

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use crate::{ChannelId, ParticipantId, ProtocolError};

/// Kind of negotiation step an envelope carries.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    /// SDP offer from the calling side
    Offer,
    /// SDP answer from the called side
    Answer,
    /// Network path proposal from either side
    IceCandidate,
}

impl SignalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::IceCandidate => "ice-candidate",
        }
    }
}

impl Display for SignalKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignalKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "offer" => Ok(SignalKind::Offer),
            "answer" => Ok(SignalKind::Answer),
            "ice-candidate" => Ok(SignalKind::IceCandidate),
            other => Err(ProtocolError::UnknownSignal(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

impl Display for SdpType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SdpType::Offer => "offer",
            SdpType::Answer => "answer",
            SdpType::Pranswer => "pranswer",
            SdpType::Rollback => "rollback",
        };
        f.write_str(name)
    }
}

/// Session description as produced by the transport, passed to the other peer without modifications.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        SessionDescription {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        SessionDescription {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Proposed ICE Candidate of one user passed to the other user without modifications.
/// Field names follow the browser's `RTCIceCandidateInit`.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_m_line_index: Option<u16>,
}

/// Opaque `message` body of an envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(Value);

impl Payload {
    pub fn new(inner: Value) -> Self {
        Payload(inner)
    }

    pub fn from_description(description: &SessionDescription) -> Self {
        Payload(json!({
            "type": description.sdp_type,
            "sdp": description.sdp,
        }))
    }

    pub fn from_candidate(candidate: &IceCandidate) -> Self {
        Payload(json!({
            "candidate": candidate.candidate,
            "sdpMid": candidate.sdp_mid,
            "sdpMLineIndex": candidate.sdp_m_line_index,
        }))
    }

    /// Interpret the payload as a session description.
    pub fn session_description(&self) -> Result<SessionDescription, ProtocolError> {
        SessionDescription::deserialize(&self.0).map_err(|source| ProtocolError::InvalidPayload {
            expected: "session description",
            source,
        })
    }

    /// Interpret the payload as a network candidate.
    pub fn ice_candidate(&self) -> Result<IceCandidate, ProtocolError> {
        IceCandidate::deserialize(&self.0).map_err(|source| ProtocolError::InvalidPayload {
            expected: "ice candidate",
            source,
        })
    }

    pub fn get(&self) -> &Value {
        &self.0
    }
}

/// Envelope exactly as it came off the wire, nothing checked yet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawEnvelope {
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub signal: Option<String>,
    #[serde(default)]
    pub message: Option<Value>,
}

impl RawEnvelope {
    /// Check that every field is present and `signal` names a known kind.
    pub fn validate(self) -> Result<Envelope, ProtocolError> {
        let from = non_empty(self.from, "from")?;
        let to = non_empty(self.to, "to")?;
        let signal = self
            .signal
            .ok_or(ProtocolError::MissingField("signal"))?
            .parse()?;
        let message = self.message.ok_or(ProtocolError::MissingField("message"))?;
        Ok(Envelope {
            from: ParticipantId::new(from),
            to: ChannelId::new(to),
            signal,
            message: Payload(message),
        })
    }
}

fn non_empty(field: Option<String>, name: &'static str) -> Result<String, ProtocolError> {
    match field {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ProtocolError::MissingField(name)),
    }
}

/// Validated envelope. `to` names a channel, not a participant: the relay hands
/// it to every other member of that channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: ParticipantId,
    pub to: ChannelId,
    pub signal: SignalKind,
    pub message: Payload,
}

impl Envelope {
    pub fn new(from: ParticipantId, to: ChannelId, signal: SignalKind, message: Payload) -> Self {
        Envelope {
            from,
            to,
            signal,
            message,
        }
    }

    pub fn description(from: ParticipantId, to: ChannelId, description: &SessionDescription) -> Self {
        let signal = match description.sdp_type {
            SdpType::Answer | SdpType::Pranswer => SignalKind::Answer,
            SdpType::Offer | SdpType::Rollback => SignalKind::Offer,
        };
        Envelope::new(from, to, signal, Payload::from_description(description))
    }

    pub fn candidate(from: ParticipantId, to: ChannelId, candidate: &IceCandidate) -> Self {
        Envelope::new(
            from,
            to,
            SignalKind::IceCandidate,
            Payload::from_candidate(candidate),
        )
    }
}

impl From<Envelope> for RawEnvelope {
    fn from(envelope: Envelope) -> Self {
        RawEnvelope {
            from: Some(envelope.from.into_inner()),
            to: Some(envelope.to.into_inner()),
            signal: Some(envelope.signal.as_str().to_owned()),
            message: Some(envelope.message.0),
        }
    }
}
