/*!
Client side of callpeer: negotiates a direct audio/video connection with another
participant through a callpeer signaling server.

The peer-to-peer engine and the camera are not part of this crate, they are plugged in
through the [`Transport`] and [`MediaSource`] traits. Everything else, from joining a
channel to buffering candidates until they can be applied, is handled by a
[`Negotiator`], usually driven through [`one_to_one::NetworkManager`].
*/

pub mod config;
pub mod error;
pub mod media;
pub mod negotiation;
pub mod one_to_one;
pub mod relay;
pub mod session;
pub mod transport;

pub use callpeer_protocol::{
    ChannelId, Envelope, IceCandidate, ParticipantId, RawEnvelope, SdpType, SessionDescription,
    SignalKind,
};
pub use config::{ConnectionType, IceServer, SessionConfig, Timeouts};
pub use error::Error;
pub use media::{
    MediaAcquisitionError, MediaConstraints, MediaSource, MediaStream, MediaTrack, TrackKind,
};
pub use negotiation::{ConnectionPhase, Negotiator, Role, SessionEvent, Signaller};
pub use session::SessionHandle;
pub use transport::{ConnectionState, Transport, TransportError, TransportEvent, TransportEvents};
