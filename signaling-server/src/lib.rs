/*!
Signaling server that relays call negotiation envelopes between participants of a channel.

Participants connect over a websocket at `/signaling`, join a channel and then every envelope
they send is handed to the other members of that channel. Once the peers have a direct
connection the server is no longer involved.
*/

use serde::Deserialize;
use warp::{Filter, Rejection, Reply};

use callpeer_protocol::{ProtocolError, WireFormat};

pub mod config;
pub mod one_to_one;
pub mod registry;

pub use registry::{ConnectionId, Registry};

/// Reasons the relay refuses a request from a connection.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("malformed request: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("channel id must not be empty")]
    EmptyChannel,
    #[error("participant id must not be empty")]
    EmptyParticipant,
}

#[derive(Debug, Default, Deserialize)]
struct ConnectOptions {
    #[serde(default)]
    format: WireFormat,
}

/// Websocket endpoint serving the relay protocol.
pub fn routes(registry: Registry) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let registry = warp::any().map(move || registry.clone());

    warp::path("signaling")
        .and(warp::path::end())
        .and(warp::ws())
        .and(warp::query::<ConnectOptions>())
        .and(registry)
        .map(|ws: warp::ws::Ws, options: ConnectOptions, registry: Registry| {
            ws.on_upgrade(move |socket| one_to_one::user_connected(socket, options.format, registry))
        })
}
