use std::time::Duration;

use callpeer_protocol::{ChannelId, ProtocolError};

use crate::media::MediaAcquisitionError;
use crate::transport::{ConnectionState, TransportError};

/// Everything that can go wrong while negotiating a call.
///
/// Protocol anomalies (`MalformedEnvelope`, `OutOfOrderSignal`, `ForeignChannel`)
/// never end a session: the offending envelope is dropped and the session
/// stays where it was. Transport failures and timeouts do end it.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(#[from] ProtocolError),
    #[error("out of order {what}: {reason}")]
    OutOfOrderSignal { what: &'static str, reason: String },
    #[error("envelope addressed to channel {0}, which this session is not part of")]
    ForeignChannel(ChannelId),
    #[error(transparent)]
    MediaAcquisition(#[from] MediaAcquisitionError),
    #[error("local media was lost")]
    LocalMediaLost,
    #[error("transport rejected {operation}: {source}")]
    TransportNegotiation {
        operation: &'static str,
        #[source]
        source: TransportError,
    },
    #[error("transport connection ended ({0:?})")]
    TransportFatal(ConnectionState),
    #[error("{0} did not complete in time")]
    DescriptionTimeout(&'static str),
    #[error("no connection established within {0:?}")]
    ConnectTimeout(Duration),
    #[error("{0} cancelled, the session was closed")]
    Cancelled(&'static str),
    #[error("session has ended")]
    SessionEnded,
    #[error("relay connection is not available")]
    RelayUnavailable,
    #[error("relay websocket error: {0}")]
    Relay(#[from] tokio_tungstenite::tungstenite::Error),
}

impl Error {
    pub(crate) fn out_of_order(what: &'static str, reason: impl Into<String>) -> Self {
        Error::OutOfOrderSignal {
            what,
            reason: reason.into(),
        }
    }
}
