use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use tokio::sync::mpsc;

use callpeer_protocol::{IceCandidate, SessionDescription};

use crate::media::MediaStream;
use crate::negotiation::SessionEvent;

/// Connection state as reported by the peer-to-peer engine.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    /// Transient, the engine may still recover
    Disconnected,
    Failed,
    Closed,
}

/// Events the peer-to-peer engine raises on its own.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    IceCandidate(IceCandidate),
    Track(MediaStream),
    ConnectionStateChange(ConnectionState),
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct TransportError(pub String);

impl TransportError {
    pub fn new(reason: impl Into<String>) -> Self {
        TransportError(reason.into())
    }
}

/// Where a transport delivers its events. Events end up in the owning
/// session's queue and are handled in order with everything else.
#[derive(Debug, Clone)]
pub struct TransportEvents(pub(crate) mpsc::UnboundedSender<SessionEvent>);

impl TransportEvents {
    /// Returns false once the session is gone.
    pub fn emit(&self, event: TransportEvent) -> bool {
        if self.0.send(SessionEvent::Transport(event)).is_err() {
            debug!("transport event dropped, session has ended");
            return false;
        }
        true
    }

    pub fn ice_candidate(&self, candidate: IceCandidate) -> bool {
        self.emit(TransportEvent::IceCandidate(candidate))
    }

    pub fn track(&self, stream: MediaStream) -> bool {
        self.emit(TransportEvent::Track(stream))
    }

    pub fn connection_state(&self, state: ConnectionState) -> bool {
        self.emit(TransportEvent::ConnectionStateChange(state))
    }
}

/// The peer-to-peer connection engine a session drives.
///
/// Every step is asynchronous; the session bounds each one with a timeout.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Called once, when the session is created.
    fn set_event_sink(&self, sink: TransportEvents);

    async fn add_stream(&self, stream: MediaStream) -> Result<(), TransportError>;

    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    async fn close(&self);
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn set_event_sink(&self, sink: TransportEvents) {
        (**self).set_event_sink(sink)
    }

    async fn add_stream(&self, stream: MediaStream) -> Result<(), TransportError> {
        (**self).add_stream(stream).await
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        (**self).create_offer().await
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        (**self).create_answer().await
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        (**self).set_local_description(description).await
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        (**self).set_remote_description(description).await
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        (**self).add_ice_candidate(candidate).await
    }

    async fn close(&self) {
        (**self).close().await
    }
}
