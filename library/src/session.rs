/*!
Running a [`Negotiator`] as its own task.
 */

use std::sync::Arc;

use log::{debug, warn};
use tokio::sync::{mpsc, watch};

use crate::error::Error;
use crate::negotiation::{wait_closed, ConnectionPhase, Negotiator, SessionEvent};
use crate::transport::{Transport, TransportEvents};

impl<T: Transport + 'static> Negotiator<T> {
    /// Move the session onto its own task. Events are handled one at a time, in the
    /// order they were queued, until the session reaches a terminal phase.
    pub fn spawn(self) -> SessionHandle {
        let handle = SessionHandle {
            events: self.queue_tx.clone(),
            close: self.close_tx.clone(),
            phase: self.phase_tx.subscribe(),
        };
        tokio::spawn(self.run());
        handle
    }

    /// Handle events until the session is closed or fails.
    pub async fn run(mut self) {
        let mut closed = self.close_tx.subscribe();
        while !self.phase().is_terminal() {
            let deadline = self.connect_deadline;
            tokio::select! {
                event = self.queue.recv() => {
                    // we hold a sender ourselves, the queue never runs dry
                    let Some(event) = event else { break };
                    if let Err(e) = self.handle(event).await {
                        warn!("{}: {}", self.participant(), e);
                    }
                }
                _ = connect_deadline(deadline) => {
                    if let Err(e) = self.expire().await {
                        warn!("{}: {}", self.participant(), e);
                    }
                }
                _ = wait_closed(&mut closed) => {
                    debug!("{}: hangup requested", self.participant());
                    self.teardown(ConnectionPhase::Closed).await;
                }
            }
        }
        debug!("{}: session ended in {:?}", self.participant(), self.phase());
    }
}

async fn connect_deadline(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Control side of a spawned session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    events: mpsc::UnboundedSender<SessionEvent>,
    close: Arc<watch::Sender<bool>>,
    phase: watch::Receiver<ConnectionPhase>,
}

impl SessionHandle {
    /// Queue an event behind everything already queued.
    pub fn send(&self, event: SessionEvent) -> Result<(), Error> {
        self.events.send(event).map_err(|_| Error::SessionEnded)
    }

    pub fn start_call(&self) -> Result<(), Error> {
        self.send(SessionEvent::StartCall)
    }

    pub fn join_call(&self) -> Result<(), Error> {
        self.send(SessionEvent::JoinCall)
    }

    /// Close the session. Takes effect right away, a step in progress is abandoned.
    pub fn hangup(&self) {
        self.close.send_replace(true);
    }

    pub fn phase(&self) -> ConnectionPhase {
        *self.phase.borrow()
    }

    /// Wait until the phase satisfies `done`, returning that phase. Fails once the
    /// session task is gone without ever getting there.
    pub async fn wait_until(
        &self,
        mut done: impl FnMut(ConnectionPhase) -> bool,
    ) -> Result<ConnectionPhase, Error> {
        let mut phase = self.phase.clone();
        let reached = phase.wait_for(|phase| done(*phase)).await;
        match reached {
            Ok(phase) => Ok(*phase),
            Err(_) => Err(Error::SessionEnded),
        }
    }

    /// Sink a transport can deliver its events to.
    pub fn transport_events(&self) -> TransportEvents {
        TransportEvents(self.events.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use callpeer_protocol::{Envelope, SessionDescription};

    use super::*;
    use crate::config::Timeouts;
    use crate::negotiation::fake::*;
    use crate::negotiation::Role;
    use crate::transport::{ConnectionState, TransportEvent};

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_fails_session() {
        let (mut a, transport, _out) = ready_negotiator("a").await;
        a.handle(SessionEvent::StartCall).await.unwrap();
        let session = a.spawn();

        let phase = session.wait_until(ConnectionPhase::is_terminal).await.unwrap();
        assert_eq!(phase, ConnectionPhase::Failed);
        assert_eq!(transport.calls().last(), Some(&Call::Close));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connected_session_is_not_expired() {
        let (mut a, transport, _out) = ready_negotiator("a").await;
        a.handle(SessionEvent::StartCall).await.unwrap();
        let answer =
            Envelope::description("b".into(), "room1".into(), &SessionDescription::answer("v=0"));
        a.handle(SessionEvent::Envelope(answer.into())).await.unwrap();
        let session = a.spawn();

        transport.emit(TransportEvent::ConnectionStateChange(ConnectionState::Connected));
        session
            .wait_until(|phase| phase == ConnectionPhase::Connected)
            .await
            .unwrap();
        tokio::time::sleep(Timeouts::default().connect * 2).await;
        assert_eq!(session.phase(), ConnectionPhase::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hangup_cancels_pending_offer() {
        let (a, transport, mut out) = ready_negotiator("a").await;
        transport.stall_offer.store(true, Ordering::SeqCst);
        let session = a.spawn();

        session.start_call().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(transport.calls().last(), Some(&Call::CreateOffer));
        session.hangup();

        let phase = session.wait_until(ConnectionPhase::is_terminal).await.unwrap();
        assert_eq!(phase, ConnectionPhase::Closed);
        assert!(sent(&mut out).is_empty());
        assert_eq!(transport.calls().last(), Some(&Call::Close));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_offer_times_out() {
        let (a, transport, mut out) = ready_negotiator("a").await;
        transport.stall_offer.store(true, Ordering::SeqCst);
        let session = a.spawn();

        session.start_call().unwrap();
        let phase = session.wait_until(ConnectionPhase::is_terminal).await.unwrap();
        assert_eq!(phase, ConnectionPhase::Failed);
        assert!(sent(&mut out).is_empty());
    }

    #[tokio::test]
    async fn test_spawned_sessions_negotiate_call() {
        let (a, a_transport, mut a_out) = ready_negotiator("a").await;
        let (b, b_transport, mut b_out) = ready_negotiator("b").await;
        let a = a.spawn();
        let b = b.spawn();

        b.join_call().unwrap();
        a.start_call().unwrap();
        a.wait_until(|phase| phase == ConnectionPhase::AwaitingRemote(Role::Offerer))
            .await
            .unwrap();

        // play relay between the two sessions
        let offer = a_out.recv().await.unwrap();
        if let callpeer_protocol::one_to_one::ClientMessage::Message(raw) = offer {
            b.send(SessionEvent::Envelope(raw)).unwrap();
        }
        let answer = b_out.recv().await.unwrap();
        if let callpeer_protocol::one_to_one::ClientMessage::Message(raw) = answer {
            a.send(SessionEvent::Envelope(raw)).unwrap();
        }
        a.wait_until(|phase| phase == ConnectionPhase::HaveRemoteDescription)
            .await
            .unwrap();

        a_transport.emit(TransportEvent::ConnectionStateChange(ConnectionState::Connected));
        b_transport.emit(TransportEvent::ConnectionStateChange(ConnectionState::Connected));
        a.wait_until(|phase| phase == ConnectionPhase::Connected)
            .await
            .unwrap();
        b.wait_until(|phase| phase == ConnectionPhase::Connected)
            .await
            .unwrap();

        a.hangup();
        assert_eq!(
            a.wait_until(ConnectionPhase::is_terminal).await.unwrap(),
            ConnectionPhase::Closed
        );
        assert_eq!(b.phase(), ConnectionPhase::Connected);
    }
}
