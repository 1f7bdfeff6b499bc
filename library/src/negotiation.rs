/*!
Per-participant negotiation state machine.

A [`Negotiator`] owns one negotiation session. Relay deliveries, transport events and user
actions all arrive as [`SessionEvent`]s and are handled strictly one at a time, either by
calling [`Negotiator::handle`] directly or by running the session as a task with
[`Negotiator::spawn`].
 */

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use callpeer_protocol::one_to_one::ClientMessage;
use callpeer_protocol::{
    ChannelId, Envelope, IceCandidate, ParticipantId, ProtocolError, RawEnvelope, SdpType,
    SignalKind,
};

use crate::config::Timeouts;
use crate::error::Error;
use crate::media::{MediaConstraints, MediaSource, MediaStream};
use crate::transport::{ConnectionState, Transport, TransportError, TransportEvent, TransportEvents};

/// Remote candidates held back while no remote description is set.
pub const MAX_PENDING_CANDIDATES: usize = 64;

/// Side a participant ended up on.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Role {
    Unstarted,
    Offerer,
    Answerer,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConnectionPhase {
    /// No local media yet
    Idle,
    MediaReady,
    /// Local side committed to a role, the other side's description is outstanding
    AwaitingRemote(Role),
    HaveRemoteDescription,
    Connected,
    Closed,
    Failed,
}

impl ConnectionPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionPhase::Closed | ConnectionPhase::Failed)
    }
}

/// Input to a negotiation session.
#[derive(Debug)]
pub enum SessionEvent {
    /// The relay acknowledged our join of this channel
    Ready(ChannelId),
    /// Caller side: offer a call to the channel
    StartCall,
    /// Callee side: answer the offer of the channel
    JoinCall,
    /// Envelope delivered by the relay
    Envelope(RawEnvelope),
    Transport(TransportEvent),
    LocalMediaLost,
    Hangup,
    /// The relay refused one of our requests
    RelayError(String),
    RelayClosed,
}

/// Outbound half of the relay connection.
pub trait Signaller: Send + Sync {
    fn signal(&self, message: ClientMessage) -> Result<(), Error>;
}

impl Signaller for mpsc::UnboundedSender<ClientMessage> {
    fn signal(&self, message: ClientMessage) -> Result<(), Error> {
        self.send(message).map_err(|_| Error::RelayUnavailable)
    }
}

pub struct Negotiator<T> {
    participant: ParticipantId,
    channel: ChannelId,
    transport: T,
    signaller: Box<dyn Signaller>,
    timeouts: Timeouts,

    role: Role,
    phase: ConnectionPhase,
    local_description_set: bool,
    remote_description_set: bool,
    pending_remote_candidates: VecDeque<(ParticipantId, IceCandidate)>,
    // participant whose description was accepted
    remote_peer: Option<ParticipantId>,
    channel_ready: bool,
    // start-call requested before the relay acknowledged the join
    call_requested: bool,
    local_stream: Option<MediaStream>,
    remote_streams: Vec<MediaStream>,
    remote_stream_tx: Option<mpsc::UnboundedSender<MediaStream>>,
    pub(crate) connect_deadline: Option<Instant>,

    pub(crate) queue_tx: mpsc::UnboundedSender<SessionEvent>,
    pub(crate) queue: mpsc::UnboundedReceiver<SessionEvent>,
    pub(crate) close_tx: Arc<watch::Sender<bool>>,
    pub(crate) phase_tx: watch::Sender<ConnectionPhase>,
}

impl<T: Transport> Negotiator<T> {
    pub fn new(
        participant: ParticipantId,
        channel: ChannelId,
        transport: T,
        signaller: impl Signaller + 'static,
        timeouts: Timeouts,
    ) -> Self {
        let (queue_tx, queue) = mpsc::unbounded_channel();
        let (close_tx, _) = watch::channel(false);
        let (phase_tx, _) = watch::channel(ConnectionPhase::Idle);
        transport.set_event_sink(TransportEvents(queue_tx.clone()));

        Negotiator {
            participant,
            channel,
            transport,
            signaller: Box::new(signaller),
            timeouts,
            role: Role::Unstarted,
            phase: ConnectionPhase::Idle,
            local_description_set: false,
            remote_description_set: false,
            pending_remote_candidates: VecDeque::new(),
            remote_peer: None,
            channel_ready: false,
            call_requested: false,
            local_stream: None,
            remote_streams: Vec::new(),
            remote_stream_tx: None,
            connect_deadline: None,
            queue_tx,
            queue,
            close_tx: Arc::new(close_tx),
            phase_tx,
        }
    }

    /// Forward every remote stream the transport reports to `sink`.
    pub fn with_remote_stream_sink(mut self, sink: mpsc::UnboundedSender<MediaStream>) -> Self {
        self.remote_stream_tx = Some(sink);
        self
    }

    pub fn participant(&self) -> &ParticipantId {
        &self.participant
    }

    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    pub fn local_description_set(&self) -> bool {
        self.local_description_set
    }

    pub fn remote_description_set(&self) -> bool {
        self.remote_description_set
    }

    /// Remote candidates waiting for the remote description.
    pub fn pending_remote_candidates(&self) -> usize {
        self.pending_remote_candidates.len()
    }

    pub fn local_stream(&self) -> Option<&MediaStream> {
        self.local_stream.as_ref()
    }

    pub fn remote_streams(&self) -> &[MediaStream] {
        &self.remote_streams
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Sender feeding this session's event queue.
    pub fn events(&self) -> mpsc::UnboundedSender<SessionEvent> {
        self.queue_tx.clone()
    }

    /// Capture local media and attach it to the transport. This is what turns an idle
    /// session into one that can negotiate; on failure the session stays idle.
    pub async fn start_media(
        &mut self,
        source: &dyn MediaSource,
        constraints: MediaConstraints,
    ) -> Result<(), Error> {
        if self.phase != ConnectionPhase::Idle {
            return Err(Error::out_of_order("start media", "local media already started"));
        }
        let stream = source.acquire_local_media(constraints).await?;
        self.bounded("add stream", self.transport.add_stream(stream.clone()))
            .await?;
        info!(
            "{}: local media {} ready with {} track(s)",
            self.participant,
            stream.id,
            stream.tracks.len()
        );
        self.local_stream = Some(stream);
        self.transition(ConnectionPhase::MediaReady);
        Ok(())
    }

    /// Handle one event. Errors are reported back but only the ones that end the
    /// session change its state; everything else leaves the session as it was.
    pub async fn handle(&mut self, event: SessionEvent) -> Result<(), Error> {
        if self.phase.is_terminal() {
            debug!("{}: session ended, ignoring {:?}", self.participant, event);
            return Ok(());
        }
        match event {
            SessionEvent::Ready(channel) => self.on_ready(channel).await,
            SessionEvent::StartCall => self.start_call().await,
            SessionEvent::JoinCall => self.join_call(),
            SessionEvent::Envelope(envelope) => self.on_envelope(envelope).await,
            SessionEvent::Transport(event) => self.on_transport_event(event).await,
            SessionEvent::LocalMediaLost => {
                self.teardown(ConnectionPhase::Failed).await;
                Err(Error::LocalMediaLost)
            }
            SessionEvent::Hangup => {
                self.teardown(ConnectionPhase::Closed).await;
                Ok(())
            }
            SessionEvent::RelayError(reason) => {
                warn!("{}: relay reported an error: {}", self.participant, reason);
                Ok(())
            }
            SessionEvent::RelayClosed => {
                if self.phase != ConnectionPhase::Connected {
                    warn!(
                        "{}: relay closed while still negotiating ({:?})",
                        self.participant, self.phase
                    );
                }
                Ok(())
            }
        }
    }

    /// Handle whatever is queued right now without waiting for more.
    pub async fn process_queued(&mut self) -> Vec<Error> {
        let mut errors = Vec::new();
        while let Ok(event) = self.queue.try_recv() {
            if let Err(e) = self.handle(event).await {
                errors.push(e);
            }
        }
        errors
    }

    /// Give up on a negotiation that did not connect before its deadline.
    pub async fn expire(&mut self) -> Result<(), Error> {
        if self.phase.is_terminal() || self.phase == ConnectionPhase::Connected {
            return Ok(());
        }
        self.teardown(ConnectionPhase::Failed).await;
        Err(Error::ConnectTimeout(self.timeouts.connect))
    }

    async fn on_ready(&mut self, channel: ChannelId) -> Result<(), Error> {
        if channel != self.channel {
            return Err(Error::ForeignChannel(channel));
        }
        if self.channel_ready {
            debug!("{}: duplicate ready for {}", self.participant, channel);
        }
        self.channel_ready = true;
        if self.call_requested && self.role == Role::Unstarted {
            self.send_offer().await
        } else {
            Ok(())
        }
    }

    async fn start_call(&mut self) -> Result<(), Error> {
        match (self.phase, self.role) {
            (ConnectionPhase::MediaReady, Role::Unstarted) => {}
            (ConnectionPhase::Idle, _) => {
                return Err(Error::out_of_order("start call", "local media is not ready"))
            }
            (_, role) => {
                return Err(Error::out_of_order(
                    "start call",
                    format!("negotiation already started as {role:?}"),
                ))
            }
        }
        if !self.channel_ready {
            info!(
                "{}: waiting for {} before offering",
                self.participant, self.channel
            );
            self.call_requested = true;
            return Ok(());
        }
        self.send_offer().await
    }

    async fn send_offer(&mut self) -> Result<(), Error> {
        self.call_requested = false;
        self.role = Role::Offerer;

        let created = self.bounded("create offer", self.transport.create_offer()).await;
        let offer = match created {
            Ok(offer) => offer,
            Err(e) => return Err(self.abandon(e).await),
        };
        let applied = self
            .bounded(
                "set local description",
                self.transport.set_local_description(offer.clone()),
            )
            .await;
        if let Err(e) = applied {
            return Err(self.abandon(e).await);
        }
        self.local_description_set = true;
        self.transition(ConnectionPhase::AwaitingRemote(Role::Offerer));
        self.arm_connect_deadline();

        info!("{}: offering call to {}", self.participant, self.channel);
        self.transmit(Envelope::description(
            self.participant.clone(),
            self.channel.clone(),
            &offer,
        ))
    }

    fn join_call(&mut self) -> Result<(), Error> {
        match (self.phase, self.role) {
            (ConnectionPhase::MediaReady, Role::Unstarted) => {
                self.role = Role::Answerer;
                self.transition(ConnectionPhase::AwaitingRemote(Role::Answerer));
                self.arm_connect_deadline();
                info!("{}: waiting for an offer in {}", self.participant, self.channel);
                Ok(())
            }
            (ConnectionPhase::Idle, _) => {
                Err(Error::out_of_order("join call", "local media is not ready"))
            }
            (_, role) => Err(Error::out_of_order(
                "join call",
                format!("negotiation already started as {role:?}"),
            )),
        }
    }

    async fn on_envelope(&mut self, envelope: RawEnvelope) -> Result<(), Error> {
        // the relay broadcasts to the whole channel, our own transmissions can come back
        if envelope.from.as_deref() == Some(self.participant.as_str()) {
            debug!(
                "{}: discarding own {:?} echoed by the relay",
                self.participant, envelope.signal
            );
            return Ok(());
        }
        let envelope = envelope.validate()?;
        if envelope.to != self.channel {
            return Err(Error::ForeignChannel(envelope.to));
        }
        debug!(
            "{}: {} from {}",
            self.participant, envelope.signal, envelope.from
        );
        match envelope.signal {
            SignalKind::Offer => self.on_offer(envelope).await,
            SignalKind::Answer => self.on_answer(envelope).await,
            SignalKind::IceCandidate => self.on_remote_candidate(envelope).await,
        }
    }

    async fn on_offer(&mut self, envelope: Envelope) -> Result<(), Error> {
        let offer = envelope.message.session_description()?;
        expect_sdp_type(SdpType::Offer, offer.sdp_type)?;
        match (self.phase, self.role) {
            (ConnectionPhase::MediaReady, Role::Unstarted)
            | (ConnectionPhase::AwaitingRemote(Role::Answerer), Role::Answerer) => {}
            (ConnectionPhase::Idle, _) => {
                return Err(Error::out_of_order("offer", "local media is not ready"))
            }
            (_, Role::Offerer) if !self.remote_description_set => {
                return Err(Error::out_of_order("offer", "already offering to the channel"))
            }
            _ => {
                return Err(Error::out_of_order(
                    "offer",
                    "negotiation already in progress, renegotiation is not supported",
                ))
            }
        }

        let applied = self
            .bounded(
                "set remote description",
                self.transport.set_remote_description(offer),
            )
            .await;
        match applied {
            Ok(()) => {}
            // a later, valid offer can still be accepted
            Err(e @ Error::TransportNegotiation { .. }) => return Err(e),
            Err(e) => return Err(self.abandon(e).await),
        }
        self.role = Role::Answerer;
        self.call_requested = false;
        self.remote_description_set = true;
        self.remote_peer = Some(envelope.from.clone());
        info!(
            "{}: accepted offer from {}",
            self.participant, envelope.from
        );
        self.apply_pending_candidates().await?;

        let created = self
            .bounded("create answer", self.transport.create_answer())
            .await;
        let answer = match created {
            Ok(answer) => answer,
            Err(e) => return Err(self.abandon(e).await),
        };
        let applied = self
            .bounded(
                "set local description",
                self.transport.set_local_description(answer.clone()),
            )
            .await;
        if let Err(e) = applied {
            return Err(self.abandon(e).await);
        }
        self.local_description_set = true;
        self.transition(ConnectionPhase::HaveRemoteDescription);
        self.arm_connect_deadline();

        self.transmit(Envelope::description(
            self.participant.clone(),
            self.channel.clone(),
            &answer,
        ))
    }

    async fn on_answer(&mut self, envelope: Envelope) -> Result<(), Error> {
        let answer = envelope.message.session_description()?;
        expect_sdp_type(SdpType::Answer, answer.sdp_type)?;
        if self.phase != ConnectionPhase::AwaitingRemote(Role::Offerer) {
            let reason = if self.role == Role::Offerer {
                "remote description already set"
            } else {
                "no offer was sent"
            };
            return Err(Error::out_of_order("answer", reason));
        }

        let applied = self
            .bounded(
                "set remote description",
                self.transport.set_remote_description(answer),
            )
            .await;
        match applied {
            Ok(()) => {}
            Err(e @ Error::TransportNegotiation { .. }) => return Err(e),
            Err(e) => return Err(self.abandon(e).await),
        }
        self.remote_description_set = true;
        self.remote_peer = Some(envelope.from.clone());
        info!(
            "{}: {} answered the call",
            self.participant, envelope.from
        );
        self.transition(ConnectionPhase::HaveRemoteDescription);
        self.apply_pending_candidates().await
    }

    async fn on_remote_candidate(&mut self, envelope: Envelope) -> Result<(), Error> {
        let candidate = envelope.message.ice_candidate()?;
        if let Some(peer) = &self.remote_peer {
            if *peer != envelope.from {
                return Err(Error::out_of_order(
                    "ice candidate",
                    format!("{} is not the remote peer {}", envelope.from, peer),
                ));
            }
        }
        if self.remote_description_set {
            return self.apply_candidate(candidate).await;
        }
        if self.pending_remote_candidates.len() >= MAX_PENDING_CANDIDATES {
            return Err(Error::out_of_order(
                "ice candidate",
                format!("{MAX_PENDING_CANDIDATES} candidates already waiting for a remote description"),
            ));
        }
        self.pending_remote_candidates
            .push_back((envelope.from, candidate));
        debug!(
            "{}: buffering candidate until the remote description is set ({} pending)",
            self.participant,
            self.pending_remote_candidates.len()
        );
        Ok(())
    }

    async fn apply_candidate(&mut self, candidate: IceCandidate) -> Result<(), Error> {
        let applied = self
            .bounded("add ice candidate", self.transport.add_ice_candidate(candidate))
            .await;
        match applied {
            Ok(()) => Ok(()),
            Err(e @ Error::Cancelled(_)) => Err(self.abandon(e).await),
            Err(e) => {
                warn!("{}: dropping remote candidate: {}", self.participant, e);
                Err(e)
            }
        }
    }

    async fn apply_pending_candidates(&mut self) -> Result<(), Error> {
        if !self.pending_remote_candidates.is_empty() {
            debug!(
                "{}: applying {} buffered candidate(s)",
                self.participant,
                self.pending_remote_candidates.len()
            );
        }
        while let Some((from, candidate)) = self.pending_remote_candidates.pop_front() {
            if self.remote_peer.as_ref() != Some(&from) {
                debug!(
                    "{}: discarding buffered candidate from {}, not the remote peer",
                    self.participant, from
                );
                continue;
            }
            match self.apply_candidate(candidate).await {
                Ok(()) => {}
                Err(e @ Error::Cancelled(_)) => return Err(e),
                // already logged, the remaining candidates may still work
                Err(_) => {}
            }
        }
        Ok(())
    }

    async fn on_transport_event(&mut self, event: TransportEvent) -> Result<(), Error> {
        match event {
            TransportEvent::IceCandidate(candidate) => self.transmit(Envelope::candidate(
                self.participant.clone(),
                self.channel.clone(),
                &candidate,
            )),
            TransportEvent::Track(stream) => {
                self.on_remote_track(stream);
                Ok(())
            }
            TransportEvent::ConnectionStateChange(state) => self.on_connection_state(state).await,
        }
    }

    /// Tracks of one remote stream arrive one event at a time, each carrying the
    /// whole stream. They are merged into a single entry per stream id.
    fn on_remote_track(&mut self, stream: MediaStream) {
        let merged = match self.remote_streams.iter_mut().find(|s| s.id == stream.id) {
            Some(known) => {
                let before = known.tracks.len();
                for track in stream.tracks {
                    if !known.tracks.iter().any(|t| t.id == track.id) {
                        known.tracks.push(track);
                    }
                }
                if known.tracks.len() == before {
                    debug!("{}: no new track in stream {}", self.participant, known.id);
                    return;
                }
                known.clone()
            }
            None => {
                self.remote_streams.push(stream.clone());
                stream
            }
        };
        info!(
            "{}: remote stream {} now has {} track(s)",
            self.participant,
            merged.id,
            merged.tracks.len()
        );
        if let Some(sink) = &self.remote_stream_tx {
            if sink.send(merged).is_err() {
                debug!("{}: nobody is rendering remote streams", self.participant);
            }
        }
    }

    async fn on_connection_state(&mut self, state: ConnectionState) -> Result<(), Error> {
        match state {
            ConnectionState::Connected => {
                if !self.remote_description_set {
                    return Err(Error::out_of_order(
                        "connected",
                        "no remote description has been set",
                    ));
                }
                self.connect_deadline = None;
                self.transition(ConnectionPhase::Connected);
                Ok(())
            }
            ConnectionState::Failed | ConnectionState::Closed => {
                self.teardown(ConnectionPhase::Closed).await;
                Err(Error::TransportFatal(state))
            }
            ConnectionState::Disconnected => {
                warn!("{}: transport connection interrupted", self.participant);
                Ok(())
            }
            ConnectionState::New | ConnectionState::Connecting => {
                debug!("{}: transport is {:?}", self.participant, state);
                Ok(())
            }
        }
    }

    fn transmit(&self, envelope: Envelope) -> Result<(), Error> {
        self.signaller
            .signal(ClientMessage::Message(envelope.into()))
    }

    fn arm_connect_deadline(&mut self) {
        if self.connect_deadline.is_none() {
            self.connect_deadline = Some(Instant::now() + self.timeouts.connect);
        }
    }

    pub(crate) fn transition(&mut self, next: ConnectionPhase) {
        if self.phase != next {
            info!("{}: {:?} -> {:?}", self.participant, self.phase, next);
            self.phase = next;
            self.phase_tx.send_replace(next);
        }
    }

    /// Run one transport step, bounded by the description timeout and abandoned
    /// as soon as the session is closed.
    async fn bounded<O, F>(&self, operation: &'static str, step: F) -> Result<O, Error>
    where
        F: Future<Output = Result<O, TransportError>>,
    {
        let mut closed = self.close_tx.subscribe();
        tokio::select! {
            outcome = tokio::time::timeout(self.timeouts.description, step) => match outcome {
                Ok(result) => {
                    result.map_err(|source| Error::TransportNegotiation { operation, source })
                }
                Err(_) => Err(Error::DescriptionTimeout(operation)),
            },
            _ = wait_closed(&mut closed) => Err(Error::Cancelled(operation)),
        }
    }

    /// End the session after a failed step.
    async fn abandon(&mut self, error: Error) -> Error {
        let phase = match error {
            Error::Cancelled(_) => ConnectionPhase::Closed,
            _ => ConnectionPhase::Failed,
        };
        warn!("{}: {}, ending session", self.participant, error);
        self.teardown(phase).await;
        error
    }

    pub(crate) async fn teardown(&mut self, phase: ConnectionPhase) {
        if self.phase.is_terminal() {
            return;
        }
        self.transition(phase);
        self.connect_deadline = None;
        self.call_requested = false;
        if !self.pending_remote_candidates.is_empty() {
            debug!(
                "{}: discarding {} buffered candidate(s)",
                self.participant,
                self.pending_remote_candidates.len()
            );
            self.pending_remote_candidates.clear();
        }
        self.close_tx.send_replace(true);
        if tokio::time::timeout(self.timeouts.description, self.transport.close())
            .await
            .is_err()
        {
            warn!("{}: transport did not close in time", self.participant);
        }
    }
}

fn expect_sdp_type(expected: SdpType, actual: SdpType) -> Result<(), ProtocolError> {
    if expected == actual {
        Ok(())
    } else {
        Err(ProtocolError::UnexpectedSdpType { expected, actual })
    }
}

/// Resolves once the close flag is raised.
pub(crate) async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    let raised = closed.wait_for(|closed| *closed).await.is_ok();
    if !raised {
        // sender gone, the session can no longer be closed
        std::future::pending::<()>().await;
    }
}
