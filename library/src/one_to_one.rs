/*!
One-to-one call between two participants of a channel.

[`NetworkManager`] connects to the relay, captures local media, joins the channel and then
drives the negotiation until the session ends:

```no_run
# use callpeer::one_to_one::NetworkManager;
# use callpeer::{MediaSource, SessionConfig, Transport};
# async fn call(transport: impl Transport + 'static, camera: &dyn MediaSource) -> Result<(), callpeer::Error> {
let config = SessionConfig::default();
let manager = NetworkManager::start(&config, None, "LongVideo".into(), transport, camera).await?;
manager.start_call()?;
# Ok(())
# }
```
 */

use log::{debug, info, warn};
use tokio::sync::mpsc;
use uuid::Uuid;

use callpeer_protocol::one_to_one::{ClientMessage, ServerMessage};
use callpeer_protocol::{ChannelId, ParticipantId};

use crate::config::SessionConfig;
use crate::error::Error;
use crate::media::{MediaSource, MediaStream};
use crate::negotiation::{ConnectionPhase, Negotiator, SessionEvent};
use crate::relay::RelayConnection;
use crate::session::SessionHandle;
use crate::transport::Transport;

pub struct NetworkManager {
    participant: ParticipantId,
    channel: ChannelId,
    session: SessionHandle,
    relay: mpsc::UnboundedSender<ClientMessage>,
    remote_streams: Option<mpsc::UnboundedReceiver<MediaStream>>,
}

impl NetworkManager {
    /// Set up a call in `channel`. Without a `participant` id a random one is used.
    ///
    /// Fails without creating a session when the relay is unreachable or local media
    /// cannot be captured.
    pub async fn start<T: Transport + 'static>(
        config: &SessionConfig,
        participant: Option<ParticipantId>,
        channel: ChannelId,
        transport: T,
        media: &dyn MediaSource,
    ) -> Result<Self, Error> {
        let participant =
            participant.unwrap_or_else(|| ParticipantId::new(Uuid::new_v4().to_string()));
        let RelayConnection { outbound, inbound } =
            RelayConnection::connect(&config.relay_url).await?;

        let (stream_tx, stream_rx) = mpsc::unbounded_channel();
        let mut negotiator = Negotiator::new(
            participant.clone(),
            channel.clone(),
            transport,
            outbound.clone(),
            config.timeouts(),
        )
        .with_remote_stream_sink(stream_tx);
        negotiator.start_media(media, config.media).await?;
        let session = negotiator.spawn();

        tokio::spawn(pump(
            inbound,
            outbound.clone(),
            session.clone(),
            participant.clone(),
            channel.clone(),
        ));
        info!("{participant}: joining {channel}");

        Ok(NetworkManager {
            participant,
            channel,
            session,
            relay: outbound,
            remote_streams: Some(stream_rx),
        })
    }

    pub fn participant(&self) -> &ParticipantId {
        &self.participant
    }

    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.session.phase()
    }

    /// Offer a call to the other member of the channel.
    pub fn start_call(&self) -> Result<(), Error> {
        self.session.start_call()
    }

    /// Answer the call offered in the channel.
    pub fn join_call(&self) -> Result<(), Error> {
        self.session.join_call()
    }

    /// Remote streams as the transport reports them. Only available once.
    pub fn remote_streams(&mut self) -> Option<mpsc::UnboundedReceiver<MediaStream>> {
        self.remote_streams.take()
    }

    /// Leave the channel and close the session.
    pub fn hangup(&self) {
        let leave = ClientMessage::Leave {
            channel: self.channel.clone(),
            participant: self.participant.clone(),
        };
        if self.relay.send(leave).is_err() {
            debug!("{}: relay already gone", self.participant);
        }
        self.session.hangup();
    }
}

impl Drop for NetworkManager {
    fn drop(&mut self) {
        if !self.session.phase().is_terminal() {
            self.hangup();
        }
    }
}

/// Feed relay deliveries into the session.
async fn pump(
    mut inbound: mpsc::UnboundedReceiver<ServerMessage>,
    relay: mpsc::UnboundedSender<ClientMessage>,
    session: SessionHandle,
    participant: ParticipantId,
    channel: ChannelId,
) {
    while let Some(message) = inbound.recv().await {
        let event = match message {
            ServerMessage::Connected => {
                let join = ClientMessage::Join {
                    channel: channel.clone(),
                    participant: participant.clone(),
                };
                if relay.send(join).is_err() {
                    break;
                }
                continue;
            }
            ServerMessage::Ready {
                channel,
                participant: joined,
            } => {
                if joined != participant {
                    warn!("{participant}: relay acknowledged {joined} instead");
                }
                SessionEvent::Ready(channel)
            }
            ServerMessage::Message(envelope) => SessionEvent::Envelope(envelope.into()),
            ServerMessage::Error { reason } => SessionEvent::RelayError(reason),
            ServerMessage::Close => SessionEvent::RelayClosed,
        };
        if session.send(event).is_err() {
            break;
        }
    }
    debug!("{participant}: stopped listening to the relay");
}
