use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::{mpsc, Mutex, RwLock};

use callpeer_protocol::one_to_one::ServerMessage;
use callpeer_protocol::{ChannelId, ParticipantId, RawEnvelope};

use crate::RelayError;

/// Sending half of a connection's outbound queue.
pub type Outbox = mpsc::UnboundedSender<ServerMessage>;

/// Server-assigned identifier of one websocket connection.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

struct Member {
    connection: ConnectionId,
    outbox: Outbox,
}

#[derive(Default)]
struct Channel {
    members: HashMap<ParticipantId, Member>,
    // set once the channel has been unlinked from the registry map
    released: bool,
}

/// Which participants are currently present in which channel.
///
/// Every channel has its own lock, so joins, leaves and routing within one
/// channel are serialized while different channels proceed independently. The
/// outer map lock is only held to look up, insert or unlink a channel entry.
#[derive(Clone, Default)]
pub struct Registry {
    channels: Arc<RwLock<HashMap<ChannelId, Arc<Mutex<Channel>>>>>,
}

impl Registry {
    /// Add `participant` to `channel` and acknowledge with `ready` to that participant only.
    ///
    /// Joining again under the same identity keeps the membership as is and
    /// acknowledges again.
    pub async fn join(
        &self,
        channel: ChannelId,
        participant: ParticipantId,
        connection: ConnectionId,
        outbox: Outbox,
    ) -> Result<(), RelayError> {
        if channel.is_empty() {
            return Err(RelayError::EmptyChannel);
        }
        if participant.is_empty() {
            return Err(RelayError::EmptyParticipant);
        }

        loop {
            let entry = self.channel_entry(&channel).await;
            let mut guard = entry.lock().await;
            // lost a race against the last member leaving, look the channel up again
            if guard.released {
                drop(guard);
                tokio::task::yield_now().await;
                continue;
            }
            match guard.members.entry(participant.clone()) {
                Entry::Vacant(vacant) => {
                    vacant.insert(Member {
                        connection,
                        outbox: outbox.clone(),
                    });
                    info!("{participant} joined channel {channel} ({connection})");
                }
                Entry::Occupied(mut occupied) if occupied.get().connection != connection => {
                    warn!(
                        "{participant} joined channel {channel} again from {connection}, replacing {}",
                        occupied.get().connection
                    );
                    *occupied.get_mut() = Member {
                        connection,
                        outbox: outbox.clone(),
                    };
                }
                Entry::Occupied(_) => {
                    debug!("{participant} is already in channel {channel}");
                }
            }
            let ready = ServerMessage::Ready {
                channel: channel.clone(),
                participant: participant.clone(),
            };
            if outbox.send(ready).is_err() {
                warn!("could not acknowledge join of {participant}: connection is gone");
            }
            return Ok(());
        }
    }

    /// Validate `envelope` and hand it to every other member of the channel it is addressed to.
    ///
    /// Returns how many members it was delivered to. Having nobody to deliver
    /// to is not an error for the sender.
    pub async fn route(&self, envelope: RawEnvelope) -> Result<usize, RelayError> {
        let envelope = envelope.validate()?;
        let entry = match self.channels.read().await.get(&envelope.to) {
            Some(entry) => entry.clone(),
            None => {
                warn!(
                    "dropping {} from {}: no such channel {}",
                    envelope.signal, envelope.from, envelope.to
                );
                return Ok(0);
            }
        };

        let guard = entry.lock().await;
        let mut delivered = 0;
        for (participant, member) in guard.members.iter() {
            if *participant == envelope.from {
                continue;
            }
            match member.outbox.send(ServerMessage::Message(envelope.clone())) {
                Ok(()) => delivered += 1,
                Err(_) => warn!("{participant} in {} is no longer reachable", envelope.to),
            }
        }
        if delivered == 0 {
            warn!(
                "dropping {} from {}: nobody else in channel {}",
                envelope.signal, envelope.from, envelope.to
            );
        } else {
            debug!(
                "routed {} from {} to {delivered} member(s) of {}",
                envelope.signal, envelope.from, envelope.to
            );
        }
        Ok(delivered)
    }

    /// Remove `participant` from `channel`, releasing the channel once it is empty.
    /// Returns whether the participant was a member.
    pub async fn leave(&self, channel: &ChannelId, participant: &ParticipantId) -> bool {
        self.remove_member(channel, participant, None).await
    }

    /// Like [`Registry::leave`], but only if the membership still belongs to `connection`.
    pub(crate) async fn release(
        &self,
        channel: &ChannelId,
        participant: &ParticipantId,
        connection: ConnectionId,
    ) -> bool {
        self.remove_member(channel, participant, Some(connection))
            .await
    }

    /// Participants currently joined to `channel`.
    pub async fn members(&self, channel: &ChannelId) -> Vec<ParticipantId> {
        let entry = match self.channels.read().await.get(channel) {
            Some(entry) => entry.clone(),
            None => return Vec::new(),
        };
        let guard = entry.lock().await;
        guard.members.keys().cloned().collect()
    }

    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }

    async fn channel_entry(&self, channel: &ChannelId) -> Arc<Mutex<Channel>> {
        if let Some(entry) = self.channels.read().await.get(channel) {
            return entry.clone();
        }
        self.channels
            .write()
            .await
            .entry(channel.clone())
            .or_default()
            .clone()
    }

    async fn remove_member(
        &self,
        channel: &ChannelId,
        participant: &ParticipantId,
        owner: Option<ConnectionId>,
    ) -> bool {
        let entry = match self.channels.read().await.get(channel) {
            Some(entry) => entry.clone(),
            None => return false,
        };

        let emptied = {
            let mut guard = entry.lock().await;
            let owned = match (guard.members.get(participant), owner) {
                (None, _) => return false,
                (Some(member), Some(owner)) => member.connection == owner,
                (Some(_), None) => true,
            };
            if !owned {
                debug!("{participant} in {channel} belongs to another connection, keeping it");
                return false;
            }
            guard.members.remove(participant);
            info!("{participant} left channel {channel}");
            if guard.members.is_empty() {
                guard.released = true;
            }
            guard.released
        };

        if emptied {
            let mut channels = self.channels.write().await;
            // only unlink the entry we emptied, a fresh one may have replaced it
            if channels
                .get(channel)
                .map_or(false, |current| Arc::ptr_eq(current, &entry))
            {
                channels.remove(channel);
                info!("channel {channel} is empty, releasing it");
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn member() -> (Outbox, mpsc::UnboundedReceiver<ServerMessage>) {
        mpsc::unbounded_channel()
    }

    fn offer_from(from: &str, to: &str) -> RawEnvelope {
        RawEnvelope {
            from: Some(from.into()),
            to: Some(to.into()),
            signal: Some("offer".into()),
            message: Some(json!({"type": "offer", "sdp": "v=0"})),
        }
    }

    #[tokio::test]
    async fn test_join_sends_ready_to_joiner_only() {
        let registry = Registry::default();
        let room = ChannelId::new("room1");
        let (a_tx, mut a_rx) = member();
        let (b_tx, mut b_rx) = member();

        registry
            .join(room.clone(), "a".into(), ConnectionId(1), a_tx)
            .await
            .unwrap();
        assert!(matches!(a_rx.try_recv(), Ok(ServerMessage::Ready { .. })));

        registry
            .join(room.clone(), "b".into(), ConnectionId(2), b_tx)
            .await
            .unwrap();
        assert!(matches!(b_rx.try_recv(), Ok(ServerMessage::Ready { .. })));
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_rejoin_is_idempotent_but_acknowledged() {
        let registry = Registry::default();
        let room = ChannelId::new("room1");
        let (tx, mut rx) = member();

        for _ in 0..2 {
            registry
                .join(room.clone(), "a".into(), ConnectionId(1), tx.clone())
                .await
                .unwrap();
        }
        assert!(matches!(rx.try_recv(), Ok(ServerMessage::Ready { .. })));
        assert!(matches!(rx.try_recv(), Ok(ServerMessage::Ready { .. })));
        assert_eq!(registry.members(&room).await, vec![ParticipantId::new("a")]);
    }

    #[tokio::test]
    async fn test_route_delivers_to_others_in_channel() {
        let registry = Registry::default();
        let room = ChannelId::new("room1");
        let (a_tx, mut a_rx) = member();
        let (b_tx, mut b_rx) = member();
        let (c_tx, mut c_rx) = member();
        registry.join(room.clone(), "a".into(), ConnectionId(1), a_tx).await.unwrap();
        registry.join(room.clone(), "b".into(), ConnectionId(2), b_tx).await.unwrap();
        registry
            .join("elsewhere".into(), "c".into(), ConnectionId(3), c_tx)
            .await
            .unwrap();
        let _ = (a_rx.try_recv(), b_rx.try_recv(), c_rx.try_recv());

        let delivered = registry.route(offer_from("a", "room1")).await.unwrap();
        assert_eq!(delivered, 1);
        match b_rx.try_recv() {
            Ok(ServerMessage::Message(envelope)) => assert_eq!(envelope.from.as_str(), "a"),
            other => panic!("unexpected delivery: {other:?}"),
        }
        assert!(a_rx.try_recv().is_err());
        assert!(c_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_route_without_peers_is_silent() {
        let registry = Registry::default();
        let (a_tx, _a_rx) = member();
        registry.join("room1".into(), "a".into(), ConnectionId(1), a_tx).await.unwrap();

        assert_eq!(registry.route(offer_from("a", "room1")).await.unwrap(), 0);
        assert_eq!(registry.route(offer_from("a", "nowhere")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_malformed_requests_leave_state_unchanged() {
        let registry = Registry::default();
        let (tx, _rx) = member();

        let mut bogus = offer_from("a", "room1");
        bogus.signal = Some("bogus".into());
        assert!(registry.route(bogus).await.is_err());
        assert!(registry.route(offer_from("a", "")).await.is_err());
        assert!(matches!(
            registry.join("".into(), "a".into(), ConnectionId(1), tx.clone()).await,
            Err(RelayError::EmptyChannel)
        ));
        assert!(matches!(
            registry.join("room1".into(), " ".into(), ConnectionId(1), tx).await,
            Err(RelayError::EmptyParticipant)
        ));
        assert_eq!(registry.channel_count().await, 0);
    }

    #[tokio::test]
    async fn test_leave_releases_empty_channel() {
        let registry = Registry::default();
        let room = ChannelId::new("room1");
        let (a_tx, _a_rx) = member();
        let (b_tx, _b_rx) = member();
        registry.join(room.clone(), "a".into(), ConnectionId(1), a_tx).await.unwrap();
        registry.join(room.clone(), "b".into(), ConnectionId(2), b_tx).await.unwrap();

        assert!(registry.leave(&room, &"a".into()).await);
        assert_eq!(registry.channel_count().await, 1);
        assert!(!registry.leave(&room, &"a".into()).await);
        assert!(registry.leave(&room, &"b".into()).await);
        assert_eq!(registry.channel_count().await, 0);
    }

    #[tokio::test]
    async fn test_release_keeps_membership_taken_over_by_other_connection() {
        let registry = Registry::default();
        let room = ChannelId::new("room1");
        let (old_tx, _old_rx) = member();
        let (new_tx, _new_rx) = member();
        registry.join(room.clone(), "a".into(), ConnectionId(1), old_tx).await.unwrap();
        registry.join(room.clone(), "a".into(), ConnectionId(2), new_tx).await.unwrap();

        assert!(!registry.release(&room, &"a".into(), ConnectionId(1)).await);
        assert_eq!(registry.members(&room).await.len(), 1);
        assert!(registry.release(&room, &"a".into(), ConnectionId(2)).await);
        assert_eq!(registry.channel_count().await, 0);
    }
}
