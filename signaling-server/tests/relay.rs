use serde_json::json;
use warp::test::WsClient;
use warp::ws::Message;

use callpeer_protocol::one_to_one::{ClientMessage, ServerMessage};
use callpeer_protocol::{ChannelId, ParticipantId, SignalKind, WireFormat};
use callpeer_signaling_server::{routes, Registry};

async fn connect(registry: &Registry, path: &str) -> WsClient {
    let mut client = warp::test::ws()
        .path(path)
        .handshake(routes(registry.clone()))
        .await
        .expect("handshake");
    assert_eq!(recv(&mut client).await, ServerMessage::Connected);
    client
}

async fn recv(client: &mut WsClient) -> ServerMessage {
    let frame = client.recv().await.expect("server message");
    if frame.is_text() {
        serde_json::from_str(frame.to_str().unwrap()).unwrap()
    } else {
        callpeer_protocol::decode(WireFormat::Msgpack, frame.as_bytes()).unwrap()
    }
}

async fn join(client: &mut WsClient, channel: &str, participant: &str) {
    let join = ClientMessage::Join {
        channel: channel.into(),
        participant: participant.into(),
    };
    client.send_text(serde_json::to_string(&join).unwrap()).await;
    assert_eq!(
        recv(client).await,
        ServerMessage::Ready {
            channel: ChannelId::new(channel),
            participant: ParticipantId::new(participant),
        }
    );
}

#[tokio::test]
async fn test_join_is_acknowledged_in_requested_format() {
    let registry = Registry::default();
    let mut json_client = connect(&registry, "/signaling?format=json").await;
    join(&mut json_client, "LongVideo", "long").await;

    let mut msgpack_client = connect(&registry, "/signaling").await;
    let join = ClientMessage::Join {
        channel: "LongVideo".into(),
        participant: "short".into(),
    };
    let frame = callpeer_protocol::encode(WireFormat::Msgpack, &join).unwrap();
    msgpack_client.send(Message::binary(frame)).await;
    let reply = msgpack_client.recv().await.unwrap();
    assert!(reply.is_binary());

    let mut members = registry.members(&"LongVideo".into()).await;
    members.sort_by(|a, b| a.as_str().cmp(b.as_str()));
    assert_eq!(members, vec![ParticipantId::new("long"), ParticipantId::new("short")]);
}

#[tokio::test]
async fn test_offer_is_relayed_to_other_member() {
    let registry = Registry::default();
    let mut a = connect(&registry, "/signaling?format=json").await;
    let mut b = connect(&registry, "/signaling?format=json").await;
    join(&mut a, "room1", "a").await;
    join(&mut b, "room1", "b").await;

    let offer = json!({
        "event": "message",
        "data": {
            "from": "a",
            "to": "room1",
            "signal": "offer",
            "message": {"type": "offer", "sdp": "v=0"}
        }
    });
    a.send_text(offer.to_string()).await;

    match recv(&mut b).await {
        ServerMessage::Message(envelope) => {
            assert_eq!(envelope.from, ParticipantId::new("a"));
            assert_eq!(envelope.signal, SignalKind::Offer);
            assert_eq!(envelope.message.session_description().unwrap().sdp, "v=0");
        }
        other => panic!("expected the offer, got {other:?}"),
    }
}

#[tokio::test]
async fn test_malformed_requests_get_error_and_connection_survives() {
    let registry = Registry::default();
    let mut a = connect(&registry, "/signaling?format=json").await;

    a.send_text("not even json").await;
    assert!(matches!(recv(&mut a).await, ServerMessage::Error { .. }));

    let empty_channel = json!({"event": "join", "data": {"channel": "", "participant": "a"}});
    a.send_text(empty_channel.to_string()).await;
    assert!(matches!(recv(&mut a).await, ServerMessage::Error { .. }));

    let bogus = json!({
        "event": "message",
        "data": {"from": "a", "to": "room1", "signal": "bogus", "message": {}}
    });
    a.send_text(bogus.to_string()).await;
    match recv(&mut a).await {
        ServerMessage::Error { reason } => assert!(reason.contains("bogus")),
        other => panic!("expected an error, got {other:?}"),
    }
    assert_eq!(registry.channel_count().await, 0);

    join(&mut a, "room1", "a").await;
}

#[tokio::test]
async fn test_disconnect_leaves_channel() {
    let registry = Registry::default();
    let mut a = connect(&registry, "/signaling?format=json").await;
    join(&mut a, "room1", "a").await;
    assert_eq!(registry.channel_count().await, 1);

    drop(a);
    for _ in 0..100 {
        if registry.channel_count().await == 0 {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("channel was not released after disconnect");
}
