//! End-to-end client behaviour against the in-memory transport.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use folkmq_client::{
    Entity, Frame, MemoryConnector, MemorySession, MemorySessionGroup, MqClient, MqError,
    MqMessage, Outbound, Qos, Session, TransportError,
};
use folkmq_proto::{metas, parse_batch_subscribe, MqEvent};
use tokio_test::{assert_err, assert_ok};

const URL: &str = "folkmq://127.0.0.1:18602";

async fn connected(
    name: &str,
    connector: MemoryConnector,
) -> (MqClient, Arc<MemorySessionGroup>, Arc<MemoryConnector>) {
    let connector = Arc::new(connector);
    let client = MqClient::new(connector.clone(), [URL]).name_as(name);
    assert_ok!(client.connect().await);
    let group = connector.last_group().expect("group opened");
    (client, group, connector)
}

fn requests(session: &MemorySession) -> Vec<(MqEvent, Entity)> {
    session
        .outbound()
        .into_iter()
        .filter_map(|out| match out {
            Outbound::Request { event, entity } => Some((event, entity)),
            _ => None,
        })
        .collect()
}

fn distribute(sid: &str, topic: &str, group: &str) -> Frame {
    Frame::new(
        sid,
        MqEvent::Distribute,
        Entity::from_string("order created")
            .meta_put(metas::TOPIC, topic)
            .meta_put(metas::CONSUMER_GROUP, group)
            .meta_put(metas::KEY, "order-1"),
    )
}

#[tokio::test]
async fn qos1_publish_follows_confirm_flag() {
    let connector = MemoryConnector::new(1).with_responder(Arc::new(|event, entity| {
        let accepted = entity.meta(metas::TOPIC) != Some("full");
        let response = if accepted {
            Entity::new().meta_put(metas::CONFIRM, "1")
        } else {
            Entity::from_string("topic is full").meta_put(metas::CONFIRM, "0")
        };
        assert_eq!(event, MqEvent::Publish);
        Some(response)
    }));
    let (client, group, _) = connected("A", connector).await;

    assert_ok!(client.publish("orders", MqMessage::new("hello")).await);

    let err = assert_err!(client.publish("full", MqMessage::new("hello")).await);
    assert!(matches!(
        &err,
        MqError::ConfirmFailed { operation: "publish", message } if message == "topic is full"
    ));
    assert!(!err.is_connectivity());
    assert_eq!(requests(group.session(0)).len(), 2);
}

#[tokio::test]
async fn qos0_publish_does_not_wait() {
    let connector = MemoryConnector::new(1).with_responder(Arc::new(|_, _| None));
    let (client, group, _) = connected("A", connector).await;

    let publish = client.publish("orders", MqMessage::new("hello").qos(Qos::AtMostOnce));
    assert_ok!(assert_ok!(tokio::time::timeout(Duration::from_millis(100), publish).await));

    let outbound = group.session(0).outbound();
    assert_eq!(outbound.len(), 1);
    assert!(matches!(&outbound[0], Outbound::Send { event: MqEvent::Publish, .. }));
}

#[tokio::test]
async fn not_connected_and_timeout_are_distinct() {
    let connector = Arc::new(MemoryConnector::new(1).with_responder(Arc::new(|_, _| None)));
    let client = MqClient::new(connector.clone(), [URL])
        .name_as("A")
        .config(|config| config.request_timeout = Duration::from_millis(20));

    let err = assert_err!(client.publish("orders", MqMessage::new("x")).await);
    assert!(matches!(err, MqError::NotConnected));
    assert!(err.is_connectivity());

    assert_ok!(client.connect().await);
    let err = assert_err!(client.publish("orders", MqMessage::new("x")).await);
    assert!(matches!(err, MqError::Transport(TransportError::Timeout(_))));
    assert!(err.is_connectivity());

    let group = connector.last_group().expect("group opened");
    group.session(0).set_valid(false);
    let err = assert_err!(client.publish("orders", MqMessage::new("x")).await);
    assert!(matches!(err, MqError::NoSessionAvailable));
}

#[tokio::test]
async fn transaction_stays_on_one_session() {
    let (client, group, _) = connected("A", MemoryConnector::new(4)).await;

    let tran = assert_ok!(client.new_transaction());
    for (topic, key) in [("orders", "k1"), ("payments", "k2"), ("shipping", "k3")] {
        let message = tran.bind(MqMessage::new("x").key(key));
        assert_ok!(client.publish(topic, message).await);
    }
    let tmid = tran.tmid().to_string();
    assert_ok!(tran.commit().await);

    let busy = group
        .sessions()
        .iter()
        .filter(|session| !session.outbound().is_empty())
        .collect::<Vec<_>>();
    assert_eq!(busy.len(), 1);

    let traffic = requests(busy[0]);
    assert_eq!(traffic.len(), 4);
    for (event, entity) in &traffic[..3] {
        assert_eq!(*event, MqEvent::Publish);
        assert_eq!(entity.meta(metas::TRANSACTION), Some(tmid.as_str()));
    }
    let (event, commit) = &traffic[3];
    assert_eq!(*event, MqEvent::Publish2);
    assert_eq!(commit.data_as_string(), "k1,k2,k3");
    assert_eq!(commit.meta(metas::ROLLBACK), Some("0"));
}

#[tokio::test]
async fn empty_commit_makes_no_call() {
    let (client, group, _) = connected("A", MemoryConnector::new(2)).await;

    let tran = assert_ok!(client.new_transaction());
    assert_ok!(tran.commit().await);

    assert!(group.sessions().iter().all(|s| s.outbound().is_empty()));
}

#[tokio::test]
async fn delivery_invokes_handler_once_and_acks() {
    let (client, group, _) = connected("A", MemoryConnector::new(1)).await;
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    assert_ok!(
        client
            .subscribe("orders", Some("A"), None, move |message| {
                assert_eq!(message.body_as_string(), "order created");
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
    );
    let session = group.session(0);
    let subscribe = requests(session);
    assert_eq!(subscribe.len(), 1);
    assert_eq!(subscribe[0].0, MqEvent::Subscribe);
    assert_eq!(subscribe[0].1.meta(metas::CONSUMER_GROUP), Some("A"));
    session.take_outbound();

    group.deliver(0, distribute("sid-7", "orders", "A"));

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let outbound = session.outbound();
    assert_eq!(outbound.len(), 1);
    let Outbound::Ack { sid, entity } = &outbound[0] else {
        panic!("expected an ack, got {outbound:?}");
    };
    assert_eq!(sid, "sid-7");
    assert_eq!(entity.meta(metas::ACK), Some("1"));
}

#[tokio::test]
async fn unmatched_delivery_gets_one_nack() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let (client, group, _) = connected("A", MemoryConnector::new(1)).await;
    assert_ok!(
        client
            .subscribe("orders", None, None, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
    );
    group.session(0).take_outbound();

    group.deliver(0, distribute("sid-8", "orders", "B"));

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    let outbound = group.session(0).outbound();
    assert_eq!(outbound.len(), 1);
    assert!(matches!(
        &outbound[0],
        Outbound::Ack { sid, entity } if sid == "sid-8" && entity.meta(metas::ACK) == Some("0")
    ));
}

#[tokio::test]
async fn checkback_without_handler_raises_alarm() {
    let (_client, group, _) = connected("A", MemoryConnector::new(1)).await;

    group.deliver(
        0,
        Frame::new(
            "sid-9",
            MqEvent::Request,
            Entity::new()
                .meta_put(metas::TRANSACTION, "tm-1")
                .meta_put(metas::KEY, "k1"),
        ),
    );

    let outbound = group.session(0).outbound();
    assert_eq!(outbound.len(), 1);
    let Outbound::Alarm { sid, text } = &outbound[0] else {
        panic!("expected an alarm, got {outbound:?}");
    };
    assert_eq!(sid, "sid-9");
    assert!(text.contains("no checkback handler"));
}

#[tokio::test]
async fn checkback_handler_votes() {
    let (client, group, _) = connected("A", MemoryConnector::new(1)).await;
    client.transaction_checkback(|message| {
        let commit = message.key() != "k-bad";
        Ok(message.acknowledge(commit)?)
    });

    for key in ["k-good", "k-bad"] {
        group.deliver(
            0,
            Frame::new(
                key,
                MqEvent::Request,
                Entity::new()
                    .meta_put(metas::TRANSACTION, "tm-1")
                    .meta_put(metas::KEY, key),
            ),
        );
    }

    let votes = group
        .session(0)
        .outbound()
        .into_iter()
        .map(|out| match out {
            Outbound::Ack { sid, entity } => (sid, entity.meta(metas::ACK).map(str::to_string)),
            other => panic!("unexpected {other:?}"),
        })
        .collect::<Vec<_>>();
    assert_eq!(
        votes,
        vec![
            ("k-good".to_string(), Some("1".to_string())),
            ("k-bad".to_string(), Some("0".to_string())),
        ]
    );
}

#[tokio::test]
async fn subscriptions_are_restored_on_reconnect() {
    let connector = Arc::new(MemoryConnector::new(2));
    let client = MqClient::new(connector.clone(), [URL])
        .name_as("A")
        .namespace_as("prod");

    assert_ok!(client.subscribe("orders", None, None, |_| Ok(())).await);
    assert_ok!(client.subscribe("orders", Some("audit"), None, |_| Ok(())).await);
    assert_ok!(client.subscribe("payments", None, None, |_| Ok(())).await);
    assert_ok!(client.connect().await);

    let group = connector.last_group().expect("group opened");
    for session in group.sessions() {
        let traffic = requests(session);
        assert_eq!(traffic.len(), 1);
        let (event, entity) = &traffic[0];
        assert_eq!(*event, MqEvent::Subscribe);
        assert_eq!(entity.meta(metas::BATCH), Some("1"));

        let queues = assert_ok!(parse_batch_subscribe(entity));
        assert_eq!(queues.len(), 2);
        assert_eq!(queues["prod:orders"].len(), 2);
        assert!(queues["prod:orders"].contains("prod:orders#audit"));
        assert!(queues["prod:payments"].contains("prod:payments#A"));
    }

    assert_ok!(client.unsubscribe("orders", Some("audit")).await);
    client.disconnect().await;
    assert!(!client.is_connected());
    assert!(group.sessions().iter().all(|s| !s.is_valid()));

    assert_ok!(client.connect().await);
    let group = connector.last_group().expect("group reopened");
    let traffic = requests(group.session(1));
    let queues = assert_ok!(parse_batch_subscribe(&traffic[0].1));
    assert_eq!(queues["prod:orders"].len(), 1);
    assert_eq!(client.subscriptions().len(), 2);

    group.session(1).take_outbound();
    group.reopen(1).await;
    assert_eq!(requests(group.session(1)).len(), 1);
}

#[tokio::test]
async fn send_returns_peer_reply() {
    let connector = MemoryConnector::new(1).with_responder(Arc::new(|event, entity| {
        assert_eq!(event, MqEvent::Request);
        let reply = if entity.data_as_string() == "ping" {
            Entity::from_string("pong").meta_put(metas::ACK, "1")
        } else {
            Entity::from_string("unknown command").meta_put(metas::ACK, "0")
        };
        Some(reply)
    }));
    let (client, group, _) = connected("A", connector).await;

    let reply = assert_ok!(client.send(MqMessage::new("ping"), "B", None).await);
    assert_eq!(reply.map(|r| r.data_as_string()), Some("pong".to_string()));

    let err = assert_err!(client.send(MqMessage::new("dance"), "B", None).await);
    assert!(matches!(err, MqError::ConfirmFailed { operation: "send", .. }));

    let none = assert_ok!(
        client
            .send(MqMessage::new("fyi").qos(Qos::AtMostOnce), "B", None)
            .await
    );
    assert!(none.is_none());

    let traffic = requests(group.session(0));
    let (_, request) = &traffic[0];
    assert_eq!(request.meta(metas::SENDER), Some("A"));
    assert_eq!(request.meta(metas::CONSUMER_GROUP), Some("B"));
    assert_eq!(request.meta(metas::AT), Some("B"));
    assert_eq!(request.meta(metas::TOPIC), Some(""));
}
