use std::sync::Arc;

use parley_db::{Database, Stores};
use parley_gateway::{Broker, DeliveryReceiver};
use parley_types::events::{ChangeEvent, ChangeSink, SubscriptionFilter};
use parley_types::models::{MessageStatus, UserId};

struct Harness {
    broker: Broker,
    stores: Stores,
    ada: UserId,
    bob: UserId,
}

fn harness(queue_capacity: usize) -> Harness {
    let broker = Broker::new(queue_capacity);
    let db = Arc::new(Database::open_in_memory().unwrap());
    let sink: Arc<dyn ChangeSink> = Arc::new(broker.clone());
    let stores = Stores::new(db, sink);
    let ada = stores.users.create("ada@example.com", "Ada", "x").unwrap().id;
    let bob = stores.users.create("bob@example.com", "Bob", "x").unwrap().id;
    Harness { broker, stores, ada, bob }
}

fn drain(rx: &mut DeliveryReceiver) -> Vec<ChangeEvent> {
    std::iter::from_fn(|| rx.try_recv()).map(|d| d.event).collect()
}

#[test]
fn send_then_read_reaches_both_sides() {
    let h = harness(64);

    let (ada_conn, mut ada_rx) = h.broker.connect(h.ada);
    let (bob_conn, mut bob_rx) = h.broker.connect(h.bob);
    h.broker
        .subscribe(ada_conn, SubscriptionFilter::Outgoing { user_id: h.ada })
        .unwrap();
    h.broker
        .subscribe(bob_conn, SubscriptionFilter::Incoming { user_id: h.bob })
        .unwrap();

    let sent = h.stores.messages.send(h.ada, h.bob, "hi").unwrap();

    let bob_events = drain(&mut bob_rx);
    assert_eq!(bob_events.len(), 1);
    let ChangeEvent::MessageInserted { message } = &bob_events[0] else {
        panic!("expected an insert, got {:?}", bob_events[0]);
    };
    assert_eq!(message.content, "hi");
    assert_eq!(message.status, MessageStatus::Sent);
    assert_eq!(message, &sent);

    // Ada's outgoing subscription saw her own insert first
    assert!(matches!(drain(&mut ada_rx).as_slice(), [ChangeEvent::MessageInserted { .. }]));

    h.stores.messages.mark_read(sent.id, h.bob).unwrap();

    let ada_events = drain(&mut ada_rx);
    assert_eq!(ada_events.len(), 1);
    let ChangeEvent::MessageUpdated { message } = &ada_events[0] else {
        panic!("expected an update, got {:?}", ada_events[0]);
    };
    assert_eq!(message.id, sent.id);
    assert_eq!(message.status, MessageStatus::Read);
    assert!(message.read_at.is_some());
}

#[test]
fn reconnecting_client_recovers_from_the_log() {
    let h = harness(64);

    let (bob_conn, mut bob_rx) = h.broker.connect(h.bob);
    h.broker
        .subscribe(bob_conn, SubscriptionFilter::Incoming { user_id: h.bob })
        .unwrap();
    h.stores.messages.send(h.ada, h.bob, "before").unwrap();
    assert_eq!(drain(&mut bob_rx).len(), 1);

    h.broker.disconnect(bob_conn);
    for text in ["one", "two", "three"] {
        h.stores.messages.send(h.ada, h.bob, text).unwrap();
    }

    let (bob_conn, mut bob_rx) = h.broker.connect(h.bob);
    h.broker
        .subscribe(bob_conn, SubscriptionFilter::Incoming { user_id: h.bob })
        .unwrap();
    assert!(drain(&mut bob_rx).is_empty());

    let history: Vec<String> = h
        .stores
        .messages
        .list_conversation(h.bob, h.ada)
        .unwrap()
        .into_iter()
        .map(|m| m.content)
        .collect();
    assert_eq!(history, vec!["before", "one", "two", "three"]);
}

#[test]
fn overflow_gaps_are_recoverable_from_the_log() {
    let h = harness(2);

    let (bob_conn, mut bob_rx) = h.broker.connect(h.bob);
    h.broker
        .subscribe(bob_conn, SubscriptionFilter::Incoming { user_id: h.bob })
        .unwrap();
    for i in 0..5 {
        h.stores.messages.send(h.ada, h.bob, &format!("m{}", i)).unwrap();
    }

    let seen = drain(&mut bob_rx);
    assert_eq!(seen.len(), 2);
    assert_eq!(bob_rx.dropped(), 3);

    let last_seen = seen.last().and_then(|e| e.message()).unwrap().id;
    let all = h.stores.messages.list_conversation(h.bob, h.ada).unwrap();
    assert_eq!(all.len(), 5);
    assert_eq!(all.last().unwrap().id, last_seen);
}

#[test]
fn typing_reaches_only_the_partner_subscription() {
    let h = harness(64);
    let cy = h.stores.users.create("cy@example.com", "Cy", "x").unwrap().id;

    let (bob_conn, mut bob_rx) = h.broker.connect(h.bob);
    h.broker
        .subscribe(bob_conn, SubscriptionFilter::Typing { user_id: h.bob, partner_id: h.ada })
        .unwrap();

    h.stores.typing.set_typing(h.ada, h.bob, true).unwrap();
    h.stores.typing.set_typing(h.ada, cy, true).unwrap();
    h.stores.typing.set_typing(cy, h.bob, true).unwrap();
    h.stores.typing.set_typing(h.ada, h.bob, false).unwrap();

    let flags: Vec<bool> = drain(&mut bob_rx)
        .into_iter()
        .map(|e| match e {
            ChangeEvent::TypingChanged { indicator } => {
                assert_eq!(indicator.user_id, h.ada);
                indicator.is_typing
            }
            other => panic!("unexpected {:?}", other),
        })
        .collect();
    assert_eq!(flags, vec![true, false]);
}

#[test]
fn presence_flows_to_presence_subscribers() {
    let h = harness(64);
    let (conn, mut rx) = h.broker.connect(h.ada);
    h.broker.subscribe(conn, SubscriptionFilter::Presence).unwrap();

    h.stores.presence.set_online(h.bob, true).unwrap();
    h.stores.presence.set_online(h.bob, false).unwrap();

    let states: Vec<(UserId, bool)> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            ChangeEvent::PresenceChanged { presence } => Some((presence.user_id, presence.is_online)),
            _ => None,
        })
        .collect();
    assert_eq!(states, vec![(h.bob, true), (h.bob, false)]);
}
