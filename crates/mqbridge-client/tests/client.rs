//! Client behaviour against the in-process mock library.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use mqbridge_client::{
    Client, ClientConfig, ClientError, ClientState, MockBroker, MockOp, PublicationConfig, QoS,
    ReconnectBackoff, Subscription, SubscriptionConfig, SubscriptionParams,
};

fn config() -> ClientConfig {
    ClientConfig::new("tcp://localhost:1883")
        .id("test-client")
        .max_reply_timeout(Duration::from_secs(2))
        .connect_timeout(Duration::from_secs(2))
        .reconnect_backoff(ReconnectBackoff {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            multiplier: 2.0,
        })
}

fn client(broker: &MockBroker, config: ClientConfig) -> Client {
    Client::new(config, broker.factory()).unwrap()
}

fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(5));
    }
}

fn topics(batch: &[SubscriptionParams]) -> Vec<&str> {
    batch.iter().map(|p| p.topic.as_str()).collect()
}

#[test]
fn test_connect_submits_registered_subscriptions() {
    let broker = MockBroker::new();
    let client = client(&broker, config());

    let _sub = client
        .subscribe(SubscriptionConfig::new(["sensors/#", "alarms/+"]).max_qos(QoS::AtLeastOnce))
        .unwrap();
    assert!(broker.subscribe_batches().is_empty());

    client.connect().unwrap();
    assert_eq!(client.state(), ClientState::Connected);

    let batches = broker.subscribe_batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(topics(&batches[0]), vec!["sensors/#", "alarms/+"]);
    assert!(batches[0].iter().all(|p| p.max_qos == QoS::AtLeastOnce));
}

#[test]
fn test_connect_when_connected_is_noop() {
    let broker = MockBroker::new();
    let client = client(&broker, config());

    client.connect().unwrap();
    client.connect().unwrap();
    assert_eq!(broker.connect_count(), 1);
}

#[test]
fn test_rejected_connect_enters_error_state() {
    let broker = MockBroker::new();
    let client = client(&broker, config());

    broker.reject_next(MockOp::Connect);
    assert!(matches!(client.connect(), Err(ClientError::BrokerRejected(_))));
    assert_eq!(client.state(), ClientState::Error);

    client.connect().unwrap();
    assert_eq!(client.state(), ClientState::Connected);
}

#[test]
fn test_connect_while_connecting_is_invalid() {
    let broker = MockBroker::new();
    broker.set_auto_ack(false);
    let client = client(&broker, config());

    thread::scope(|s| {
        let connecting = s.spawn(|| client.connect());

        wait_until("connect to be held", || broker.held_count() == 1);
        assert_eq!(client.state(), ClientState::Connecting);
        assert!(matches!(client.connect(), Err(ClientError::InvalidState(_))));
        assert!(matches!(client.disconnect(), Err(ClientError::InvalidState(_))));

        assert_eq!(broker.resolve_next(Ok(())), Some(MockOp::Connect));
        connecting.join().unwrap().unwrap();
    });
    assert_eq!(client.state(), ClientState::Connected);
    broker.set_auto_ack(true);
}

#[test]
fn test_connect_times_out() {
    let broker = MockBroker::new();
    broker.set_auto_ack(false);
    let client = client(&broker, config().connect_timeout(Duration::from_millis(50)));

    assert!(matches!(client.connect(), Err(ClientError::Timeout(_))));
    assert_eq!(client.state(), ClientState::Error);

    // A late acknowledgement of the abandoned attempt changes nothing
    broker.release_all();
    assert_eq!(client.state(), ClientState::Error);
    broker.set_auto_ack(true);
}

#[test]
fn test_subscribe_while_connected_waits_for_ack() {
    let broker = MockBroker::new();
    let client = client(&broker, config());
    client.connect().unwrap();

    broker.set_auto_ack(false);
    thread::scope(|s| {
        s.spawn(|| {
            wait_until("subscribe to be held", || broker.held_count() == 1);
            broker.resolve_next(Ok(()));
        });
        client.subscribe(SubscriptionConfig::new(["a/b"])).unwrap();
    });
    broker.set_auto_ack(true);

    assert_eq!(client.subscription_count(), 1);
    assert_eq!(topics(&broker.subscribe_batches()[0]), vec!["a/b"]);
}

#[test]
fn test_rejected_subscribe_is_not_registered() {
    let broker = MockBroker::new();
    let client = client(&broker, config());
    client.connect().unwrap();

    broker.reject_next(MockOp::Subscribe);
    let result = client.subscribe(SubscriptionConfig::new(["a/b"]));
    assert!(matches!(result, Err(ClientError::BrokerRejected(_))));
    assert_eq!(client.subscription_count(), 0);
    assert_eq!(client.state(), ClientState::Error);
}

#[test]
fn test_subscribe_with_invalid_filter() {
    let broker = MockBroker::new();
    let client = client(&broker, config());

    let result = client.subscribe(SubscriptionConfig::new(["a/#/b"]));
    assert!(matches!(result, Err(ClientError::InvalidConfig(_))));
    let result = client.subscribe(SubscriptionConfig::new(Vec::<String>::new()));
    assert!(matches!(result, Err(ClientError::InvalidConfig(_))));
    assert_eq!(client.subscription_count(), 0);
}

#[test]
fn test_unsubscribe_keeps_shared_filters() {
    let broker = MockBroker::new();
    let client = client(&broker, config());
    client.connect().unwrap();

    let first = client.subscribe(SubscriptionConfig::new(["a", "b"])).unwrap();
    let _second = client.subscribe(SubscriptionConfig::new(["b"])).unwrap();

    client.unsubscribe(&first).unwrap();
    let batches = broker.unsubscribe_batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(topics(&batches[0]), vec!["a"]);

    assert!(matches!(
        client.unsubscribe(&first),
        Err(ClientError::InvalidState(_))
    ));
}

#[test]
fn test_reconnect_resubscribes_current_set() {
    let broker = MockBroker::new();
    let client = client(&broker, config());

    let _a = client.subscribe(SubscriptionConfig::new(["a/#"])).unwrap();
    client.connect().unwrap();

    broker.drop_connection("network unreachable");
    wait_until("reconnect", || broker.connect_count() == 2 && client.is_connected());

    let batches = broker.subscribe_batches();
    assert_eq!(batches.len(), 2);
    assert_eq!(topics(&batches[1]), vec!["a/#"]);
}

#[test]
fn test_changes_while_disconnected_apply_on_connect() {
    let broker = MockBroker::new();
    let client = client(&broker, config().reconnect(false));

    let a = client.subscribe(SubscriptionConfig::new(["a"])).unwrap();
    client.connect().unwrap();

    broker.drop_connection("reset by peer");
    wait_until("disconnected", || client.state() == ClientState::Disconnected);

    let _b = client.subscribe(SubscriptionConfig::new(["b"])).unwrap();
    client.unsubscribe(&a).unwrap();
    assert!(broker.unsubscribe_batches().is_empty());
    assert_eq!(broker.subscribe_batches().len(), 1);

    client.connect().unwrap();
    let batches = broker.subscribe_batches();
    assert_eq!(topics(&batches[1]), vec!["b"]);
}

#[test]
fn test_automatic_reconnect_applies_changes_made_during_backoff() {
    let broker = MockBroker::new();
    let client = client(
        &broker,
        config().reconnect_backoff(ReconnectBackoff {
            initial_delay: Duration::from_millis(300),
            max_delay: Duration::from_millis(300),
            multiplier: 1.0,
        }),
    );

    let a = client.subscribe(SubscriptionConfig::new(["a"])).unwrap();
    let _b = client.subscribe(SubscriptionConfig::new(["b"])).unwrap();
    client.connect().unwrap();

    broker.drop_connection("keep-alive timeout");
    wait_until("disconnected", || client.state() == ClientState::Disconnected);

    let _c = client.subscribe(SubscriptionConfig::new(["c"])).unwrap();
    client.unsubscribe(&a).unwrap();
    assert_eq!(broker.connect_count(), 1);

    wait_until("reconnect", || broker.connect_count() == 2 && client.is_connected());
    let batches = broker.subscribe_batches();
    assert_eq!(batches.len(), 2);
    assert_eq!(topics(&batches[1]), vec!["b", "c"]);
    assert!(broker.unsubscribe_batches().is_empty());
}

#[test]
fn test_changes_while_connecting_reach_broker() {
    let broker = MockBroker::new();
    broker.set_auto_ack(false);
    let client = client(&broker, config());

    let _a = client.subscribe(SubscriptionConfig::new(["a"])).unwrap();
    let c = client.subscribe(SubscriptionConfig::new(["c"])).unwrap();

    thread::scope(|s| {
        let connecting = s.spawn(|| client.connect());

        wait_until("connect to be held", || broker.held_count() == 1);
        assert_eq!(broker.resolve_next(Ok(())), Some(MockOp::Connect));
        wait_until("resubscribe to be held", || broker.held_count() == 1);
        assert_eq!(client.state(), ClientState::Connecting);

        // Registered after the resubscribe batch was taken
        client.subscribe(SubscriptionConfig::new(["b"])).unwrap();
        client.unsubscribe(&c).unwrap();

        broker.set_auto_ack(true);
        broker.release_all();
        connecting.join().unwrap().unwrap();
    });
    assert_eq!(client.state(), ClientState::Connected);

    let batches = broker.subscribe_batches();
    assert_eq!(batches.len(), 2);
    assert_eq!(topics(&batches[0]), vec!["a", "c"]);
    assert_eq!(topics(&batches[1]), vec!["b"]);

    let cancelled = broker.unsubscribe_batches();
    assert_eq!(cancelled.len(), 1);
    assert_eq!(topics(&cancelled[0]), vec!["c"]);
}

#[test]
fn test_disconnect_during_backoff_cancels_reconnect() {
    let broker = MockBroker::new();
    let client = client(
        &broker,
        config().reconnect_backoff(ReconnectBackoff {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(100),
            multiplier: 1.0,
        }),
    );
    client.connect().unwrap();

    broker.drop_connection("reset by peer");
    wait_until("disconnected", || client.state() == ClientState::Disconnected);
    client.disconnect().unwrap();

    thread::sleep(Duration::from_millis(300));
    assert_eq!(broker.connect_count(), 1);
    assert_eq!(client.state(), ClientState::Disconnected);
}

#[test]
fn test_disconnect_stops_reconnecting() {
    let broker = MockBroker::new();
    let client = client(&broker, config());
    client.connect().unwrap();

    client.disconnect().unwrap();
    assert_eq!(client.state(), ClientState::Disconnected);

    // Loss reported after an explicit disconnect is ignored
    broker.drop_connection("late");
    thread::sleep(Duration::from_millis(50));
    assert_eq!(broker.connect_count(), 1);
    assert_eq!(client.state(), ClientState::Disconnected);
}

#[test]
fn test_unsubscribe_on_disconnect() {
    let broker = MockBroker::new();
    let client = client(&broker, config().unsubscribe_on_disconnect(true));
    let _sub = client.subscribe(SubscriptionConfig::new(["x/y"])).unwrap();
    client.connect().unwrap();

    client.disconnect().unwrap();
    let batches = broker.unsubscribe_batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(topics(&batches[0]), vec!["x/y"]);
    assert_eq!(broker.disconnect_count(), 1);
}

#[test]
fn test_message_fan_out() {
    let broker = MockBroker::new();
    let client = client(&broker, config());
    client.connect().unwrap();

    let plus = client.subscribe(SubscriptionConfig::new(["home/+/temp"])).unwrap();
    let hash = client.subscribe(SubscriptionConfig::new(["home/#"])).unwrap();
    let other = client.subscribe(SubscriptionConfig::new(["office/#"])).unwrap();

    broker.inject("home/kitchen/temp", "21.5", QoS::AtLeastOnce, true);
    broker.inject("home/kitchen/humidity", "40", QoS::AtMostOnce, false);

    assert_eq!(plus.stats().unread, 1);
    assert_eq!(hash.stats().unread, 2);
    assert_eq!(other.stats().unread, 0);

    let loan = plus.take().unwrap();
    assert_eq!(loan.len(), 1);
    assert_eq!(loan[0].topic, "home/kitchen/temp");
    assert_eq!(&loan[0].payload[..], b"21.5");
    assert_eq!(loan[0].info.qos, QoS::AtLeastOnce);
    assert!(loan[0].info.retained);
}

#[test]
fn test_loaned_queue_rejects_without_blocking_others() {
    let broker = MockBroker::new();
    let client = client(&broker, config());
    client.connect().unwrap();

    let loaned = client.subscribe(SubscriptionConfig::new(["t"])).unwrap();
    let open = client.subscribe(SubscriptionConfig::new(["t"])).unwrap();

    broker.inject("t", "1", QoS::AtMostOnce, false);
    let loan = loaned.take().unwrap();
    assert!(loaned.queue().is_loaned());

    broker.inject("t", "2", QoS::AtMostOnce, false);
    assert_eq!(open.stats().received, 2);
    assert_eq!(loaned.stats().received, 1);
    assert_eq!(client.state(), ClientState::Connected);

    let mut out = Vec::new();
    assert!(matches!(loaned.read(1, &mut out), Err(ClientError::ReadInProgress)));

    drop(loan);
    assert!(!loaned.queue().is_loaned());
    assert!(matches!(
        loaned.return_loan(Vec::new()),
        Err(ClientError::NoReadInProgress)
    ));
}

#[test]
fn test_circular_queue_drops_oldest() {
    let broker = MockBroker::new();
    let client = client(&broker, config());
    client.connect().unwrap();

    let sub = client
        .subscribe(SubscriptionConfig::new(["n"]).queue_size(2))
        .unwrap();
    for payload in ["1", "2", "3"] {
        broker.inject("n", payload, QoS::AtMostOnce, false);
    }

    let stats = sub.stats();
    assert_eq!(stats.received, 3);
    assert_eq!(stats.lost, 1);
    assert_eq!(stats.unread, 2);

    let mut out = Vec::new();
    assert_eq!(sub.read(10, &mut out).unwrap(), 2);
    let payloads: Vec<&[u8]> = out.iter().map(|m| &m.payload[..]).collect();
    assert_eq!(payloads, vec![b"2".as_slice(), b"3".as_slice()]);
}

#[test]
fn test_listener_fires_after_queueing() {
    let broker = MockBroker::new();
    let client = client(&broker, config());
    client.connect().unwrap();

    let sub = client.subscribe(SubscriptionConfig::new(["ping"])).unwrap();
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    sub.set_listener(Arc::new(move |s: &Subscription| {
        counter.store(s.stats().unread as usize, Ordering::SeqCst);
    }));

    broker.inject("ping", "a", QoS::AtMostOnce, false);
    broker.inject("ping", "b", QoS::AtMostOnce, false);
    assert_eq!(seen.load(Ordering::SeqCst), 2);
}

#[test]
fn test_qos1_write_settles_on_ack() {
    let broker = MockBroker::new();
    let client = client(&broker, config());
    client.connect().unwrap();

    let publication = client
        .publish(PublicationConfig::new("out/data").qos(QoS::AtLeastOnce).retained(true))
        .unwrap();
    publication.write_payload("hello").unwrap();

    let stats = publication.stats();
    assert_eq!((stats.sent, stats.pending, stats.ok, stats.error), (1, 0, 1, 0));

    let writes = broker.writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].params.topic, "out/data");
    assert!(writes[0].params.retained);
    assert_eq!(&writes[0].payload[..], b"hello");
}

#[test]
fn test_qos2_pending_until_delivery_complete() {
    let broker = MockBroker::new();
    broker.set_auto_deliver(false);
    let client = client(&broker, config());
    client.connect().unwrap();

    let publication = client
        .publish(PublicationConfig::new("out/exact").qos(QoS::ExactlyOnce))
        .unwrap();
    publication.write_payload("one").unwrap();
    publication.write_payload("two").unwrap();

    let stats = publication.stats();
    assert_eq!((stats.sent, stats.pending, stats.ok), (2, 2, 0));
    assert_eq!(broker.pending_deliveries(), 2);

    assert_eq!(broker.complete_deliveries(true), 2);
    let stats = publication.stats();
    assert_eq!((stats.pending, stats.ok, stats.error), (0, 2, 0));
}

#[test]
fn test_write_with_message_info() {
    let broker = MockBroker::new();
    let client = client(&broker, config());
    client.connect().unwrap();

    let sub = client.subscribe(SubscriptionConfig::new(["in/#"])).unwrap();
    let publication = client.publish(PublicationConfig::from_message_info()).unwrap();

    broker.inject("in/a", "payload", QoS::AtLeastOnce, true);
    let loan = sub.take().unwrap();
    publication.write(&loan[0]).unwrap();

    let writes = broker.writes();
    assert_eq!(writes[0].params.topic, "in/a");
    assert_eq!(writes[0].params.qos, QoS::AtLeastOnce);
    assert!(writes[0].params.retained);
}

#[test]
fn test_write_acked_from_other_thread() {
    let broker = MockBroker::new();
    let client = client(&broker, config());
    client.connect().unwrap();
    let publication = client
        .publish(PublicationConfig::new("slow").qos(QoS::AtLeastOnce))
        .unwrap();

    broker.set_auto_ack(false);
    thread::scope(|s| {
        s.spawn(|| {
            wait_until("write to be held", || broker.held_count() == 1);
            assert_eq!(broker.resolve_next(Ok(())), Some(MockOp::Write));
        });
        publication.write_payload("x").unwrap();
    });
    broker.set_auto_ack(true);
    assert_eq!(publication.stats().ok, 1);
}

#[test]
fn test_write_timeout_keeps_client_connected() {
    let broker = MockBroker::new();
    let client = client(&broker, config());
    client.connect().unwrap();
    let publication = client
        .publish(
            PublicationConfig::new("slow")
                .qos(QoS::AtLeastOnce)
                .max_wait_time(Duration::from_millis(50)),
        )
        .unwrap();

    broker.set_auto_ack(false);
    assert!(matches!(
        publication.write_payload("x"),
        Err(ClientError::Timeout(_))
    ));
    assert_eq!(client.state(), ClientState::Connected);
    broker.set_auto_ack(true);
}

#[test]
fn test_write_while_disconnected() {
    let broker = MockBroker::new();
    let client = client(&broker, config());
    let publication = client.publish(PublicationConfig::new("t").qos(QoS::ExactlyOnce)).unwrap();

    assert!(matches!(
        publication.write_payload("x"),
        Err(ClientError::InvalidState(_))
    ));
    let stats = publication.stats();
    assert_eq!((stats.sent, stats.pending, stats.error), (0, 0, 1));
    assert!(broker.writes().is_empty());
}

#[test]
fn test_rejected_write_counts_error() {
    let broker = MockBroker::new();
    let client = client(&broker, config());
    client.connect().unwrap();
    let publication = client.publish(PublicationConfig::new("t").qos(QoS::ExactlyOnce)).unwrap();

    broker.reject_next(MockOp::Write);
    assert!(matches!(
        publication.write_payload("x"),
        Err(ClientError::BrokerRejected(_))
    ));
    let stats = publication.stats();
    assert_eq!((stats.pending, stats.ok, stats.error), (0, 0, 1));
    assert_eq!(client.state(), ClientState::Connected);
}

#[test]
fn test_drop_unsubscribes_and_disconnects() {
    let broker = MockBroker::new();
    {
        let client = client(&broker, config());
        let _sub = client.subscribe(SubscriptionConfig::new(["a", "b"])).unwrap();
        let _publication = client.publish(PublicationConfig::new("c")).unwrap();
        client.connect().unwrap();
    }

    let batches = broker.unsubscribe_batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(topics(&batches[0]), vec!["a", "b"]);
    assert_eq!(broker.disconnect_count(), 1);
    assert!(!broker.is_connected());
}

#[test]
fn test_publication_rejects_invalid_topic() {
    let broker = MockBroker::new();
    let client = client(&broker, config());
    assert!(matches!(
        client.publish(PublicationConfig::new("a/+")),
        Err(ClientError::InvalidConfig(_))
    ));
    assert_eq!(client.publication_count(), 0);
}
