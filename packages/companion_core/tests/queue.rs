mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{MockDaemon, eventually, fast_config, wait_for_status};
use companion_core::{
    Connection, ConnectionStatus, FileStore, MemoryStore, MessageQueue, PlainCodec, QueueEvent,
};

fn connection_with(queue: &MessageQueue) -> Connection {
    Connection::with_parts(fast_config(), Arc::new(PlainCodec), Some(queue.clone()))
}

fn record_events(queue: &MessageQueue) -> (Arc<Mutex<Vec<QueueEvent>>>, companion_core::Subscription) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let e = events.clone();
    let sub = queue.subscribe(move |event| e.lock().unwrap().push(event.clone()));
    (events, sub)
}

fn inputs(daemon: &MockDaemon) -> Vec<String> {
    daemon
        .received("send_input")
        .iter()
        .map(|frame| frame["payload"]["input"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn test_queued_message_delivered_after_authentication() {
    let daemon = MockDaemon::start("secret").await;
    let queue = MessageQueue::new(Arc::new(MemoryStore::new()));
    let message = queue.enqueue_for_session("srv", "s1", "hello").unwrap();
    let (events, _sub) = record_events(&queue);

    let connection = connection_with(&queue);
    connection.connect(daemon.server("srv"));

    assert!(eventually(Duration::from_secs(5), || queue.is_empty()).await);
    let sent = daemon.received("send_input");
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0]["payload"]["input"], "hello");
    assert_eq!(sent[0]["payload"]["sessionId"], "s1");
    assert_eq!(sent[0]["payload"]["clientMessageId"], message.id.as_str());

    assert!(
        eventually(Duration::from_secs(2), || {
            events.lock().unwrap().iter().any(|e| {
                matches!(e, QueueEvent::Flushed { delivered: 1, remaining: 0, .. })
            })
        })
        .await
    );
    assert!(
        events
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, QueueEvent::Delivered { message: m } if m.id == message.id))
    );
}

#[tokio::test]
async fn test_drain_is_fifo_per_server() {
    let daemon = MockDaemon::start("secret").await;
    let queue = MessageQueue::new(Arc::new(MemoryStore::new()));
    queue.enqueue("srv", "first").unwrap();
    queue.enqueue("elsewhere", "not mine").unwrap();
    queue.enqueue("srv", "second").unwrap();
    queue.enqueue("srv", "third").unwrap();

    let connection = connection_with(&queue);
    connection.connect(daemon.server("srv"));

    assert!(eventually(Duration::from_secs(5), || queue.messages_for("srv").is_empty()).await);
    assert_eq!(inputs(&daemon), vec!["first", "second", "third"]);
    assert_eq!(queue.messages_for("elsewhere").len(), 1);
}

#[tokio::test]
async fn test_failed_delivery_stops_drain_and_keeps_messages() {
    let daemon = MockDaemon::start("secret").await;
    daemon.fail_send_input(true);
    let queue = MessageQueue::new(Arc::new(MemoryStore::new()));
    queue.enqueue("srv", "a").unwrap();
    queue.enqueue("srv", "b").unwrap();
    let (events, _sub) = record_events(&queue);

    let connection = connection_with(&queue);
    connection.connect(daemon.server("srv"));

    assert!(
        eventually(Duration::from_secs(5), || {
            events
                .lock()
                .unwrap()
                .iter()
                .any(|e| matches!(e, QueueEvent::Flushed { .. }))
        })
        .await
    );
    {
        let events = events.lock().unwrap();
        assert!(events.iter().any(|e| matches!(
            e,
            QueueEvent::DeliveryFailed { message, .. } if message.text == "a"
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            QueueEvent::Flushed { delivered: 0, remaining: 2, .. }
        )));
    }
    assert_eq!(inputs(&daemon), vec!["a"]);
    assert_eq!(queue.len(), 2);

    daemon.fail_send_input(false);
    assert_eq!(queue.drain(&connection).await, 2);
    assert!(queue.is_empty());
    assert_eq!(inputs(&daemon), vec!["a", "a", "b"]);
}

#[tokio::test]
async fn test_concurrent_drain_returns_early() {
    let daemon = MockDaemon::start("secret").await;
    daemon.delay("send_input", Duration::from_millis(150));
    let queue = MessageQueue::new(Arc::new(MemoryStore::new()));
    queue.enqueue("srv", "one").unwrap();
    queue.enqueue("srv", "two").unwrap();

    let connection = connection_with(&queue);
    connection.connect(daemon.server("srv"));
    assert!(eventually(Duration::from_secs(5), || queue.is_draining("srv")).await);

    assert_eq!(queue.drain(&connection).await, 0);

    assert!(eventually(Duration::from_secs(5), || queue.is_empty()).await);
    assert!(eventually(Duration::from_secs(1), || !queue.is_draining("srv")).await);
    assert_eq!(inputs(&daemon), vec!["one", "two"]);
}

#[tokio::test]
async fn test_drain_pauses_while_disconnected() {
    let daemon = MockDaemon::start("secret").await;
    let queue = MessageQueue::new(Arc::new(MemoryStore::new()));
    let connection = connection_with(&queue);
    connection.connect(daemon.server("srv"));
    assert!(wait_for_status(&connection, ConnectionStatus::Connected).await);

    connection.disconnect();
    queue.enqueue("srv", "later").unwrap();
    assert_eq!(queue.drain(&connection).await, 0);
    assert_eq!(queue.len(), 1);

    connection.connect(daemon.server("srv"));
    assert!(eventually(Duration::from_secs(5), || queue.is_empty()).await);
    assert_eq!(inputs(&daemon), vec!["later"]);
}

#[tokio::test]
async fn test_persisted_queue_survives_restart() {
    let tmp = tempfile::tempdir().unwrap();
    {
        let store = Arc::new(FileStore::open(tmp.path()).unwrap());
        let queue = MessageQueue::load(store).unwrap();
        queue.enqueue("srv", "from last run").unwrap();
    }

    let daemon = MockDaemon::start("secret").await;
    let store = Arc::new(FileStore::open(tmp.path()).unwrap());
    let queue = MessageQueue::load(store.clone()).unwrap();
    assert_eq!(queue.len(), 1);

    let connection = connection_with(&queue);
    connection.connect(daemon.server("srv"));
    assert!(eventually(Duration::from_secs(5), || queue.is_empty()).await);
    assert_eq!(inputs(&daemon), vec!["from last run"]);

    let reloaded = MessageQueue::load(store).unwrap();
    assert!(reloaded.is_empty());
}
