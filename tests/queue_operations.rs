//! Queue semantics end to end: transactional enqueue/dequeue against a
//! running group, retry-with-delay on rollback, blocking dequeue waiters,
//! and the service-forward worker.

mod common;

use std::time::{Duration, SystemTime};

use casual::configuration::{Forward, Model, Queue, QueueGroup};
use casual::domain_types::{QueueName, RetryCount, RetryDelayMs};
use casual::example;
use casual::message::queue::Message as QueueMessage;
use casual::runtime::Builder;
use casual::xa::XaCode;
use uuid::Uuid;

use common::{service, shutdown};

fn queue(name: &str) -> QueueName {
    QueueName::try_new(name).expect("valid queue name")
}

fn model_with_queue(name: &str, retry_count: u64, retry_delay_ms: u64) -> Model {
    let mut model = Model::named(name);
    model.queue.groups.push(QueueGroup {
        name: "group-a".into(),
        store: None,
        queues: vec![Queue {
            name: queue("q"),
            retry_count: RetryCount::try_new(retry_count).expect("valid count"),
            retry_delay: RetryDelayMs::try_new(retry_delay_ms).expect("valid delay"),
        }],
    });
    model
}

fn payload_message(payload: &[u8]) -> QueueMessage {
    QueueMessage {
        id: Uuid::nil(),
        properties: String::new(),
        reply: None,
        r#type: "application/octet-stream".into(),
        payload: payload.to_vec(),
        available: SystemTime::now(),
        timestamp: SystemTime::now(),
        redelivered: 0,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn enqueue_dequeue_round_trip() {
    let domain = Builder::new(model_with_queue("queue-basic", 10, 0))
        .boot()
        .await
        .expect("domain boots");

    let mut session = domain.session().await.expect("session connects");
    let id = session
        .enqueue(&queue("q"), payload_message(b"hello"))
        .await
        .expect("enqueue completes")
        .expect("enqueue succeeds");
    assert!(!id.is_nil());

    let message = session
        .dequeue(&queue("q"), false)
        .await
        .expect("dequeue completes")
        .expect("dequeue succeeds")
        .expect("a message is available");
    assert_eq!(message.payload, b"hello");
    assert_eq!(message.id, id);

    shutdown(domain).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn rollback_redelivers_with_delay() {
    let domain = Builder::new(model_with_queue("queue-retry", 10, 100))
        .boot()
        .await
        .expect("domain boots");

    let mut session = domain.session().await.expect("session connects");

    // enqueue auto-committed
    session
        .enqueue(&queue("q"), payload_message(b"retry me"))
        .await
        .expect("enqueue completes")
        .expect("enqueue succeeds");

    // dequeue under a transaction, then roll back
    session.begin().expect("transaction begins");
    let message = session
        .dequeue(&queue("q"), false)
        .await
        .expect("dequeue completes")
        .expect("dequeue succeeds")
        .expect("a message is available");
    assert_eq!(message.redelivered, 0);
    assert_eq!(session.rollback().await.expect("rollback completes"), XaCode::Ok);

    // immediately: nothing available, the retry delay holds the message
    let nothing = session
        .dequeue(&queue("q"), false)
        .await
        .expect("dequeue completes")
        .expect("dequeue succeeds");
    assert!(nothing.is_none(), "the retry delay must hold the message");

    // after the delay: available again with the redelivery counted
    tokio::time::sleep(Duration::from_millis(150)).await;
    let again = session
        .dequeue(&queue("q"), false)
        .await
        .expect("dequeue completes")
        .expect("dequeue succeeds")
        .expect("available after the delay");
    assert_eq!(again.redelivered, 1);

    shutdown(domain).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn transactional_enqueue_is_visible_after_commit_only() {
    let domain = Builder::new(model_with_queue("queue-txn", 10, 0))
        .boot()
        .await
        .expect("domain boots");

    let mut producer = domain.session().await.expect("session connects");
    let mut observer = domain.session().await.expect("session connects");

    producer.begin().expect("transaction begins");
    producer
        .enqueue(&queue("q"), payload_message(b"uncommitted"))
        .await
        .expect("enqueue completes")
        .expect("enqueue succeeds");

    let nothing = observer
        .dequeue(&queue("q"), false)
        .await
        .expect("dequeue completes")
        .expect("dequeue succeeds");
    assert!(nothing.is_none(), "uncommitted messages must be invisible");

    assert_eq!(producer.commit().await.expect("commit completes"), XaCode::Ok);

    let message = observer
        .dequeue(&queue("q"), false)
        .await
        .expect("dequeue completes")
        .expect("dequeue succeeds")
        .expect("visible after commit");
    assert_eq!(message.payload, b"uncommitted");

    shutdown(domain).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn blocking_dequeue_is_woken_by_an_enqueue() {
    let domain = Builder::new(model_with_queue("queue-block", 10, 0))
        .boot()
        .await
        .expect("domain boots");

    let mut waiter = domain.session().await.expect("session connects");
    let waiting = tokio::spawn(async move { waiter.dequeue(&queue("q"), true).await });

    // let the waiter park
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!waiting.is_finished(), "the waiter must be parked");

    let mut producer = domain.session().await.expect("session connects");
    producer
        .enqueue(&queue("q"), payload_message(b"wake up"))
        .await
        .expect("enqueue completes")
        .expect("enqueue succeeds");

    let message = tokio::time::timeout(Duration::from_secs(5), waiting)
        .await
        .expect("the waiter wakes")
        .expect("task completes")
        .expect("dequeue completes")
        .expect("dequeue succeeds")
        .expect("the enqueued message arrives");
    assert_eq!(message.payload, b"wake up");

    shutdown(domain).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn forward_worker_bridges_queue_to_service_and_reply_queue() {
    let mut model = model_with_queue("queue-forward", 10, 50);
    model.queue.groups[0].queues.push(Queue {
        name: queue("replies"),
        retry_count: RetryCount::try_new(10).expect("valid count"),
        retry_delay: RetryDelayMs::try_new(0).expect("valid delay"),
    });
    model.queue.forwards.push(Forward {
        source: queue("q"),
        service: service(example::ECHO),
        reply: Some(queue("replies")),
    });

    let domain = Builder::new(model)
        .with_server("example-server", example::echo_server())
        .boot()
        .await
        .expect("domain boots");

    let mut session = domain.session().await.expect("session connects");
    session
        .enqueue(&queue("q"), payload_message(b"through the forward"))
        .await
        .expect("enqueue completes")
        .expect("enqueue succeeds");

    // the worker dequeues, calls echo, enqueues the reply, commits
    let mut consumer = domain.session().await.expect("session connects");
    let reply = tokio::time::timeout(
        Duration::from_secs(10),
        consumer.dequeue(&queue("replies"), true),
    )
    .await
    .expect("the forwarded reply arrives")
    .expect("dequeue completes")
    .expect("dequeue succeeds")
    .expect("the reply message exists");
    assert_eq!(reply.payload, b"through the forward");

    shutdown(domain).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn retry_exhaustion_parks_on_the_error_queue_until_restore() {
    // zero retries: the first rollback exhausts
    let domain = Builder::new(model_with_queue("queue-exhaust", 0, 0))
        .boot()
        .await
        .expect("domain boots");

    let mut session = domain.session().await.expect("session connects");
    session
        .enqueue(&queue("q"), payload_message(b"fragile"))
        .await
        .expect("enqueue completes")
        .expect("enqueue succeeds");

    session.begin().expect("transaction begins");
    let _ = session
        .dequeue(&queue("q"), false)
        .await
        .expect("dequeue completes")
        .expect("dequeue succeeds")
        .expect("a message is available");
    session.rollback().await.expect("rollback completes");

    // exhausted: gone from the operator queue
    let nothing = session
        .dequeue(&queue("q"), false)
        .await
        .expect("dequeue completes")
        .expect("dequeue succeeds");
    assert!(nothing.is_none(), "the message must be parked on the error queue");

    // restore through the queue admin surface
    let restore = session
        .call(
            &service(casual::queue::manager::ADMIN_RESTORE),
            serde_json::to_vec(&serde_json::json!({ "queue": "q" })).expect("payload encodes"),
        )
        .await
        .expect("admin call completes")
        .expect("restore succeeds");
    let outcome: serde_json::Value = serde_json::from_slice(&restore).expect("valid json");
    assert_eq!(outcome["restored"], 1);

    let message = session
        .dequeue(&queue("q"), false)
        .await
        .expect("dequeue completes")
        .expect("dequeue succeeds")
        .expect("restored to the operator queue");
    assert_eq!(message.payload, b"fragile");

    shutdown(domain).await;
}
