//! Basic call scenarios: echo within one domain, unknown services, the
//! fire-and-forget path through the forward cache, and admin calls.

mod common;

use std::time::Duration;

use casual::configuration::Model;
use casual::error::ErrorKind;
use casual::example;
use casual::runtime::Builder;

use common::{service, shutdown};

#[tokio::test(flavor = "multi_thread")]
async fn echo_round_trip() {
    let domain = Builder::new(Model::named("basic"))
        .with_server("example-server", example::echo_server())
        .boot()
        .await
        .expect("domain boots");

    let mut session = domain.session().await.expect("session connects");
    let reply = session
        .call(&service(example::ECHO), b"casual\n".to_vec())
        .await
        .expect("call completes");
    assert_eq!(reply.expect("echo answers"), b"casual\n");

    shutdown(domain).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn no_transaction_is_started_by_a_plain_call() {
    let domain = Builder::new(Model::named("no-transaction"))
        .with_server("example-server", example::echo_server())
        .boot()
        .await
        .expect("domain boots");

    let mut session = domain.session().await.expect("session connects");
    let _ = session
        .call(&service(example::ECHO), b"casual\n".to_vec())
        .await
        .expect("call completes");

    // the coordinator has seen nothing
    let state = session
        .call(&service(casual::transaction::ADMIN_STATE), Vec::new())
        .await
        .expect("admin call completes")
        .expect("admin call succeeds");
    let snapshot: serde_json::Value = serde_json::from_slice(&state).expect("valid json");
    assert_eq!(
        snapshot["transactions"].as_array().map(Vec::len),
        Some(0),
        "transaction log must stay empty: {snapshot}"
    );

    shutdown(domain).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_service_answers_no_entry() {
    let domain = Builder::new(Model::named("absent"))
        .boot()
        .await
        .expect("domain boots");

    let mut session = domain.session().await.expect("session connects");
    session.set_timeout(Duration::from_secs(2));
    let reply = session
        .call(&service("no/such/service"), Vec::new())
        .await
        .expect("call completes");
    assert_eq!(reply, Err(ErrorKind::NoEntry));

    shutdown(domain).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn fire_and_forget_reaches_the_service_through_the_forward_cache() {
    let domain = Builder::new(Model::named("forward"))
        .with_server("example-server", vec![example::echo(), example::sleep()])
        .boot()
        .await
        .expect("domain boots");

    // occupy the only instance so the no-reply call resolves to the
    // forward cache
    let blocker = domain.session().await.expect("session connects");
    let mut blocker = blocker;
    let sleeper = tokio::spawn(async move {
        blocker
            .call(&service(example::SLEEP), b"300".to_vec())
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut session = domain.session().await.expect("session connects");
    let accepted = session
        .call_no_reply(&service(example::ECHO), b"fire".to_vec())
        .await
        .expect("dispatch completes");
    assert!(accepted.is_ok(), "the caller proceeds without waiting");

    // the sleeper finishes and the forwarded call gets the freed instance
    let slept = sleeper.await.expect("task completes").expect("call completes");
    assert!(slept.is_ok());

    // give the forward cache a moment to re-dispatch, then observe the
    // registry accounted two echo-family invocations
    tokio::time::sleep(Duration::from_millis(200)).await;
    let state = session
        .call(&service(casual::service::ADMIN_STATE), Vec::new())
        .await
        .expect("admin call completes")
        .expect("admin call succeeds");
    let snapshot: serde_json::Value = serde_json::from_slice(&state).expect("valid json");
    let services = snapshot["services"].as_array().expect("service list");
    let echo_entry = services
        .iter()
        .find(|entry| entry["name"] == example::ECHO)
        .expect("echo is advertised");
    assert!(
        echo_entry["metric"]["invoked"].as_u64().unwrap_or(0) >= 1,
        "the forwarded call completed: {echo_entry}"
    );

    shutdown(domain).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn domain_state_snapshot_lists_the_managers() {
    let domain = Builder::new(Model::named("snapshot"))
        .boot()
        .await
        .expect("domain boots");

    let mut session = domain.session().await.expect("session connects");
    let state = session
        .call(&service(casual::domain::ADMIN_STATE), Vec::new())
        .await
        .expect("admin call completes")
        .expect("admin call succeeds");
    let snapshot: serde_json::Value = serde_json::from_slice(&state).expect("valid json");

    let aliases: Vec<&str> = snapshot["executables"]
        .as_array()
        .expect("executables")
        .iter()
        .filter_map(|entry| entry["alias"].as_str())
        .collect();
    assert!(aliases.contains(&"casual-service-manager"), "{aliases:?}");
    assert!(aliases.contains(&"casual-transaction-manager"), "{aliases:?}");
    assert!(aliases.contains(&"casual-queue-manager"), "{aliases:?}");
    assert!(aliases.contains(&"casual-gateway-manager"), "{aliases:?}");

    shutdown(domain).await;
}
