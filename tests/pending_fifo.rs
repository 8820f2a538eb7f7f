//! Pending lookups drain strictly FIFO: with a single busy instance,
//! queued callers are served in arrival order as acknowledgements free the
//! instance.

mod common;

use std::sync::Arc;
use std::time::Duration;

use casual::configuration::Model;
use casual::example;
use casual::runtime::Builder;
use casual::server::{Entry, Invocation};

use common::{service, shutdown};

#[tokio::test(flavor = "multi_thread")]
async fn queued_callers_are_served_in_arrival_order() {
    // a service that records the order its calls complete in
    let completions: Arc<std::sync::Mutex<Vec<u64>>> = Arc::new(std::sync::Mutex::new(Vec::new()));

    let recorder = {
        let completions = Arc::clone(&completions);
        Entry::new(
            casual::message::service::Service::named(service("ordered")),
            move |invocation: Invocation| {
                let completions = Arc::clone(&completions);
                async move {
                    // a small delay keeps the instance busy long enough for
                    // the next pending entry to be queued behind it
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    let caller: u64 = std::str::from_utf8(&invocation.payload)
                        .ok()
                        .and_then(|text| text.parse().ok())
                        .unwrap_or_default();
                    if let Ok(mut order) = completions.lock() {
                        order.push(caller);
                    }
                    Ok(invocation.payload)
                }
            },
        )
    };

    let domain = Builder::new(Model::named("fifo"))
        .with_server("recorder-server", vec![recorder, example::sleep()])
        .boot()
        .await
        .expect("domain boots");

    // occupy the single instance
    let mut blocker = domain.session().await.expect("session connects");
    let occupied = tokio::spawn(async move {
        blocker
            .call(&service(example::SLEEP), b"400".to_vec())
            .await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    // three callers queue behind it, in a known arrival order
    let mut waiters = Vec::new();
    for caller in 1..=3u64 {
        let mut session = domain.session().await.expect("session connects");
        waiters.push(tokio::spawn(async move {
            session
                .call(&service("ordered"), caller.to_string().into_bytes())
                .await
        }));
        // spacing guarantees arrival order at the service manager
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let _ = occupied.await.expect("task completes").expect("call completes");
    for waiter in waiters {
        let reply = waiter.await.expect("task completes").expect("call completes");
        assert!(reply.is_ok());
    }

    let order = completions.lock().expect("lock").clone();
    assert_eq!(order, vec![1, 2, 3], "pending lookups must drain FIFO");

    shutdown(domain).await;
}
