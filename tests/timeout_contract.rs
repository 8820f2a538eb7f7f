//! Execution-timeout contracts: under `kill` the caller gets a timeout
//! reply and the overrunning instance is terminated; under `linger` the
//! caller is notified but the instance survives.

mod common;

use std::time::Duration;

use casual::configuration::{Contract, Model, Service as ServiceConfig};
use casual::error::ErrorKind;
use casual::example;
use casual::runtime::Builder;

use common::{service, shutdown};

fn model_with_timeout(name: &str, contract: Contract) -> Model {
    let mut model = Model::named(name);
    model.services.push(ServiceConfig {
        name: service(example::SLEEP),
        timeout_ms: Some(100),
        contract,
        routes: Vec::new(),
    });
    model
}

#[tokio::test(flavor = "multi_thread")]
async fn kill_contract_times_out_and_terminates_the_instance() {
    let domain = Builder::new(model_with_timeout("kill-contract", Contract::Kill))
        .with_server("example-server", example::echo_server())
        .boot()
        .await
        .expect("domain boots");

    let mut session = domain.session().await.expect("session connects");
    session.set_timeout(Duration::from_secs(5));

    // the implementation sleeps far past the 100ms execution timeout
    let reply = session
        .call(&service(example::SLEEP), b"2000".to_vec())
        .await
        .expect("call completes");
    assert_eq!(reply, Err(ErrorKind::Timeout));

    // the instance was terminated; its exit removes the whole server from
    // the registry, so a fresh call finds nothing
    tokio::time::sleep(Duration::from_millis(300)).await;
    let reply = session
        .call(&service(example::ECHO), b"gone?".to_vec())
        .await
        .expect("call completes");
    assert_eq!(
        reply,
        Err(ErrorKind::NoEntry),
        "the killed instance must be unadvertised"
    );

    shutdown(domain).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn linger_contract_notifies_the_caller_but_spares_the_instance() {
    let domain = Builder::new(model_with_timeout("linger-contract", Contract::Linger))
        .with_server("example-server", example::echo_server())
        .boot()
        .await
        .expect("domain boots");

    let mut session = domain.session().await.expect("session connects");
    session.set_timeout(Duration::from_secs(5));

    let reply = session
        .call(&service(example::SLEEP), b"300".to_vec())
        .await
        .expect("call completes");
    assert_eq!(reply, Err(ErrorKind::Timeout));

    // the instance finishes its nap and keeps serving
    tokio::time::sleep(Duration::from_millis(500)).await;
    let reply = session
        .call(&service(example::ECHO), b"still here".to_vec())
        .await
        .expect("call completes");
    assert_eq!(reply.expect("the instance survived"), b"still here");

    shutdown(domain).await;
}
