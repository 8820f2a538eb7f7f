//! Cross-domain calls over real TCP: discovery advertises the remote
//! service as a concurrent instance, the call tunnels with its correlation
//! preserved, and connection loss is survivable.

mod common;

use std::time::Duration;

use casual::configuration::{InboundGroup, Model, OutboundConnection, OutboundGroup};
use casual::domain_types::InstanceOrder;
use casual::example;
use casual::runtime::Builder;

use common::{free_address, service, shutdown};

fn hosting_domain(name: &str, listener: &str) -> Model {
    let mut model = Model::named(name);
    model.gateway.inbound.push(InboundGroup {
        listener: Some(listener.to_string()),
        connect: Vec::new(),
    });
    model
}

fn calling_domain(name: &str, peer: &str) -> Model {
    let mut model = Model::named(name);
    model.gateway.outbound.push(OutboundGroup {
        order: InstanceOrder::default(),
        connections: vec![OutboundConnection {
            address: peer.to_string(),
            services: Vec::new(),
            queues: Vec::new(),
        }],
        reconnect: true,
        reverse: false,
        listener: None,
    });
    model
}

#[tokio::test(flavor = "multi_thread")]
async fn discovery_and_call_across_domains() {
    let address = free_address();

    // domain A hosts echo behind an inbound gateway
    let hosting = Builder::new(hosting_domain("domain-a", &address))
        .with_server("example-server", example::echo_server())
        .boot()
        .await
        .expect("hosting domain boots");

    // domain B connects outbound to A and hosts nothing
    let calling = Builder::new(calling_domain("domain-b", &address))
        .boot()
        .await
        .expect("calling domain boots");

    // give the outbound connection a moment to establish
    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut session = calling.session().await.expect("session connects");
    session.set_timeout(Duration::from_secs(5));
    let reply = session
        .call(&service(example::ECHO), b"casual\n".to_vec())
        .await
        .expect("call completes");
    assert_eq!(
        reply.expect("the remote echo answers"),
        b"casual\n",
        "payload must cross both gateways unchanged"
    );

    // discovery synthesized a concurrent instance in B
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
        .expect("echo is advertised in the calling domain");
    assert!(
        !echo_entry["concurrent"].as_array().expect("instances").is_empty(),
        "echo must be a concurrent instance: {echo_entry}"
    );

    // a second call uses the established route without re-discovery
    let reply = session
        .call(&service(example::ECHO), b"again".to_vec())
        .await
        .expect("call completes");
    assert_eq!(reply.expect("the remote echo answers"), b"again");

    shutdown(calling).await;
    shutdown(hosting).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn absent_remote_service_answers_no_entry() {
    let address = free_address();

    let hosting = Builder::new(hosting_domain("host-empty", &address))
        .boot()
        .await
        .expect("hosting domain boots");
    let calling = Builder::new(calling_domain("caller-empty", &address))
        .boot()
        .await
        .expect("calling domain boots");

    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut session = calling.session().await.expect("session connects");
    session.set_timeout(Duration::from_secs(5));
    let reply = session
        .call(&service("nowhere/to/be/found"), Vec::new())
        .await
        .expect("call completes");
    assert_eq!(reply, Err(casual::error::ErrorKind::NoEntry));

    shutdown(calling).await;
    shutdown(hosting).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn reverse_inbound_serves_a_domain_behind_a_firewall() {
    // domain A cannot accept TCP: it dials out, then serves inbound over
    // the established socket. Domain B listens with a reverse outbound
    // group and routes calls over whatever connects.
    let address = free_address();

    let mut reverse_outbound = Model::named("dialing-caller");
    reverse_outbound.gateway.outbound.push(OutboundGroup {
        order: InstanceOrder::default(),
        connections: vec![OutboundConnection {
            address: String::new(),
            services: Vec::new(),
            queues: Vec::new(),
        }],
        reconnect: true,
        reverse: true,
        listener: Some(address.clone()),
    });
    let caller = Builder::new(reverse_outbound)
        .boot()
        .await
        .expect("listening caller boots");

    let mut reverse_inbound = Model::named("firewalled-host");
    reverse_inbound.gateway.inbound.push(InboundGroup {
        listener: None,
        connect: vec![address.clone()],
    });
    let host = Builder::new(reverse_inbound)
        .with_server("example-server", example::echo_server())
        .boot()
        .await
        .expect("firewalled host boots");

    tokio::time::sleep(Duration::from_millis(500)).await;

    let mut session = caller.session().await.expect("session connects");
    session.set_timeout(Duration::from_secs(5));
    let reply = session
        .call(&service(example::ECHO), b"through the wall".to_vec())
        .await
        .expect("call completes");
    assert_eq!(reply.expect("the echo answers"), b"through the wall");

    shutdown(caller).await;
    shutdown(host).await;
}
