//! Shared helpers for the integration tests

// not every test binary uses every helper
#![allow(dead_code)]

use std::time::Duration;

use casual::domain_types::ServiceName;
use casual::runtime::Domain;

/// Picks a free TCP port on the loopback interface.
///
/// The port is released before use, so a parallel test could in principle
/// grab it; in practice the window is short enough for test purposes.
#[must_use]
pub fn free_address() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("binds an ephemeral port");
    let address = listener.local_addr().expect("has an address");
    drop(listener);
    address.to_string()
}

/// Builds a service name or panics; tests only
#[must_use]
pub fn service(name: &str) -> ServiceName {
    ServiceName::try_new(name).expect("valid service name")
}

/// Shuts a domain down with a patience ceiling so a wedged shutdown fails
/// the test instead of hanging it
pub async fn shutdown(domain: Domain) {
    tokio::time::timeout(Duration::from_secs(10), domain.shutdown())
        .await
        .expect("domain shuts down within its grace periods");
}
