//! Example servers
//!
//! The canonical demonstration services: an echo that answers its payload
//! and a sleeper that holds its instance busy. Used by the domain binary's
//! default configuration and throughout the integration tests.

use std::time::Duration;

use crate::domain_types::ServiceName;
use crate::message::service::Service;
use crate::server::{Entry, Invocation};

/// Name of the echo service
pub const ECHO: &str = "casual/example/echo";
/// Name of the sleep service
pub const SLEEP: &str = "casual/example/sleep";

fn name(value: &str) -> ServiceName {
    ServiceName::try_new(value).unwrap_or_else(|_| unreachable!("static service name is valid"))
}

/// An echo service: the reply is the request
#[must_use]
pub fn echo() -> Entry {
    Entry::new(Service::named(name(ECHO)), |invocation: Invocation| async move {
        Ok(invocation.payload)
    })
}

/// A sleeper: holds the instance busy for the duration encoded in the
/// payload (milliseconds, decimal), then echoes
#[must_use]
pub fn sleep() -> Entry {
    Entry::new(Service::named(name(SLEEP)), |invocation: Invocation| async move {
        let millis = std::str::from_utf8(&invocation.payload)
            .ok()
            .and_then(|text| text.trim().parse::<u64>().ok())
            .unwrap_or(1000);
        tokio::time::sleep(Duration::from_millis(millis)).await;
        Ok(invocation.payload)
    })
}

/// The default example server: echo and sleep
#[must_use]
pub fn echo_server() -> Vec<Entry> {
    vec![echo(), sleep()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_carry_their_names() {
        let entries = echo_server();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].service.name, name(ECHO));
        assert_eq!(entries[1].service.name, name(SLEEP));
    }
}
