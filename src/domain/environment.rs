//! Per-domain environment
//!
//! The domain manager publishes singleton handles through environment
//! variables so children can address them without a lookup round-trip. The
//! table is scoped to the domain (the "spawning shell"), which also keeps
//! domains booted side by side in one test process from interfering.

use std::sync::Arc;

use dashmap::DashMap;
use uuid::Uuid;

use crate::domain_types::{IpcId, Pid};
use crate::process::ProcessHandle;

/// Environment table handed to every spawned instance
#[derive(Debug, Default)]
pub struct Environment {
    variables: DashMap<String, String>,
}

impl Environment {
    /// Creates an empty environment
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Sets a variable
    pub fn set(&self, name: &str, value: String) {
        self.variables.insert(name.to_string(), value);
    }

    /// Reads a variable
    #[must_use]
    pub fn get(&self, name: &str) -> Option<String> {
        self.variables.get(name).map(|entry| entry.clone())
    }

    /// Publishes a process handle under a variable
    pub fn set_handle(&self, name: &str, process: ProcessHandle) {
        self.set(
            name,
            format!("{}:{}", u64::from(process.pid), Uuid::from(process.ipc)),
        );
    }

    /// Reads a process handle published with [`Environment::set_handle`]
    #[must_use]
    pub fn handle(&self, name: &str) -> Option<ProcessHandle> {
        let value = self.get(name)?;
        let (pid, ipc) = value.split_once(':')?;
        let pid = pid.parse::<u64>().ok()?;
        let ipc = ipc.parse::<Uuid>().ok()?;
        Some(ProcessHandle::new(Pid::new(pid), IpcId::new(ipc)))
    }
}

/// Reads the domain identity published by the domain manager; a fresh
/// identity is synthesized when the environment carries none (tests that
/// run a manager without a domain)
#[must_use]
pub fn domain_identity(environment: &Environment) -> crate::message::gateway::Identity {
    use crate::domain_types::{DomainId, DomainName};

    let id = environment
        .get(crate::domain::DOMAIN_ID_VARIABLE)
        .and_then(|value| value.parse::<Uuid>().ok())
        .map_or_else(DomainId::generate, DomainId::new);
    let name = environment
        .get(crate::domain::DOMAIN_NAME_VARIABLE)
        .and_then(|value| DomainName::try_new(value).ok())
        .unwrap_or_else(|| {
            DomainName::try_new("anonymous").unwrap_or_else(|_| unreachable!("static name is valid"))
        });
    crate::message::gateway::Identity { id, name }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_round_trip() {
        let environment = Environment::new();
        let handle = ProcessHandle::new(Pid::new(7), IpcId::generate());
        environment.set_handle("CASUAL_TEST_IPC", handle);
        assert_eq!(environment.handle("CASUAL_TEST_IPC"), Some(handle));
    }

    #[test]
    fn absent_variable_is_none() {
        let environment = Environment::new();
        assert!(environment.get("CASUAL_MISSING").is_none());
        assert!(environment.handle("CASUAL_MISSING").is_none());
    }
}
