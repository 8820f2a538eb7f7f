//! Process handles, well-known singleton identities and exit events

use serde::{Deserialize, Serialize};
use uuid::{Uuid, uuid};

use crate::domain_types::{IpcId, Pid};

/// Address of a running instance.
///
/// A pid alone is insufficient: an instance can have a pid before it has
/// registered an inbound device. A handle is complete only when both parts
/// are known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessHandle {
    /// Domain-scoped process id
    pub pid: Pid,
    /// The instance's inbound device
    pub ipc: IpcId,
}

impl ProcessHandle {
    /// Creates a handle from its parts
    #[must_use]
    pub fn new(pid: Pid, ipc: IpcId) -> Self {
        Self { pid, ipc }
    }
}

impl std::fmt::Display for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[pid: {}, ipc: {}]", self.pid, self.ipc)
    }
}

/// Why an instance left the domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    /// Normal exit with a status code
    Exited {
        /// Exit status of the instance
        code: i32,
    },
    /// Terminated by a signal
    Signaled {
        /// Signal number
        signal: i32,
    },
    /// Abnormal termination with a core dump
    Core,
}

impl ExitReason {
    /// Whether the exit was a clean, zero-status termination
    #[must_use]
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Exited { code: 0 })
    }
}

/// Instance termination, fanned out by the domain manager to subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exit {
    /// Pid of the exited instance
    pub pid: Pid,
    /// How it exited
    pub reason: ExitReason,
}

/// Well-known singleton identities.
///
/// At most one instance per identity may be registered in a domain; a second
/// connect attempt is answered with the `singleton` directive. The identity
/// values are stable and part of the protocol.
pub mod identity {
    use super::Uuid;
    use super::uuid;

    /// Service manager singleton identity
    pub const SERVICE_MANAGER: Uuid = uuid!("f58e0b18-1b1b-48eb-8bba-01b3136ed82a");
    /// Transaction manager singleton identity
    pub const TRANSACTION_MANAGER: Uuid = uuid!("5ec18cd9-2b2e-4c60-a927-e9b1b68537e7");
    /// Queue manager singleton identity
    pub const QUEUE_MANAGER: Uuid = uuid!("c0c5a19d-fc27-4652-9949-4ad7a5c229cd");
    /// Gateway manager singleton identity
    pub const GATEWAY_MANAGER: Uuid = uuid!("b9624e2f-8540-4480-913b-06e8d503fce5");
    /// Forward cache singleton identity
    pub const FORWARD_CACHE: Uuid = uuid!("f17d0109-2564-4f72-8d43-2fa4a6cf5257");
}

/// Environment variable names through which the domain manager publishes
/// singleton handles, so children can address them without a lookup
/// round-trip.
pub mod environment {
    use uuid::Uuid;

    use super::identity;

    /// Domain manager device
    pub const DOMAIN_MANAGER: &str = "CASUAL_DOMAIN_MANAGER_IPC";
    /// Service manager device
    pub const SERVICE_MANAGER: &str = "CASUAL_SERVICE_MANAGER_IPC";
    /// Transaction manager device
    pub const TRANSACTION_MANAGER: &str = "CASUAL_TRANSACTION_MANAGER_IPC";
    /// Queue manager device
    pub const QUEUE_MANAGER: &str = "CASUAL_QUEUE_MANAGER_IPC";
    /// Gateway manager device
    pub const GATEWAY_MANAGER: &str = "CASUAL_GATEWAY_MANAGER_IPC";
    /// Forward cache device
    pub const FORWARD_CACHE: &str = "CASUAL_FORWARD_CACHE_IPC";

    /// The variable a singleton identity is published under, if any
    #[must_use]
    pub fn variable(identity: Uuid) -> Option<&'static str> {
        match identity {
            identity::SERVICE_MANAGER => Some(SERVICE_MANAGER),
            identity::TRANSACTION_MANAGER => Some(TRANSACTION_MANAGER),
            identity::QUEUE_MANAGER => Some(QUEUE_MANAGER),
            identity::GATEWAY_MANAGER => Some(GATEWAY_MANAGER),
            identity::FORWARD_CACHE => Some(FORWARD_CACHE),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_exit_detection() {
        assert!(ExitReason::Exited { code: 0 }.is_clean());
        assert!(!ExitReason::Exited { code: 1 }.is_clean());
        assert!(!ExitReason::Signaled { signal: 9 }.is_clean());
        assert!(!ExitReason::Core.is_clean());
    }

    #[test]
    fn singleton_identities_are_distinct() {
        let all = [
            identity::SERVICE_MANAGER,
            identity::TRANSACTION_MANAGER,
            identity::QUEUE_MANAGER,
            identity::GATEWAY_MANAGER,
            identity::FORWARD_CACHE,
        ];
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn environment_variable_mapping() {
        assert_eq!(
            environment::variable(identity::SERVICE_MANAGER),
            Some(environment::SERVICE_MANAGER)
        );
        assert_eq!(
            environment::variable(identity::FORWARD_CACHE),
            Some(environment::FORWARD_CACHE)
        );
    }
}
