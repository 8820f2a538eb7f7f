//! Event message payloads
//!
//! Events are fanned out to subscribed listeners; a listener that dies is
//! dropped from the subscription table by the exit handling of its manager.

use serde::{Deserialize, Serialize};

use crate::domain_types::{Alias, Pid};
use crate::message::service::{Metric, TimeoutContract};
use crate::message::types::MessageType;
use crate::process::{Exit, ProcessHandle};

/// Subscribe to event types; an empty filter means all events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionBegin {
    /// The subscribing process
    pub process: ProcessHandle,
    /// Event types of interest
    pub types: Vec<MessageType>,
}

/// End a subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionEnd {
    /// The unsubscribing process
    pub process: ProcessHandle,
}

/// Instances were spawned for an alias
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSpawn {
    /// Alias the instances belong to
    pub alias: Alias,
    /// Spawned pids
    pub pids: Vec<Pid>,
}

/// An instance left the domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessExit {
    /// The exit observation
    pub exit: Exit,
}

/// Batched call metrics from the service manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceCalls {
    /// Completed-call metrics since the last fan-out
    pub metrics: Vec<Metric>,
}

/// A reserved call exceeded its execution timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assassination {
    /// The instance that overran
    pub target: Pid,
    /// Configured reaction
    pub contract: TimeoutContract,
}
