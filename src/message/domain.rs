//! Domain manager message payloads

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain_types::{Alias, Pid};
use crate::process::ProcessHandle;

/// Change the target instance count of an alias.
///
/// The domain manager spawns or cooperatively shuts down instances until the
/// running count matches the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleExecutable {
    /// Alias to scale
    pub alias: Alias,
    /// Desired number of running instances
    pub instances: usize,
}

/// Reply directive for a connect attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectDirective {
    /// Proceed; the process is registered
    Start,
    /// Another process already owns this identity; the caller must exit
    Singleton,
    /// The domain is going down; the caller must exit
    Shutdown,
}

/// A child announces itself to the domain manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessConnectRequest {
    /// The connecting process
    pub process: ProcessHandle,
    /// Well-known identity, for singletons
    pub identity: Option<Uuid>,
    /// Path or alias the instance was spawned from
    pub path: String,
}

/// Answer to a connect attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessConnectReply {
    /// What the connecting process must do
    pub directive: ConnectDirective,
}

/// Whether a lookup parks until the target registers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LookupDirective {
    /// Park the request until a matching connect arrives
    Wait,
    /// Reply immediately, with an empty handle if not present
    Direct,
}

/// Resolve an identity or pid to a process handle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessLookupRequest {
    /// The requesting process (reply address)
    pub process: ProcessHandle,
    /// Singleton identity to resolve
    pub identity: Option<Uuid>,
    /// Pid to resolve
    pub pid: Option<Pid>,
    /// Whether to park until present
    pub directive: LookupDirective,
}

/// Lookup result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessLookupReply {
    /// Echo of the requested identity
    pub identity: Option<Uuid>,
    /// Resolved handle; empty when not present under `Direct`
    pub process: Option<ProcessHandle>,
}

/// Ask the domain to take processes out of service ahead of shutdown
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessPrepareShutdownRequest {
    /// The requesting process (reply address)
    pub process: ProcessHandle,
    /// Instances about to be shut down
    pub processes: Vec<ProcessHandle>,
}

/// The instances whose in-flight calls will still be acknowledged
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessPrepareShutdownReply {
    /// Instances safe to take down
    pub processes: Vec<ProcessHandle>,
}
