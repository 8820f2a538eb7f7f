//! Service manager message payloads
//!
//! Advertise/lookup/call/ack shapes, the service information model and the
//! call metric carried on acknowledgement.

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

use crate::domain_types::{Correlation, Hops, InstanceOrder, ServiceName, Xid};
use crate::error::ErrorKind;
use crate::process::ProcessHandle;

/// Transaction-attachment mode of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TransactionMode {
    /// Join the caller's transaction if present, otherwise start one
    #[default]
    Automatic,
    /// Join the caller's transaction if present
    Join,
    /// Always execute in its own transaction
    Atomic,
    /// Never part of a transaction
    None,
}

/// What happens when a call exceeds its execution timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TimeoutContract {
    /// Report the timeout to the caller; the instance continues
    #[default]
    Linger,
    /// Terminate the instance and report `timeout` to the caller
    Kill,
}

/// Execution timeout of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionTimeout {
    /// Allowed call duration
    pub duration: Duration,
    /// Reaction when exceeded
    pub contract: TimeoutContract,
}

/// Advertised properties of a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    /// Advertised name
    pub name: ServiceName,
    /// Operator category, free-form
    pub category: String,
    /// Transaction attachment
    pub transaction: TransactionMode,
    /// Execution timeout, if configured
    pub timeout: Option<ExecutionTimeout>,
}

impl Service {
    /// A service with default properties
    #[must_use]
    pub fn named(name: ServiceName) -> Self {
        Self {
            name,
            category: String::new(),
            transaction: TransactionMode::default(),
            timeout: None,
        }
    }
}

/// Sequential instance advertisement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advertise {
    /// The advertising instance
    pub process: ProcessHandle,
    /// Services to add
    pub add: Vec<Service>,
    /// Services to remove
    pub remove: Vec<ServiceName>,
    /// Remove the whole instance first
    pub reset: bool,
}

impl Advertise {
    /// An advertisement that only clears the instance
    #[must_use]
    pub fn reset(process: ProcessHandle) -> Self {
        Self {
            process,
            add: Vec::new(),
            remove: Vec::new(),
            reset: true,
        }
    }
}

/// A remotely reachable service with its distance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrentService {
    /// Service properties
    pub service: Service,
    /// Distance in domain hops
    pub hops: Hops,
}

/// Concurrent (remote) instance advertisement, sent by the gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrentAdvertise {
    /// The advertising instance (an outbound connection)
    pub process: ProcessHandle,
    /// Priority band of the connection's group
    pub order: InstanceOrder,
    /// Services to add
    pub add: Vec<ConcurrentService>,
    /// Services to remove
    pub remove: Vec<ServiceName>,
    /// Remove the whole instance first
    pub reset: bool,
}

/// Caller intent carried on lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LookupContext {
    /// Ordinary call; the caller waits for the reply
    #[default]
    Regular,
    /// Fire-and-forget; resolves to the forward cache when busy
    NoReply,
    /// Lookup on behalf of the forward cache itself
    Forward,
}

/// Resolve a service name to an instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupRequest {
    /// The requesting process (reply address)
    pub process: ProcessHandle,
    /// Requested name, resolved through the route table
    pub requested: ServiceName,
    /// Caller intent
    pub context: LookupContext,
    /// Lookup deadline; pending entries expire at this point
    pub deadline: Option<SystemTime>,
}

/// State of a lookup reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LookupState {
    /// An instance is reserved (or addressable) for the caller
    Idle,
    /// All instances busy; a second reply follows
    Busy,
    /// The service is not known
    Absent,
}

/// Lookup result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupReply {
    /// Resolved service properties
    pub service: Service,
    /// Outcome
    pub state: LookupState,
    /// Reserved or addressable instance when `Idle`
    pub process: Option<ProcessHandle>,
}

/// Withdraw a pending lookup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupDiscardRequest {
    /// The requesting process (reply address)
    pub process: ProcessHandle,
    /// Name used in the original lookup
    pub requested: ServiceName,
    /// Correlation of the original lookup
    pub correlation: Correlation,
}

/// Outcome of a discard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscardState {
    /// The pending entry was removed; no further reply will arrive
    Discarded,
    /// A reply was already generated and is on its way
    Replied,
}

/// Discard result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupDiscardReply {
    /// Outcome
    pub state: DiscardState,
}

/// Service call request, addressed to a reserved or concurrent instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Call {
    /// The caller (reply address)
    pub process: ProcessHandle,
    /// Called service
    pub service: ServiceName,
    /// Ambient transaction, if the call is transactional
    pub trid: Option<Xid>,
    /// Fire-and-forget: no reply is expected
    pub no_reply: bool,
    /// Call deadline
    pub deadline: Option<SystemTime>,
    /// Opaque call payload
    pub payload: Vec<u8>,
}

/// Service call reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    /// Error kind; `None` means success
    pub code: Option<ErrorKind>,
    /// Ambient transaction, echoed back
    pub trid: Option<Xid>,
    /// Opaque reply payload
    pub payload: Vec<u8>,
}

impl Reply {
    /// A reply carrying only an error kind
    #[must_use]
    pub fn error(code: ErrorKind) -> Self {
        Self {
            code: Some(code),
            trid: None,
            payload: Vec::new(),
        }
    }
}

/// Call metric reported on acknowledgement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metric {
    /// Invoked service
    pub service: ServiceName,
    /// Call start
    pub start: SystemTime,
    /// Call end
    pub end: SystemTime,
    /// Outcome of the call
    pub code: Option<ErrorKind>,
}

impl Metric {
    /// Duration of the invocation
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.end.duration_since(self.start).unwrap_or_default()
    }
}

/// Instance acknowledgement: the call is done, the instance is idle again
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// The acknowledging instance
    pub process: ProcessHandle,
    /// Metric of the completed call
    pub metric: Metric,
}
