//! Queue manager and queue group message payloads

use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use uuid::Uuid;

use crate::domain_types::{QueueName, RetryCount, RetryDelayMs, Xid};
use crate::error::ErrorKind;
use crate::process::ProcessHandle;

/// Configured properties of a queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Queue {
    /// Queue name
    pub name: QueueName,
    /// Redeliveries before the message moves to the error queue
    pub retry_count: RetryCount,
    /// Delay applied to `available_at` on rollback
    pub retry_delay: RetryDelayMs,
}

/// A queue group registers with the queue manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupConnectRequest {
    /// The connecting group
    pub process: ProcessHandle,
    /// Group name
    pub name: String,
}

/// The group's configured queues
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupConnectReply {
    /// Queues the group must host
    pub queues: Vec<Queue>,
}

/// Queues hosted by a group (or reachable through a gateway)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueAdvertise {
    /// The hosting group or gateway connection
    pub process: ProcessHandle,
    /// Names now hosted
    pub add: Vec<QueueName>,
    /// Names no longer hosted
    pub remove: Vec<QueueName>,
    /// Remove everything for this process first
    pub reset: bool,
}

/// Resolve a queue name to its hosting group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupRequest {
    /// The requesting process (reply address)
    pub process: ProcessHandle,
    /// Queue to resolve
    pub name: QueueName,
}

/// Lookup result; an empty process means the queue is absent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupReply {
    /// Echo of the requested name
    pub name: QueueName,
    /// Hosting group, when known
    pub process: Option<ProcessHandle>,
}

/// Withdraw a parked queue lookup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupDiscardRequest {
    /// The requesting process (reply address)
    pub process: ProcessHandle,
    /// Correlation of the original lookup
    pub correlation: crate::domain_types::Correlation,
}

/// Discard outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupDiscardReply {
    /// Whether the entry was discarded or already replied
    pub state: crate::message::service::DiscardState,
}

/// Payload and metadata of an enqueued message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Message id; assigned by the group on enqueue
    pub id: Uuid,
    /// Free-form routing properties
    pub properties: String,
    /// Queue a consumer should reply to
    pub reply: Option<QueueName>,
    /// Payload content type
    pub r#type: String,
    /// Opaque payload
    pub payload: Vec<u8>,
    /// Not deliverable before this point
    pub available: SystemTime,
    /// Enqueue timestamp
    pub timestamp: SystemTime,
    /// Times this message has been rolled back to the queue
    pub redelivered: u64,
}

/// Enqueue under the ambient transaction (visible on commit)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueRequest {
    /// The requesting process (reply address)
    pub process: ProcessHandle,
    /// Target queue
    pub name: QueueName,
    /// Ambient transaction; `None` enqueues auto-committed
    pub trid: Option<Xid>,
    /// The message to enqueue
    pub message: Message,
}

/// Enqueue outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueReply {
    /// Assigned message id on success
    pub id: Option<Uuid>,
    /// Error kind; `None` means success
    pub code: Option<ErrorKind>,
}

/// Dequeue under the ambient transaction (reversed on rollback)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DequeueRequest {
    /// The requesting process (reply address)
    pub process: ProcessHandle,
    /// Source queue
    pub name: QueueName,
    /// Ambient transaction; `None` dequeues auto-committed
    pub trid: Option<Xid>,
    /// Match on message properties, when set
    pub properties: Option<String>,
    /// Park as a waiter instead of replying empty
    pub block: bool,
}

/// Dequeue outcome; an empty message means nothing was available
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DequeueReply {
    /// The dequeued message, if any
    pub message: Option<Message>,
    /// Error kind; `None` means success
    pub code: Option<ErrorKind>,
}

/// Withdraw a parked blocking dequeue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DequeueForgetRequest {
    /// The requesting process (reply address)
    pub process: ProcessHandle,
    /// Queue the waiter is parked on
    pub name: QueueName,
    /// Correlation of the original dequeue
    pub correlation: crate::domain_types::Correlation,
}

/// Forget outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DequeueForgetReply {
    /// Whether a waiter was found and removed
    pub found: bool,
}

/// Inspect messages without consuming them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeekRequest {
    /// The requesting process (reply address)
    pub process: ProcessHandle,
    /// Queue to inspect
    pub name: QueueName,
}

/// Peeked messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeekReply {
    /// Messages currently on the queue
    pub messages: Vec<Message>,
}

/// Per-queue depth metrics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Information {
    /// Queue name
    pub name: QueueName,
    /// Deliverable messages
    pub count: u64,
    /// Messages parked on the error queue
    pub error_count: u64,
}

/// List queues with their depth metrics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InformationRequest {
    /// The requesting process (reply address)
    pub process: ProcessHandle,
}

/// Queue listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InformationReply {
    /// All queues known to the answering group
    pub queues: Vec<Information>,
}

/// Move error-queue messages back to their origin queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreRequest {
    /// The requesting process (reply address)
    pub process: ProcessHandle,
    /// Queue to restore
    pub name: QueueName,
}

/// Restore outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreReply {
    /// Messages moved back
    pub restored: u64,
}

/// Purge all messages from a queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearRequest {
    /// The requesting process (reply address)
    pub process: ProcessHandle,
    /// Queue to purge
    pub name: QueueName,
}

/// Clear outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearReply {
    /// Messages removed
    pub removed: u64,
}
