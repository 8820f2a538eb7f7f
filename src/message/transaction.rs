//! Transaction manager message payloads
//!
//! The commit/rollback pairs are intra-domain; the resource
//! prepare/commit/rollback pairs are pinned wire messages also carried
//! across gateways, which is what lets a remote domain act as just another
//! resource.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

use crate::domain_types::{ResourceId, Xid};
use crate::process::ProcessHandle;
use crate::xa::XaCode;

/// A resource proxy announces itself to the transaction manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceProxyConnect {
    /// The proxy instance
    pub process: ProcessHandle,
    /// Resource the proxy drives
    pub resource: ResourceId,
}

/// Ask the coordinator to commit a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRequest {
    /// The requesting process (reply address)
    pub process: ProcessHandle,
    /// Transaction to commit
    pub trid: Xid,
}

/// Stage of the commit the reply reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitStage {
    /// All participants voted yes and the decision is durable
    Prepared,
    /// The decision has been carried out
    Committed,
}

/// Commit outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitReply {
    /// Transaction this reply is about
    pub trid: Xid,
    /// Stage being reported
    pub stage: CommitStage,
    /// Outcome code
    pub code: XaCode,
}

/// Ask the coordinator to roll a transaction back
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackRequest {
    /// The requesting process (reply address)
    pub process: ProcessHandle,
    /// Transaction to roll back
    pub trid: Xid,
}

/// Rollback outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackReply {
    /// Transaction this reply is about
    pub trid: Xid,
    /// Outcome code
    pub code: XaCode,
}

/// Drive one resource through a 2PC phase.
///
/// Shared shape of the pinned prepare/commit/rollback requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    /// The coordinator (reply address)
    pub process: ProcessHandle,
    /// Transaction branch
    pub trid: Xid,
    /// Resource the phase is addressed to
    pub resource: ResourceId,
    /// XA flags word; zero for the flows modeled here
    pub flags: u64,
}

/// Resource answer to a 2PC phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceReply {
    /// The answering proxy or peer
    pub process: ProcessHandle,
    /// Transaction branch
    pub trid: Xid,
    /// Resource that answered
    pub resource: ResourceId,
    /// XA return code
    pub state: XaCode,
}

/// Record resources that have joined a transaction.
///
/// Sent by caller-side frameworks when a call crosses a transaction
/// boundary, and upward by callee frameworks touching a new resource.
/// Commit traverses only the involved set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceInvolved {
    /// The reporting process
    pub process: ProcessHandle,
    /// Transaction the resources joined
    pub trid: Xid,
    /// Resources now involved
    pub resources: Vec<ResourceId>,
    /// Transaction deadline, propagated from the call
    pub deadline: Option<SystemTime>,
}

/// An inbound gateway reports that a remote peer joined a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalResourceInvolved {
    /// The reporting gateway connection
    pub process: ProcessHandle,
    /// Transaction the peer joined
    pub trid: Xid,
}
