//! Gateway message payloads
//!
//! Domain connect and discovery cross the wire in the network layout; their
//! shapes and type values are pinned by the inter-domain protocol.

use serde::{Deserialize, Serialize};

use crate::domain_types::{DomainId, DomainName, Hops, QueueName, ServiceName};
use crate::message::service::Service;
use crate::process::ProcessHandle;

/// Inter-domain protocol versions, newest first
pub const PROTOCOL_VERSIONS: [u64; 2] = [1001, 1000];

/// Identity a peer presents during connection setup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Stable domain id
    pub id: DomainId,
    /// Human-readable name
    pub name: DomainName,
}

/// First message on a fresh connection, from the logical-outbound side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainConnectRequest {
    /// The connecting domain
    pub domain: Identity,
    /// Protocol versions the connector supports
    pub versions: Vec<u64>,
}

/// Version selection; zero means no common version and the connection closes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainConnectReply {
    /// The accepting domain
    pub domain: Identity,
    /// Selected version, or 0 on mismatch
    pub version: u64,
}

/// Ask peers whether they host services or queues
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoverRequest {
    /// Reply address; rewritten at every routing hop
    pub process: Option<ProcessHandle>,
    /// The requesting domain
    pub domain: Identity,
    /// Services to discover
    pub services: Vec<ServiceName>,
    /// Queues to discover
    pub queues: Vec<QueueName>,
}

/// A service a peer claims to host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredService {
    /// Service properties as the peer advertises them
    pub service: Service,
    /// Distance from the peer; advertised locally as `hops + 1`
    pub hops: Hops,
}

/// One peer's discovery answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoverReply {
    /// The answering domain
    pub domain: Identity,
    /// Services the peer hosts
    pub services: Vec<DiscoveredService>,
    /// Queues the peer hosts
    pub queues: Vec<QueueName>,
}

/// Consolidated fan-out result, sent to the original requester
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoverAccumulatedReply {
    /// Every peer answer gathered for the fan-out
    pub replies: Vec<DiscoverReply>,
}

/// Unsolicited topology update from a peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainAdvertise {
    /// The advertising domain
    pub domain: Identity,
    /// Services now hosted
    pub services: Vec<DiscoveredService>,
    /// Queues now hosted
    pub queues: Vec<QueueName>,
}

/// Re-run discovery on every outbound connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RediscoverRequest {
    /// The requesting process (reply address)
    pub process: ProcessHandle,
}

/// Rediscovery completed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RediscoverReply {
    /// Connections that answered
    pub connections: u64,
}

/// Picks the highest protocol version both sides support
#[must_use]
pub fn negotiate(ours: &[u64], theirs: &[u64]) -> Option<u64> {
    ours.iter().copied().find(|v| theirs.contains(v))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiation_picks_highest_common() {
        assert_eq!(negotiate(&PROTOCOL_VERSIONS, &[1000, 1001]), Some(1001));
        assert_eq!(negotiate(&PROTOCOL_VERSIONS, &[1000]), Some(1000));
        assert_eq!(negotiate(&PROTOCOL_VERSIONS, &[999]), None);
    }
}
