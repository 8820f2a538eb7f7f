//! Domain types shared across the coordination fabric
//!
//! Strongly-typed domain values to prevent primitive obsession: process and
//! device identifiers, service and queue names, routing order, retry policy.

use nutype::nutype;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use uuid::Uuid;

/// Process identifier within a domain.
///
/// Allocated by the domain manager when an instance is spawned; a pid alone
/// does not address a process, only a [`crate::process::ProcessHandle`] does.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct Pid(u64);

static NEXT_PID: AtomicU64 = AtomicU64::new(1);

impl Pid {
    /// Allocates the next pid in this domain.
    #[must_use]
    pub fn allocate() -> Self {
        Self::new(NEXT_PID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Identifier of an inbound message device.
///
/// An instance can have a pid before it has registered an inbound device,
/// which is why pid and ipc id are carried separately.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct IpcId(Uuid);

impl IpcId {
    /// Creates a new random device id
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Identity of a domain, exchanged during gateway connection setup
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct DomainId(Uuid);

impl DomainId {
    /// Creates a new random domain id
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Human-readable domain name
#[nutype(
    sanitize(trim),
    validate(len_char_min = 1, len_char_max = 255),
    derive(
        Clone, Debug, Eq, PartialEq, Hash, Display, Serialize, Deserialize, TryFrom, Into
    )
)]
pub struct DomainName(String);

/// Advertised service name, possibly a route alias
#[nutype(
    sanitize(trim),
    validate(len_char_min = 1, len_char_max = 255),
    derive(
        Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Display, Serialize, Deserialize,
        TryFrom, Into
    )
)]
pub struct ServiceName(String);

/// Name of a persistent queue
#[nutype(
    sanitize(trim),
    validate(len_char_min = 1, len_char_max = 255),
    derive(
        Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Display, Serialize, Deserialize,
        TryFrom, Into
    )
)]
pub struct QueueName(String);

/// Alias of a configured executable or server
#[nutype(
    sanitize(trim),
    validate(len_char_min = 1, len_char_max = 255),
    derive(
        Clone, Debug, Eq, PartialEq, Hash, Display, Serialize, Deserialize, TryFrom, Into
    )
)]
pub struct Alias(String);

/// Hop count to a concurrent (remote) instance.
///
/// Services reached through an outbound connection are one hop further away
/// than the peer advertises them.
#[nutype(
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        Hash,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        From,
        Into
    ),
    default = 0
)]
pub struct Hops(u64);

impl Hops {
    /// One hop further away
    #[must_use]
    pub fn increment(self) -> Self {
        Self::new(self.into_inner().saturating_add(1))
    }
}

/// Operator-configured priority band of an outbound group.
///
/// Lower order is preferred; ties are broken by hop count, then by
/// insertion order.
#[nutype(
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        Hash,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        From,
        Into
    ),
    default = 0
)]
pub struct InstanceOrder(u64);

/// Maximum rollback-redeliveries before a message moves to the error queue
#[nutype(
    validate(less_or_equal = 1_000_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 0
)]
pub struct RetryCount(u64);

/// Delay applied to `available_at` when a dequeue is rolled back
#[nutype(
    validate(less_or_equal = 86_400_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 0
)]
pub struct RetryDelayMs(u64);

impl RetryDelayMs {
    /// Converts to a [`Duration`]
    #[must_use]
    pub fn as_duration(&self) -> Duration {
        Duration::from_millis(self.into_inner())
    }
}

/// XA resource manager identifier (rmid)
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct ResourceId(u64);

/// Correlation id pairing a request with its reply
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct Correlation(Uuid);

impl Correlation {
    /// Creates a new random correlation
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Execution id, propagated across call chains for tracing
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct Execution(Uuid);

impl Execution {
    /// Creates a new random execution id
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Global transaction identifier (XID).
///
/// The same XID is carried unchanged across domain boundaries so both
/// coordinators log the same transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Xid {
    /// Global transaction id part
    pub gtrid: Uuid,
    /// Branch qualifier part
    pub bqual: Uuid,
}

impl Xid {
    /// Creates a new transaction identifier with a fresh global part
    #[must_use]
    pub fn generate() -> Self {
        Self {
            gtrid: Uuid::new_v4(),
            bqual: Uuid::new_v4(),
        }
    }

    /// Creates a branch of this transaction for a subordinate resource
    #[must_use]
    pub fn branch(&self) -> Self {
        Self {
            gtrid: self.gtrid,
            bqual: Uuid::new_v4(),
        }
    }
}

impl std::fmt::Display for Xid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.gtrid.simple(), self.bqual.simple())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_allocation_is_monotonic() {
        let a = Pid::allocate();
        let b = Pid::allocate();
        assert!(b > a);
    }

    #[test]
    fn service_name_rejects_empty() {
        assert!(ServiceName::try_new("").is_err());
        assert!(ServiceName::try_new("   ").is_err());
        assert!(ServiceName::try_new("casual/example/echo").is_ok());
    }

    #[test]
    fn hops_increment_saturates() {
        let hops = Hops::new(u64::MAX);
        assert_eq!(hops.increment().into_inner(), u64::MAX);
    }

    #[test]
    fn xid_branch_shares_gtrid() {
        let xid = Xid::generate();
        let branch = xid.branch();
        assert_eq!(xid.gtrid, branch.gtrid);
        assert_ne!(xid.bqual, branch.bqual);
        assert_ne!(xid, branch);
    }

    #[test]
    fn retry_delay_converts_to_duration() {
        let delay = RetryDelayMs::try_new(100).expect("100ms is within bounds");
        assert_eq!(delay.as_duration(), Duration::from_millis(100));
    }
}
