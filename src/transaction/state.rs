//! Transaction manager state
//!
//! Transactions keyed by XID, resource proxy pools with parked requests,
//! and dynamically registered external resources (gateway connections and
//! queue groups). Pure state transitions; the manager turns outcomes into
//! messages and log writes.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use serde::Serialize;
use tracing::warn;

use crate::domain_types::{Correlation, Execution, Pid, ResourceId, Xid};
use crate::process::ProcessHandle;
use crate::xa::XaCode;

/// First id handed out to dynamically registered external resources; low
/// values belong to configured resources
pub const EXTERNAL_RESOURCE_BASE: u64 = 1000;

/// Stage of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Stage {
    /// Work in progress; resources may still join
    Active,
    /// Prepare fan-out outstanding
    Preparing,
    /// Every vote collected, decision durable
    Prepared,
    /// Commit fan-out outstanding
    Committing,
    /// Done, committed
    Committed,
    /// Rollback fan-out outstanding
    RollingBack,
    /// Done, rolled back
    RolledBack,
    /// A resource decided unilaterally; terminal, operator evidence kept
    Heuristic,
}

impl Stage {
    /// Whether the transaction is finished
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack | Self::Heuristic)
    }
}

/// The caller awaiting the commit or rollback outcome
#[derive(Debug, Clone, Copy)]
pub struct Owner {
    /// Reply address
    pub process: ProcessHandle,
    /// Correlation of the commit/rollback request
    pub correlation: Correlation,
    /// Execution of the request
    pub execution: Execution,
}

/// Phase a subordinate coordination owes a reply for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubordinatePhase {
    /// An aggregated prepare vote
    Prepare,
    /// An aggregated commit result
    Commit,
    /// An aggregated rollback result
    Rollback,
}

/// A superior coordinator (remote domain through the inbound gateway)
/// driving this manager as one resource
#[derive(Debug, Clone, Copy)]
pub struct Subordinate {
    /// The carrying connection; replies tunnel back through it
    pub requester: ProcessHandle,
    /// Correlation of the outstanding phase request
    pub correlation: Correlation,
    /// Execution of the request
    pub execution: Execution,
    /// The resource id the superior knows this domain by
    pub resource: ResourceId,
    /// The phase a reply is owed for, if any
    pub awaiting: Option<SubordinatePhase>,
}

/// One distributed transaction
#[derive(Debug)]
pub struct Transaction {
    /// Identity
    pub trid: Xid,
    /// Current stage
    pub stage: Stage,
    /// Caller awaiting the outcome, set by commit/rollback request
    pub owner: Option<Owner>,
    /// Involved resources, deduplicated, in join order
    pub involved: Vec<ResourceId>,
    /// Prepare votes by resource
    pub votes: HashMap<ResourceId, XaCode>,
    /// Commit/rollback results by resource
    pub results: HashMap<ResourceId, XaCode>,
    /// Deadline after which the manager rolls back
    pub deadline: Option<Instant>,
    /// Single-resource commit-one-phase in flight
    pub one_phase: bool,
    /// The owner asked for commit; a rollback outcome answers on the
    /// commit pair
    pub owner_requested_commit: bool,
    /// Set when a superior coordinator drives this transaction
    pub subordinate: Option<Subordinate>,
}

impl Transaction {
    fn new(trid: Xid) -> Self {
        Self {
            trid,
            stage: Stage::Active,
            owner: None,
            involved: Vec::new(),
            votes: HashMap::new(),
            results: HashMap::new(),
            deadline: None,
            one_phase: false,
            owner_requested_commit: false,
            subordinate: None,
        }
    }

    /// Adds resources, keeping the set deduplicated
    pub fn involve(&mut self, resources: &[ResourceId]) {
        for resource in resources {
            if !self.involved.contains(resource) {
                self.involved.push(*resource);
            }
        }
    }

    /// All prepare votes are in
    #[must_use]
    pub fn voted(&self) -> bool {
        self.involved
            .iter()
            .all(|resource| self.votes.contains_key(resource))
    }

    /// Resources that voted yes with work to commit (read-only voters are
    /// done after prepare)
    #[must_use]
    pub fn committable(&self) -> Vec<ResourceId> {
        self.involved
            .iter()
            .filter(|resource| self.votes.get(resource) == Some(&XaCode::Ok))
            .copied()
            .collect()
    }

    /// Any heuristic vote or result
    #[must_use]
    pub fn heuristic(&self) -> bool {
        self.votes.values().chain(self.results.values()).any(|code| code.is_heuristic())
    }

    /// All expected phase-two results are in for the given set
    #[must_use]
    pub fn resolved(&self, expected: &[ResourceId]) -> bool {
        expected
            .iter()
            .all(|resource| self.results.contains_key(resource))
    }
}

/// A resource proxy instance
#[derive(Debug)]
pub struct Proxy {
    /// Address of the proxy
    pub process: ProcessHandle,
    /// Busy on an outstanding phase request
    pub busy: bool,
}

/// A configured resource and its proxy pool
#[derive(Debug)]
pub struct Pool {
    /// Resource id (rmid)
    pub id: ResourceId,
    /// Operator name
    pub name: String,
    /// Configured pool size
    pub configured: usize,
    /// Running proxies
    pub instances: Vec<Proxy>,
}

impl Pool {
    /// Reserves an idle proxy; `None` parks the request
    pub fn reserve(&mut self) -> Option<ProcessHandle> {
        let proxy = self.instances.iter_mut().find(|proxy| !proxy.busy)?;
        proxy.busy = true;
        Some(proxy.process)
    }

    /// Releases the proxy that answered
    pub fn release(&mut self, pid: Pid) {
        if let Some(proxy) = self
            .instances
            .iter_mut()
            .find(|proxy| proxy.process.pid == pid)
        {
            proxy.busy = false;
        }
    }
}

/// A phase request parked until a proxy frees up
#[derive(Debug)]
pub struct ParkedRequest {
    /// Resource the request is addressed to
    pub resource: ResourceId,
    /// The request, re-sent verbatim
    pub envelope: crate::message::Envelope,
}

/// Transaction manager state
pub struct State {
    /// Transactions by XID
    pub transactions: HashMap<Xid, Transaction>,
    /// Configured resource pools by id
    pub pools: Vec<Pool>,
    /// External resources: id to the connection/group that carries them
    pub externals: HashMap<ResourceId, ProcessHandle>,
    /// Reverse map for exit handling
    pub external_by_pid: HashMap<Pid, ResourceId>,
    /// Requests parked for a busy pool
    pub parked: VecDeque<ParkedRequest>,
    next_external: u64,
}

impl State {
    /// Builds state with the configured pools
    #[must_use]
    pub fn new(resources: &[(ResourceId, String, usize)]) -> Self {
        Self {
            transactions: HashMap::new(),
            pools: resources
                .iter()
                .map(|(id, name, configured)| Pool {
                    id: *id,
                    name: name.clone(),
                    configured: *configured,
                    instances: Vec::new(),
                })
                .collect(),
            externals: HashMap::new(),
            external_by_pid: HashMap::new(),
            parked: VecDeque::new(),
            next_external: EXTERNAL_RESOURCE_BASE,
        }
    }

    /// The transaction for a trid, created on first touch
    pub fn transaction(&mut self, trid: Xid) -> &mut Transaction {
        self.transactions
            .entry(trid)
            .or_insert_with(|| Transaction::new(trid))
    }

    /// Registers (or finds) the external resource carried by a process
    pub fn external_resource(&mut self, process: ProcessHandle) -> ResourceId {
        if let Some(id) = self.external_by_pid.get(&process.pid) {
            return *id;
        }
        let id = ResourceId::new(self.next_external);
        self.next_external += 1;
        self.externals.insert(id, process);
        self.external_by_pid.insert(process.pid, id);
        id
    }

    /// Finds the pool owning a resource id
    pub fn pool_mut(&mut self, resource: ResourceId) -> Option<&mut Pool> {
        self.pools.iter_mut().find(|pool| pool.id == resource)
    }

    /// The pool a proxy pid belongs to
    pub fn pool_of_mut(&mut self, pid: Pid) -> Option<&mut Pool> {
        self.pools
            .iter_mut()
            .find(|pool| pool.instances.iter().any(|proxy| proxy.process.pid == pid))
    }

    /// Forgets a dead proxy or external carrier
    pub fn remove_process(&mut self, pid: Pid) {
        for pool in &mut self.pools {
            pool.instances.retain(|proxy| proxy.process.pid != pid);
        }
        if let Some(id) = self.external_by_pid.remove(&pid) {
            self.externals.remove(&id);
        }
    }

    /// Earliest transaction deadline
    #[must_use]
    pub fn earliest_deadline(&self) -> Option<Instant> {
        self.transactions
            .values()
            .filter(|transaction| transaction.stage == Stage::Active)
            .filter_map(|transaction| transaction.deadline)
            .min()
    }

    /// Active transactions whose deadline has passed
    pub fn expired(&self, now: Instant) -> Vec<Xid> {
        self.transactions
            .values()
            .filter(|transaction| {
                transaction.stage == Stage::Active
                    && transaction.deadline.is_some_and(|deadline| deadline <= now)
            })
            .map(|transaction| transaction.trid)
            .collect()
    }

    /// Drops terminal transactions; called after replies are released
    pub fn sweep(&mut self) {
        self.transactions
            .retain(|_, transaction| !transaction.stage.is_terminal());
    }

    /// Flags an inconsistent reply (unknown trid or resource)
    pub fn consistency_warning(trid: Xid, resource: ResourceId, context: &str) {
        warn!(%trid, %resource, context, "reply for unknown transaction state - action: discard");
    }
}

/// Serializable snapshot for the admin surface
#[derive(Debug, Serialize)]
pub struct Snapshot {
    /// Live transactions
    pub transactions: Vec<TransactionSnapshot>,
    /// Pool states
    pub pools: Vec<PoolSnapshot>,
    /// External resources
    pub externals: usize,
    /// Parked phase requests
    pub parked: usize,
    /// Log metrics: durable writes
    pub log_writes: u64,
    /// Log metrics: batched writes
    pub log_batched: u64,
}

/// Transaction part of the snapshot
#[derive(Debug, Serialize)]
pub struct TransactionSnapshot {
    /// XID rendered as text
    pub trid: String,
    /// Current stage
    pub stage: Stage,
    /// Involved resource ids
    pub resources: Vec<u64>,
}

/// Pool part of the snapshot
#[derive(Debug, Serialize)]
pub struct PoolSnapshot {
    /// Resource id
    pub id: u64,
    /// Operator name
    pub name: String,
    /// Running instances
    pub instances: usize,
    /// Busy instances
    pub busy: usize,
}

impl State {
    /// Takes an admin snapshot; log metrics are supplied by the manager
    #[must_use]
    pub fn snapshot(&self, log_writes: u64, log_batched: u64) -> Snapshot {
        Snapshot {
            transactions: self
                .transactions
                .values()
                .map(|transaction| TransactionSnapshot {
                    trid: transaction.trid.to_string(),
                    stage: transaction.stage,
                    resources: transaction
                        .involved
                        .iter()
                        .map(|id| u64::from(*id))
                        .collect(),
                })
                .collect(),
            pools: self
                .pools
                .iter()
                .map(|pool| PoolSnapshot {
                    id: u64::from(pool.id),
                    name: pool.name.clone(),
                    instances: pool.instances.len(),
                    busy: pool.instances.iter().filter(|proxy| proxy.busy).count(),
                })
                .collect(),
            externals: self.externals.len(),
            parked: self.parked.len(),
            log_writes,
            log_batched,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain_types::IpcId;

    fn handle(pid: u64) -> ProcessHandle {
        ProcessHandle::new(Pid::new(pid), IpcId::generate())
    }

    #[test]
    fn involve_deduplicates_preserving_order() {
        let mut transaction = Transaction::new(Xid::generate());
        transaction.involve(&[ResourceId::new(2), ResourceId::new(1)]);
        transaction.involve(&[ResourceId::new(1), ResourceId::new(3)]);
        assert_eq!(
            transaction.involved,
            vec![ResourceId::new(2), ResourceId::new(1), ResourceId::new(3)]
        );
    }

    #[test]
    fn voted_requires_every_involved_resource() {
        let mut transaction = Transaction::new(Xid::generate());
        transaction.involve(&[ResourceId::new(1), ResourceId::new(2)]);
        transaction.votes.insert(ResourceId::new(1), XaCode::Ok);
        assert!(!transaction.voted());
        transaction.votes.insert(ResourceId::new(2), XaCode::ReadOnly);
        assert!(transaction.voted());
        // only the Ok voter has commit work left
        assert_eq!(transaction.committable(), vec![ResourceId::new(1)]);
    }

    #[test]
    fn pool_reserve_and_release() {
        let mut pool = Pool {
            id: ResourceId::new(1),
            name: "rm-test".into(),
            configured: 2,
            instances: vec![
                Proxy {
                    process: handle(10),
                    busy: false,
                },
                Proxy {
                    process: handle(11),
                    busy: false,
                },
            ],
        };

        let first = pool.reserve().expect("idle proxy");
        let second = pool.reserve().expect("second idle proxy");
        assert_ne!(first.pid, second.pid);
        assert!(pool.reserve().is_none());

        pool.release(first.pid);
        assert_eq!(pool.reserve().expect("released proxy").pid, first.pid);
    }

    #[test]
    fn external_resource_ids_are_stable_per_process() {
        let mut state = State::new(&[]);
        let carrier = handle(42);
        let first = state.external_resource(carrier);
        let second = state.external_resource(carrier);
        assert_eq!(first, second);
        assert!(u64::from(first) >= EXTERNAL_RESOURCE_BASE);
    }

    #[test]
    fn sweep_drops_terminal_transactions() {
        let mut state = State::new(&[]);
        let trid = Xid::generate();
        state.transaction(trid).stage = Stage::Committed;
        let live = Xid::generate();
        state.transaction(live).stage = Stage::Preparing;

        state.sweep();
        assert!(!state.transactions.contains_key(&trid));
        assert!(state.transactions.contains_key(&live));
    }
}
