//! Service manager state
//!
//! The registry proper: services with their sequential and concurrent
//! instance lists, the FIFO pending-lookup queue, route expansion, and call
//! metrics. All operations are pure state transitions; the surrounding
//! manager turns their outcomes into messages.

use std::collections::{HashMap, VecDeque};
use std::time::{Instant, SystemTime};

use serde::Serialize;
use tracing::{error, warn};

use crate::configuration;
use crate::domain_types::{Correlation, Execution, Hops, InstanceOrder, Pid, ServiceName};
use crate::error::ErrorKind;
use crate::message::service::{
    Advertise, ConcurrentAdvertise, LookupContext, Metric, Service, TimeoutContract,
};
use crate::process::ProcessHandle;

/// The busy half of a sequential instance: exactly one outstanding call
#[derive(Debug, Clone)]
pub struct Reservation {
    /// Service the call was dispatched to (the route name, for accounting)
    pub service: ServiceName,
    /// The caller awaiting the reply
    pub caller: ProcessHandle,
    /// Correlation of the lookup/call exchange
    pub correlation: Correlation,
    /// Execution of the call chain
    pub execution: Execution,
    /// When the reservation was made
    pub started: Instant,
    /// Execution-timeout deadline, when the service has one
    pub deadline: Option<Instant>,
    /// Contract applied when the deadline fires
    pub contract: TimeoutContract,
    /// A timeout reply has already been synthesized; suppress later replies
    pub timed_out: bool,
}

/// A local single-threaded instance
#[derive(Debug)]
pub struct Sequential {
    /// Address of the instance
    pub process: ProcessHandle,
    /// The outstanding call, when busy
    pub reservation: Option<Reservation>,
    /// Services the instance has advertised (route names)
    pub services: Vec<ServiceName>,
}

impl Sequential {
    /// Whether the instance can take a call
    #[must_use]
    pub fn idle(&self) -> bool {
        self.reservation.is_none()
    }
}

/// A remote instance behind an outbound connection
#[derive(Debug)]
pub struct Concurrent {
    /// Address of the connection
    pub process: ProcessHandle,
    /// Priority band of its group
    pub order: InstanceOrder,
    /// Services reachable through it (route names)
    pub services: Vec<ServiceName>,
}

/// Accumulated per-service metrics
#[derive(Debug, Default, Clone, Serialize)]
pub struct ServiceMetric {
    /// Completed invocations
    pub invoked: u64,
    /// Total invocation time in nanoseconds
    pub total_nanos: u128,
    /// Timestamp of the last completed call
    #[serde(skip)]
    pub last: Option<SystemTime>,
    /// Calls dispatched to concurrent instances
    pub remote: u64,
    /// Pending lookups observed for this service
    pub pending: u64,
}

impl ServiceMetric {
    /// Folds one completed-call metric in
    pub fn update(&mut self, metric: &Metric) {
        self.invoked += 1;
        self.total_nanos += metric.duration().as_nanos();
        self.last = Some(metric.end);
    }

    /// Clears the accumulated values
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// One advertised service
#[derive(Debug)]
pub struct Entry {
    /// Properties under the advertised (possibly routed) name
    pub information: Service,
    /// Origin name, preserved for ACK accounting across routes
    pub origin: ServiceName,
    /// Sequential instances in insertion order
    pub sequential: Vec<Pid>,
    /// Concurrent instances, kept sorted by `(hops, order, insertion)`
    pub concurrent: Vec<ConcurrentRef>,
    /// Accumulated metrics
    pub metric: ServiceMetric,
}

/// A concurrent instance reference within a service entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrentRef {
    /// Instance pid
    pub pid: Pid,
    /// Distance through this instance
    pub hops: Hops,
    /// Priority band, denormalized for sorting
    pub order: InstanceOrder,
    /// Insertion sequence, the final tie breaker
    pub sequence: u64,
}

impl Entry {
    fn new(information: Service, origin: ServiceName) -> Self {
        Self {
            information,
            origin,
            sequential: Vec::new(),
            concurrent: Vec::new(),
            metric: ServiceMetric::default(),
        }
    }

    /// Whether the service has any instance left
    #[must_use]
    pub fn has_instances(&self) -> bool {
        !self.sequential.is_empty() || !self.concurrent.is_empty()
    }

    fn partition(&mut self) {
        self.concurrent
            .sort_by_key(|entry| (entry.hops, entry.order, entry.sequence));
    }

    fn remove_instance(&mut self, pid: Pid) {
        self.sequential.retain(|candidate| *candidate != pid);
        self.concurrent.retain(|candidate| candidate.pid != pid);
    }
}

/// A lookup waiting for an instance to become idle
#[derive(Debug)]
pub struct Pending {
    /// Where the (second) reply goes
    pub reply_to: ProcessHandle,
    /// Correlation of the original lookup
    pub correlation: Correlation,
    /// Execution of the original lookup
    pub execution: Execution,
    /// The requested (route) name
    pub requested: ServiceName,
    /// Caller intent
    pub context: LookupContext,
    /// Point after which the caller has given up
    pub deadline: Option<SystemTime>,
    /// A discovery fan-out is outstanding for this entry
    pub discovering: bool,
}

/// Outcome of a lookup against the registry
#[derive(Debug)]
pub enum LookupOutcome {
    /// A sequential instance was reserved, or a concurrent one addressed
    Idle {
        /// The instance to call
        process: ProcessHandle,
        /// Resolved service properties
        service: Service,
    },
    /// Everything busy; the request was queued and a `busy` reply is due
    Busy {
        /// Resolved service properties
        service: Service,
    },
    /// Not known here
    Absent,
}

/// Service manager state
pub struct State {
    /// Advertised services by (route) name
    pub services: HashMap<ServiceName, Entry>,
    /// Sequential instances by pid
    pub sequential: HashMap<Pid, Sequential>,
    /// Concurrent instances by pid
    pub concurrent: HashMap<Pid, Concurrent>,
    /// Pending lookups, FIFO across all services
    pub pending: VecDeque<Pending>,
    /// Origin name to its route aliases
    pub routes: HashMap<ServiceName, Vec<ServiceName>>,
    /// Configured properties by origin name
    pub configured: HashMap<ServiceName, Service>,
    /// Batched metrics awaiting fan-out
    pub metric_batch: Vec<Metric>,
    /// Subscribers to metric events
    pub metric_listeners: Vec<ProcessHandle>,
    /// Insertion counter for concurrent ordering
    concurrent_sequence: u64,
}

impl State {
    /// Builds state from the domain configuration: service properties and
    /// routes are known before anything advertises
    #[must_use]
    pub fn new(services: &[configuration::Service]) -> Self {
        let mut configured = HashMap::new();
        let mut routes: HashMap<ServiceName, Vec<ServiceName>> = HashMap::new();

        for entry in services {
            let information = Service {
                name: entry.name.clone(),
                category: String::new(),
                transaction: crate::message::service::TransactionMode::default(),
                timeout: entry.execution_timeout(),
            };
            configured.insert(entry.name.clone(), information);
            if !entry.routes.is_empty() {
                routes.insert(entry.name.clone(), entry.routes.clone());
            }
        }

        Self {
            services: HashMap::new(),
            sequential: HashMap::new(),
            concurrent: HashMap::new(),
            pending: VecDeque::new(),
            routes,
            configured,
            metric_batch: Vec::new(),
            metric_listeners: Vec::new(),
            concurrent_sequence: 0,
        }
    }

    /// The names a service is advertised under: its routes, or itself
    fn advertised_names(&self, origin: &ServiceName) -> Vec<ServiceName> {
        self.routes
            .get(origin)
            .cloned()
            .unwrap_or_else(|| vec![origin.clone()])
    }

    // -- advertise --------------------------------------------------------

    /// Sequential advertisement
    pub fn advertise(&mut self, message: &Advertise) {
        if message.reset {
            self.remove_process(message.process.pid);
            if message.add.is_empty() && message.remove.is_empty() {
                return;
            }
        }

        let pid = message.process.pid;
        self.sequential.entry(pid).or_insert_with(|| Sequential {
            process: message.process,
            reservation: None,
            services: Vec::new(),
        });

        for service in &message.add {
            for name in self.advertised_names(&service.name) {
                let mut information = self
                    .configured
                    .get(&service.name)
                    .cloned()
                    .unwrap_or_else(|| service.clone());
                information.name = name.clone();
                if information.category != service.category {
                    information.category = service.category.clone();
                }
                if information.transaction != service.transaction {
                    information.transaction = service.transaction;
                }

                let entry = self
                    .services
                    .entry(name.clone())
                    .or_insert_with(|| Entry::new(information.clone(), service.name.clone()));
                entry.information.category = information.category.clone();
                entry.information.transaction = information.transaction;

                if !entry.sequential.contains(&pid) {
                    entry.sequential.push(pid);
                }
                if let Some(instance) = self.sequential.get_mut(&pid) {
                    if !instance.services.contains(&name) {
                        instance.services.push(name);
                    }
                }
            }
        }

        for origin in &message.remove {
            self.unadvertise(pid, origin);
        }
    }

    /// Concurrent advertisement from the gateway
    pub fn advertise_concurrent(&mut self, message: &ConcurrentAdvertise) {
        if message.reset {
            self.remove_process(message.process.pid);
            if message.add.is_empty() && message.remove.is_empty() {
                return;
            }
        }

        let pid = message.process.pid;
        let instance = self.concurrent.entry(pid).or_insert_with(|| Concurrent {
            process: message.process,
            order: message.order,
            services: Vec::new(),
        });
        instance.order = message.order;

        for concurrent_service in &message.add {
            let service = &concurrent_service.service;
            for name in self.advertised_names(&service.name) {
                let mut information = service.clone();
                information.name = name.clone();
                let sequence = self.concurrent_sequence;
                self.concurrent_sequence += 1;

                let entry = self
                    .services
                    .entry(name.clone())
                    .or_insert_with(|| Entry::new(information, service.name.clone()));
                if !entry.concurrent.iter().any(|existing| existing.pid == pid) {
                    entry.concurrent.push(ConcurrentRef {
                        pid,
                        hops: concurrent_service.hops,
                        order: message.order,
                        sequence,
                    });
                    entry.partition();
                }
                if let Some(instance) = self.concurrent.get_mut(&pid) {
                    if !instance.services.contains(&name) {
                        instance.services.push(name);
                    }
                }
            }
        }

        for origin in &message.remove {
            self.unadvertise(pid, origin);
        }
    }

    /// Removes one service (all its route names) from one instance
    fn unadvertise(&mut self, pid: Pid, origin: &ServiceName) {
        for name in self.advertised_names(origin) {
            if let Some(entry) = self.services.get_mut(&name) {
                entry.remove_instance(pid);
                if !entry.has_instances() {
                    self.services.remove(&name);
                }
            }
            if let Some(instance) = self.sequential.get_mut(&pid) {
                instance.services.retain(|advertised| advertised != &name);
            }
            if let Some(instance) = self.concurrent.get_mut(&pid) {
                instance.services.retain(|advertised| advertised != &name);
            }
        }
    }

    /// Takes a pid out of service without forgetting it: every advertised
    /// service is withdrawn but the instance record stays so an in-flight
    /// call can still be acknowledged through it.
    pub fn deactivate(&mut self, pid: Pid) {
        let advertised = self
            .sequential
            .get_mut(&pid)
            .map(|instance| std::mem::take(&mut instance.services))
            .unwrap_or_default();
        for name in advertised {
            if let Some(entry) = self.services.get_mut(&name) {
                entry.remove_instance(pid);
                if !entry.has_instances() {
                    self.services.remove(&name);
                }
            }
        }
        // a concurrent instance has no in-flight accounting to preserve
        if self.concurrent.contains_key(&pid) {
            self.remove_process(pid);
        }
    }

    /// Removes every trace of a pid from the registry.
    ///
    /// Returns the reservation that was outstanding, so the caller can
    /// synthesize a `service_error` reply before the instance is forgotten.
    pub fn remove_process(&mut self, pid: Pid) -> Option<Reservation> {
        let reservation = self
            .sequential
            .remove(&pid)
            .and_then(|instance| instance.reservation);
        self.concurrent.remove(&pid);

        self.services.retain(|_, entry| {
            entry.remove_instance(pid);
            entry.has_instances()
        });
        self.metric_listeners.retain(|handle| handle.pid != pid);

        reservation
    }

    // -- lookup / ack -----------------------------------------------------

    /// Resolves a lookup against the registry.
    ///
    /// `forward` is the forward-cache handle for `no_reply` fallback. When
    /// the outcome is [`LookupOutcome::Busy`] the request has been queued.
    pub fn lookup(
        &mut self,
        requested: &ServiceName,
        context: LookupContext,
        reply_to: ProcessHandle,
        correlation: Correlation,
        execution: Execution,
        deadline: Option<SystemTime>,
        forward: Option<ProcessHandle>,
    ) -> LookupOutcome {
        let Some(entry) = self.services.get_mut(requested) else {
            return LookupOutcome::Absent;
        };
        let service = entry.information.clone();

        // idle sequential instance, in stable insertion order
        let idle = entry
            .sequential
            .iter()
            .copied()
            .find(|pid| self.sequential.get(pid).is_some_and(Sequential::idle));
        if let Some(pid) = idle {
            let (deadline, contract) = service
                .timeout
                .map(|timeout| (Some(Instant::now() + timeout.duration), timeout.contract))
                .unwrap_or((None, TimeoutContract::default()));

            let Some(instance) = self.sequential.get_mut(&pid) else {
                unreachable!("idle pid found above");
            };
            instance.reservation = Some(Reservation {
                service: requested.clone(),
                caller: reply_to,
                correlation,
                execution,
                started: Instant::now(),
                deadline,
                contract,
                timed_out: false,
            });
            return LookupOutcome::Idle {
                process: instance.process,
                service,
            };
        }

        // concurrent fallback: only when no sequential instance exists at all
        if entry.sequential.is_empty() && !entry.concurrent.is_empty() {
            entry.metric.remote += 1;
            let first = entry.concurrent[0];
            if let Some(instance) = self.concurrent.get(&first.pid) {
                return LookupOutcome::Idle {
                    process: instance.process,
                    service,
                };
            }
            error!(pid = %first.pid, "concurrent reference without instance - inconsistency");
        }

        // fire-and-forget resolves to the forward cache
        if context == LookupContext::NoReply {
            if let Some(forward) = forward {
                return LookupOutcome::Idle {
                    process: forward,
                    service,
                };
            }
        }

        entry.metric.pending += 1;
        self.pending.push_back(Pending {
            reply_to,
            correlation,
            execution,
            requested: requested.clone(),
            context,
            deadline,
            discovering: false,
        });
        LookupOutcome::Busy { service }
    }

    /// Acknowledgement: unreserve and account.
    ///
    /// Returns the completed reservation, or `None` for an unknown instance
    /// (logged and discarded, a consistency warning).
    pub fn acknowledge(&mut self, pid: Pid, metric: &Metric) -> Option<Reservation> {
        let Some(instance) = self.sequential.get_mut(&pid) else {
            error!(%pid, "ACK from unknown instance - indicates inconsistency - action: discard");
            return None;
        };
        let Some(reservation) = instance.reservation.take() else {
            warn!(%pid, "ACK from idle instance - action: discard");
            return None;
        };

        if let Some(entry) = self.services.get_mut(&reservation.service) {
            entry.metric.update(metric);
        }
        self.metric_batch.push(metric.clone());
        Some(reservation)
    }

    /// Serves the oldest pending lookup the now-idle instance can take.
    ///
    /// Returns the served entry and the reserved handle; the caller sends
    /// the second lookup reply. At most one entry is served per call since
    /// the reservation makes the instance busy again.
    pub fn next_pending(&mut self, pid: Pid) -> Option<(Pending, ProcessHandle, Service)> {
        let services = self.sequential.get(&pid).map(|instance| {
            (
                instance.idle(),
                instance.services.clone(),
            )
        });
        let (idle, advertised) = services?;
        if !idle {
            return None;
        }

        let position = self
            .pending
            .iter()
            .position(|pending| advertised.contains(&pending.requested))?;
        let pending = self
            .pending
            .remove(position)
            .unwrap_or_else(|| unreachable!("position found above"));

        let entry = self.services.get(&pending.requested)?;
        let service = entry.information.clone();
        let (deadline, contract) = service
            .timeout
            .map(|timeout| (Some(Instant::now() + timeout.duration), timeout.contract))
            .unwrap_or((None, TimeoutContract::default()));

        let instance = self.sequential.get_mut(&pid)?;
        instance.reservation = Some(Reservation {
            service: pending.requested.clone(),
            caller: pending.reply_to,
            correlation: pending.correlation,
            execution: pending.execution,
            started: Instant::now(),
            deadline,
            contract,
            timed_out: false,
        });
        Some((pending, instance.process, service))
    }

    /// Drops a pending lookup by correlation; `true` when found
    pub fn discard_pending(&mut self, correlation: Correlation) -> bool {
        let before = self.pending.len();
        self.pending
            .retain(|pending| pending.correlation != correlation);
        before != self.pending.len()
    }

    /// Pending entries whose service can no longer be served by anyone;
    /// removed and returned so the manager can answer `absent`
    pub fn orphaned_pending(&mut self) -> Vec<Pending> {
        let services = &self.services;
        let mut orphaned = Vec::new();
        self.pending.retain(|pending| {
            if services.contains_key(&pending.requested) || pending.discovering {
                true
            } else {
                orphaned.push(Pending {
                    reply_to: pending.reply_to,
                    correlation: pending.correlation,
                    execution: pending.execution,
                    requested: pending.requested.clone(),
                    context: pending.context,
                    deadline: pending.deadline,
                    discovering: pending.discovering,
                });
                false
            }
        });
        orphaned
    }

    /// The earliest execution-timeout deadline over all reservations
    #[must_use]
    pub fn earliest_deadline(&self) -> Option<Instant> {
        self.sequential
            .values()
            .filter_map(|instance| instance.reservation.as_ref())
            .filter(|reservation| !reservation.timed_out)
            .filter_map(|reservation| reservation.deadline)
            .min()
    }

    /// Reservations whose deadline has passed; marks them timed out
    pub fn expired_reservations(&mut self, now: Instant) -> Vec<(Pid, Reservation)> {
        let mut expired = Vec::new();
        for (pid, instance) in &mut self.sequential {
            if let Some(reservation) = &mut instance.reservation {
                if !reservation.timed_out
                    && reservation.deadline.is_some_and(|deadline| deadline <= now)
                {
                    reservation.timed_out = true;
                    expired.push((*pid, reservation.clone()));
                }
            }
        }
        expired
    }

    /// Resets metrics; empty input means all. Returns the names reset.
    pub fn metric_reset(&mut self, names: &[ServiceName]) -> Vec<ServiceName> {
        let mut reset = Vec::new();
        if names.is_empty() {
            for (name, entry) in &mut self.services {
                entry.metric.reset();
                reset.push(name.clone());
            }
        } else {
            for name in names {
                if let Some(entry) = self.services.get_mut(name) {
                    entry.metric.reset();
                    reset.push(name.clone());
                }
            }
        }
        reset
    }
}

/// Serializable registry snapshot for the admin surface
#[derive(Debug, Serialize)]
pub struct Snapshot {
    /// Advertised services
    pub services: Vec<ServiceSnapshot>,
    /// Pending lookups
    pub pending: usize,
}

/// Service part of the snapshot
#[derive(Debug, Serialize)]
pub struct ServiceSnapshot {
    /// Advertised name
    pub name: String,
    /// Operator category
    pub category: String,
    /// Sequential instances as `(pid, busy)`
    pub sequential: Vec<(u64, bool)>,
    /// Concurrent instances as `(pid, hops)`
    pub concurrent: Vec<(u64, u64)>,
    /// Accumulated metrics
    pub metric: ServiceMetric,
}

impl State {
    /// Takes an admin snapshot
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        let mut services: Vec<ServiceSnapshot> = self
            .services
            .iter()
            .map(|(name, entry)| ServiceSnapshot {
                name: name.to_string(),
                category: entry.information.category.clone(),
                sequential: entry
                    .sequential
                    .iter()
                    .map(|pid| {
                        (
                            u64::from(*pid),
                            self.sequential
                                .get(pid)
                                .is_some_and(|instance| !instance.idle()),
                        )
                    })
                    .collect(),
                concurrent: entry
                    .concurrent
                    .iter()
                    .map(|reference| (u64::from(reference.pid), u64::from(reference.hops)))
                    .collect(),
                metric: entry.metric.clone(),
            })
            .collect();
        services.sort_by(|a, b| a.name.cmp(&b.name));
        Snapshot {
            services,
            pending: self.pending.len(),
        }
    }
}

/// Reply code synthesized when a reserved instance dies mid-call
#[must_use]
pub fn death_reply_code() -> ErrorKind {
    ErrorKind::ServiceError
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain_types::IpcId;
    use crate::message::service::ConcurrentService;

    fn handle(pid: u64) -> ProcessHandle {
        ProcessHandle::new(Pid::new(pid), IpcId::generate())
    }

    fn name(value: &str) -> ServiceName {
        ServiceName::try_new(value).expect("valid name")
    }

    fn advertise(state: &mut State, pid: u64, services: &[&str]) {
        state.advertise(&Advertise {
            process: handle(pid),
            add: services
                .iter()
                .map(|service| Service::named(name(service)))
                .collect(),
            remove: Vec::new(),
            reset: false,
        });
    }

    fn lookup(state: &mut State, service: &str, caller: u64) -> LookupOutcome {
        state.lookup(
            &name(service),
            LookupContext::Regular,
            handle(caller),
            Correlation::generate(),
            Execution::generate(),
            None,
            None,
        )
    }

    fn metric_for(service: &str) -> Metric {
        let now = SystemTime::now();
        Metric {
            service: name(service),
            start: now,
            end: now,
            code: None,
        }
    }

    #[test]
    fn advertise_then_lookup_reserves() {
        let mut state = State::new(&[]);
        advertise(&mut state, 1, &["echo"]);

        match lookup(&mut state, "echo", 9) {
            LookupOutcome::Idle { process, .. } => assert_eq!(process.pid, Pid::new(1)),
            other => panic!("expected Idle, got {other:?}"),
        }
        // the instance is now busy; a second lookup queues
        match lookup(&mut state, "echo", 10) {
            LookupOutcome::Busy { .. } => {}
            other => panic!("expected Busy, got {other:?}"),
        }
        assert_eq!(state.pending.len(), 1);
    }

    #[test]
    fn unknown_service_is_absent() {
        let mut state = State::new(&[]);
        assert!(matches!(lookup(&mut state, "nope", 9), LookupOutcome::Absent));
    }

    #[test]
    fn advertise_then_unadvertise_is_a_noop_on_the_registry() {
        let mut state = State::new(&[]);
        advertise(&mut state, 1, &["echo"]);
        state.advertise(&Advertise {
            process: handle(1),
            add: Vec::new(),
            remove: vec![name("echo")],
            reset: false,
        });
        assert!(state.services.is_empty());
    }

    #[test]
    fn removal_by_pid_equals_removal_by_list() {
        let mut by_list = State::new(&[]);
        advertise(&mut by_list, 1, &["echo", "other"]);
        by_list.advertise(&Advertise {
            process: handle(1),
            add: Vec::new(),
            remove: vec![name("echo"), name("other")],
            reset: false,
        });

        let mut by_pid = State::new(&[]);
        advertise(&mut by_pid, 1, &["echo", "other"]);
        by_pid.remove_process(Pid::new(1));

        assert!(by_list.services.is_empty());
        assert!(by_pid.services.is_empty());
        assert!(by_pid.sequential.is_empty());
    }

    #[test]
    fn ack_drains_pending_fifo() {
        let mut state = State::new(&[]);
        advertise(&mut state, 1, &["echo"]);

        // reserve the only instance
        assert!(matches!(
            lookup(&mut state, "echo", 8),
            LookupOutcome::Idle { .. }
        ));
        // three more lookups queue in order
        let callers = [9u64, 10, 11];
        for caller in callers {
            assert!(matches!(
                lookup(&mut state, "echo", caller),
                LookupOutcome::Busy { .. }
            ));
        }

        // ACK: the oldest pending gets the instance
        assert!(state.acknowledge(Pid::new(1), &metric_for("echo")).is_some());
        let (served, process, _) = state.next_pending(Pid::new(1)).expect("oldest served");
        assert_eq!(served.reply_to.pid, Pid::new(9));
        assert_eq!(process.pid, Pid::new(1));

        // instance busy again; nothing more drains
        assert!(state.next_pending(Pid::new(1)).is_none());
        assert_eq!(state.pending.len(), 2);

        // the remaining two drain in order on further ACKs
        assert!(state.acknowledge(Pid::new(1), &metric_for("echo")).is_some());
        let (served, _, _) = state.next_pending(Pid::new(1)).expect("second served");
        assert_eq!(served.reply_to.pid, Pid::new(10));

        assert!(state.acknowledge(Pid::new(1), &metric_for("echo")).is_some());
        let (served, _, _) = state.next_pending(Pid::new(1)).expect("third served");
        assert_eq!(served.reply_to.pid, Pid::new(11));
    }

    #[test]
    fn busy_instance_death_returns_reservation() {
        let mut state = State::new(&[]);
        advertise(&mut state, 1, &["echo"]);
        assert!(matches!(
            lookup(&mut state, "echo", 9),
            LookupOutcome::Idle { .. }
        ));

        let reservation = state.remove_process(Pid::new(1)).expect("was busy");
        assert_eq!(reservation.caller.pid, Pid::new(9));
        assert!(state.services.is_empty());
    }

    #[test]
    fn orphaned_pending_surfaces_after_removal() {
        let mut state = State::new(&[]);
        advertise(&mut state, 1, &["echo"]);
        assert!(matches!(
            lookup(&mut state, "echo", 9),
            LookupOutcome::Idle { .. }
        ));
        assert!(matches!(
            lookup(&mut state, "echo", 10),
            LookupOutcome::Busy { .. }
        ));

        state.remove_process(Pid::new(1));
        let orphaned = state.orphaned_pending();
        assert_eq!(orphaned.len(), 1);
        assert_eq!(orphaned[0].reply_to.pid, Pid::new(10));
        assert!(state.pending.is_empty());
    }

    #[test]
    fn concurrent_ordering_prefers_low_hops_then_order() {
        let mut state = State::new(&[]);
        let advertise_concurrent = |state: &mut State, pid: u64, order: u64, hops: u64| {
            state.advertise_concurrent(&ConcurrentAdvertise {
                process: handle(pid),
                order: InstanceOrder::new(order),
                add: vec![ConcurrentService {
                    service: Service::named(name("remote")),
                    hops: Hops::new(hops),
                }],
                remove: Vec::new(),
                reset: false,
            });
        };

        advertise_concurrent(&mut state, 21, 1, 2);
        advertise_concurrent(&mut state, 22, 0, 2);
        advertise_concurrent(&mut state, 23, 1, 1);

        match lookup(&mut state, "remote", 9) {
            LookupOutcome::Idle { process, .. } => {
                // lowest hops wins despite higher order
                assert_eq!(process.pid, Pid::new(23));
            }
            other => panic!("expected Idle, got {other:?}"),
        }
    }

    #[test]
    fn sequential_presence_shadows_concurrent() {
        let mut state = State::new(&[]);
        advertise(&mut state, 1, &["echo"]);
        state.advertise_concurrent(&ConcurrentAdvertise {
            process: handle(30),
            order: InstanceOrder::default(),
            add: vec![ConcurrentService {
                service: Service::named(name("echo")),
                hops: Hops::new(1),
            }],
            remove: Vec::new(),
            reset: false,
        });

        // sequential reserved first
        assert!(matches!(
            lookup(&mut state, "echo", 9),
            LookupOutcome::Idle { process, .. } if process.pid == Pid::new(1)
        ));
        // sequential busy and a sequential list exists: queue, do not go remote
        assert!(matches!(
            lookup(&mut state, "echo", 10),
            LookupOutcome::Busy { .. }
        ));
    }

    #[test]
    fn route_expansion_preserves_origin() {
        let mut state = State::new(&[configuration::Service {
            name: name("origin/service"),
            timeout_ms: None,
            contract: configuration::Contract::Linger,
            routes: vec![name("alias/one"), name("alias/two")],
        }]);
        advertise(&mut state, 1, &["origin/service"]);

        assert!(state.services.contains_key(&name("alias/one")));
        assert!(state.services.contains_key(&name("alias/two")));
        assert!(!state.services.contains_key(&name("origin/service")));
        assert_eq!(
            state.services[&name("alias/one")].origin,
            name("origin/service")
        );
    }

    #[test]
    fn discard_pending_by_correlation() {
        let mut state = State::new(&[]);
        advertise(&mut state, 1, &["echo"]);
        assert!(matches!(
            lookup(&mut state, "echo", 9),
            LookupOutcome::Idle { .. }
        ));

        let correlation = Correlation::generate();
        state.lookup(
            &name("echo"),
            LookupContext::Regular,
            handle(10),
            correlation,
            Execution::generate(),
            None,
            None,
        );
        assert!(state.discard_pending(correlation));
        assert!(!state.discard_pending(correlation));
    }

    #[test]
    fn busy_count_matches_reservations() {
        // invariant: busy sequential instances == outstanding reservations
        let mut state = State::new(&[]);
        advertise(&mut state, 1, &["a"]);
        advertise(&mut state, 2, &["a"]);
        advertise(&mut state, 3, &["b"]);

        let _ = lookup(&mut state, "a", 9);
        let _ = lookup(&mut state, "b", 10);

        let busy = state
            .sequential
            .values()
            .filter(|instance| !instance.idle())
            .count();
        let reservations = state
            .sequential
            .values()
            .filter_map(|instance| instance.reservation.as_ref())
            .count();
        assert_eq!(busy, 2);
        assert_eq!(busy, reservations);
    }
}
