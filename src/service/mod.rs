//! Service manager
//!
//! Request dispatcher of a domain: keeps the advertised-service registry,
//! reserves sequential instances for calls, queues pending lookups when
//! everything is busy, accounts call metrics, and polices execution
//! timeouts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, instrument, warn};

use crate::configuration;
use crate::domain_types::{Correlation, IpcId, Pid, ServiceName};
use crate::error::{ErrorKind, Result};
use crate::message::domain::{
    ConnectDirective, ProcessConnectRequest, ProcessPrepareShutdownReply,
    ProcessPrepareShutdownRequest,
};
use crate::message::event;
use crate::message::gateway::{DiscoverRequest, Identity};
use crate::message::service::{
    Ack, Advertise, Call, ConcurrentAdvertise, DiscardState, LookupDiscardReply,
    LookupDiscardRequest, LookupReply, LookupRequest, LookupState, Metric, Reply, Service,
    TimeoutContract,
};
use crate::message::{Envelope, Message, MessageType};
use crate::process::{ProcessHandle, environment, identity};
use crate::transport::bus::{Bus, Inbound};
use crate::transport::pending;

pub mod state;

use crate::domain::Environment;
use crate::domain::environment::domain_identity;
use crate::domain::spawn::InstanceContext;
use state::{LookupOutcome, Pending, State};

/// Admin service: registry snapshot
pub const ADMIN_STATE: &str = ".casual/service/state";
/// Admin service: reset metrics
pub const ADMIN_METRIC_RESET: &str = ".casual/service/metric/reset";

/// Runs the service manager as a domain instance
///
/// # Errors
///
/// Fails only on construction problems; protocol-level trouble is handled
/// in the loop.
pub async fn run(context: InstanceContext) -> Result<()> {
    let inbound = context.bus.register(IpcId::generate());
    let handle = ProcessHandle::new(context.pid, inbound.ipc());

    let mut manager = Manager {
        handle,
        bus: Arc::clone(&context.bus),
        environment: Arc::clone(&context.environment),
        inbound,
        domain: None,
        state: State::new(&[]),
        pending_sends: pending::Holder::new(),
        discoveries: HashMap::new(),
    };

    // the domain configuration travels through the environment-published
    // configuration slot; service properties and routes come from there
    if let Some(services) = context.environment.get(CONFIGURED_SERVICES) {
        if let Ok(parsed) = serde_json::from_str::<Vec<configuration::Service>>(&services) {
            manager.state = State::new(&parsed);
        }
    }

    if !manager.connect(&context).await {
        return Ok(());
    }
    manager.advertise_own_admin_services();
    manager.run().await;
    Ok(())
}

/// Environment slot carrying configured service properties as JSON
pub const CONFIGURED_SERVICES: &str = "CASUAL_SERVICE_CONFIGURATION";

struct Manager {
    handle: ProcessHandle,
    bus: Arc<Bus>,
    environment: Arc<Environment>,
    inbound: Inbound,
    domain: Option<ProcessHandle>,
    state: State,
    pending_sends: pending::Holder,
    /// discovery correlation to the parked lookup correlation
    discoveries: HashMap<Correlation, Correlation>,
}

impl Manager {
    /// Registers with the domain manager; `false` means exit (singleton or
    /// domain shutdown)
    async fn connect(&mut self, context: &InstanceContext) -> bool {
        let request = Envelope::new(Message::DomainProcessConnectRequest(ProcessConnectRequest {
            process: self.handle,
            identity: Some(identity::SERVICE_MANAGER),
            path: context.alias.to_string(),
        }));
        self.send(context.domain_manager, &request);

        let directive = loop {
            match self.inbound.next().await {
                Some(envelope) => {
                    if let Message::DomainProcessConnectReply(reply) = envelope.message {
                        break reply.directive;
                    }
                }
                None => return false,
            }
        };
        match directive {
            ConnectDirective::Start => {}
            ConnectDirective::Singleton | ConnectDirective::Shutdown => {
                info!(directive = ?directive, "connect refused - action: exit");
                return false;
            }
        }

        self.domain = self
            .environment
            .handle(environment::DOMAIN_MANAGER)
            .map(|handle| {
                // the context device is authoritative; the published handle
                // carries the pid
                ProcessHandle::new(handle.pid, context.domain_manager)
            });

        let subscribe = Envelope::new(Message::EventSubscriptionBegin(event::SubscriptionBegin {
            process: self.handle,
            types: vec![MessageType::EventProcessExit],
        }));
        self.send(context.domain_manager, &subscribe);
        true
    }

    fn advertise_own_admin_services(&mut self) {
        let services: Vec<Service> = [ADMIN_STATE, ADMIN_METRIC_RESET]
            .iter()
            .filter_map(|name| ServiceName::try_new(*name).ok())
            .map(|name| Service {
                name,
                category: "admin".into(),
                transaction: crate::message::service::TransactionMode::None,
                timeout: None,
            })
            .collect();
        self.state.advertise(&Advertise {
            process: self.handle,
            add: services,
            remove: Vec::new(),
            reset: false,
        });
    }

    async fn run(mut self) {
        info!("service manager start");
        loop {
            let deadline = self.state.earliest_deadline();
            let envelope = tokio::select! {
                envelope = self.inbound.next() => envelope,
                () = sleep_until_or_forever(deadline) => {
                    self.handle_timeout();
                    continue;
                }
            };
            let Some(envelope) = envelope else { break };

            if !self.dispatch(envelope) {
                break;
            }

            self.flush_metrics();
            self.pending_sends.flush(&self.bus);
        }
        self.bus.remove(self.handle.ipc);
        info!("service manager off-line");
    }

    fn dispatch(&mut self, envelope: Envelope) -> bool {
        match envelope.message.clone() {
            Message::ServiceAdvertise(advertise) => self.advertise(&advertise),
            Message::ServiceConcurrentAdvertise(advertise) => {
                self.advertise_concurrent(&advertise);
            }
            Message::ServiceLookupRequest(request) => self.lookup(&envelope, &request),
            Message::ServiceLookupDiscardRequest(request) => self.discard(&envelope, &request),
            Message::ServiceAck(ack) => self.acknowledge(&ack),
            Message::DomainProcessPrepareShutdownRequest(request) => {
                self.prepare_shutdown(&envelope, request);
            }
            Message::EventProcessExit(exit) => self.process_exit(exit.exit.pid),
            Message::EventSubscriptionBegin(begin) => {
                if begin.types.is_empty() || begin.types.contains(&MessageType::EventServiceCalls)
                {
                    self.state
                        .metric_listeners
                        .retain(|listener| listener.pid != begin.process.pid);
                    self.state.metric_listeners.push(begin.process);
                }
            }
            Message::EventSubscriptionEnd(end) => {
                self.state
                    .metric_listeners
                    .retain(|listener| listener.pid != end.process.pid);
            }
            Message::GatewayDomainDiscoverAccumulatedReply(accumulated) => {
                self.discovery_reply(envelope.correlation, &accumulated);
            }
            Message::GatewayDomainDiscoverRequest(request) => {
                self.answer_discovery(&envelope, &request);
            }
            Message::ServiceCall(call) => self.admin_call(&envelope, &call),
            Message::ShutdownRequest { .. } => return false,
            Message::SignalTimeout => self.handle_timeout(),
            Message::Poke | Message::DomainProcessConnectReply(_) => {}
            other => {
                debug!(message_type = %other.message_type(), "unhandled message - action: discard");
            }
        }
        true
    }

    // -- advertise --------------------------------------------------------

    #[instrument(skip_all, fields(pid = %advertise.process.pid))]
    fn advertise(&mut self, advertise: &Advertise) {
        self.state.advertise(advertise);
        self.drain_pending_for(advertise.process.pid);
    }

    fn advertise_concurrent(&mut self, advertise: &ConcurrentAdvertise) {
        self.state.advertise_concurrent(advertise);
        self.drain_pending_concurrent();
    }

    /// A fresh or newly idle sequential instance serves the oldest waiting
    /// lookup it can take; the reservation makes it busy again
    fn drain_pending_for(&mut self, pid: Pid) {
        if let Some((pending, process, service)) = self.state.next_pending(pid) {
            let reply = Envelope {
                correlation: pending.correlation,
                execution: pending.execution,
                message: Message::ServiceLookupReply(LookupReply {
                    service,
                    state: LookupState::Idle,
                    process: Some(process),
                }),
            };
            self.send(pending.reply_to.ipc, &reply);
        }
    }

    /// Concurrent instances can serve pending lookups for services with no
    /// sequential instance at all
    fn drain_pending_concurrent(&mut self) {
        let mut served = Vec::new();
        let pending: Vec<Correlation> = self
            .state
            .pending
            .iter()
            .map(|pending| pending.correlation)
            .collect();

        for correlation in pending {
            let Some(position) = self
                .state
                .pending
                .iter()
                .position(|entry| entry.correlation == correlation)
            else {
                continue;
            };
            let requested = self.state.pending[position].requested.clone();
            let resolvable = self
                .state
                .services
                .get(&requested)
                .is_some_and(|entry| entry.sequential.is_empty() && !entry.concurrent.is_empty());
            if !resolvable {
                continue;
            }
            if let Some(entry) = self.state.pending.remove(position) {
                served.push(entry);
            }
        }

        for pending in served {
            self.resolve_pending(pending);
        }
    }

    /// Re-runs a pending lookup against the registry and replies
    fn resolve_pending(&mut self, pending: Pending) {
        let outcome = self.state.lookup(
            &pending.requested.clone(),
            pending.context,
            pending.reply_to,
            pending.correlation,
            pending.execution,
            pending.deadline,
            self.forward_cache(),
        );
        let message = match outcome {
            LookupOutcome::Idle { process, service } => Message::ServiceLookupReply(LookupReply {
                service,
                state: LookupState::Idle,
                process: Some(process),
            }),
            // queued again; the earlier busy reply already told the caller
            LookupOutcome::Busy { .. } => return,
            LookupOutcome::Absent => Message::ServiceLookupReply(LookupReply {
                service: Service::named(pending.requested.clone()),
                state: LookupState::Absent,
                process: None,
            }),
        };
        let reply = Envelope {
            correlation: pending.correlation,
            execution: pending.execution,
            message,
        };
        self.send(pending.reply_to.ipc, &reply);
    }

    // -- lookup -----------------------------------------------------------

    #[instrument(skip_all, fields(requested = %request.requested, caller = %request.process.pid))]
    fn lookup(&mut self, envelope: &Envelope, request: &LookupRequest) {
        let outcome = self.state.lookup(
            &request.requested,
            request.context,
            request.process,
            envelope.correlation,
            envelope.execution,
            request.deadline,
            self.forward_cache(),
        );

        let message = match outcome {
            LookupOutcome::Idle { process, service } => Message::ServiceLookupReply(LookupReply {
                service,
                state: LookupState::Idle,
                process: Some(process),
            }),
            LookupOutcome::Busy { service } => Message::ServiceLookupReply(LookupReply {
                service,
                state: LookupState::Busy,
                process: None,
            }),
            LookupOutcome::Absent => {
                if self.start_discovery(envelope, request) {
                    // a busy reply arms the caller's timeout; the second
                    // reply follows the discovery outcome
                    Message::ServiceLookupReply(LookupReply {
                        service: Service::named(request.requested.clone()),
                        state: LookupState::Busy,
                        process: None,
                    })
                } else {
                    Message::ServiceLookupReply(LookupReply {
                        service: Service::named(request.requested.clone()),
                        state: LookupState::Absent,
                        process: None,
                    })
                }
            }
        };
        let reply = envelope.reverse(message);
        self.send(request.process.ipc, &reply);
    }

    /// Unknown service: fan out discovery through the gateway, when present
    fn start_discovery(&mut self, envelope: &Envelope, request: &LookupRequest) -> bool {
        if request.context == crate::message::service::LookupContext::Forward {
            return false;
        }
        let Some(gateway) = self.environment.handle(environment::GATEWAY_MANAGER) else {
            return false;
        };

        let discover = Envelope::new(Message::GatewayDomainDiscoverRequest(DiscoverRequest {
            process: Some(self.handle),
            domain: self.domain_identity(),
            services: vec![request.requested.clone()],
            queues: Vec::new(),
        }));
        self.discoveries
            .insert(discover.correlation, envelope.correlation);

        self.state.pending.push_back(Pending {
            reply_to: request.process,
            correlation: envelope.correlation,
            execution: envelope.execution,
            requested: request.requested.clone(),
            context: request.context,
            deadline: request.deadline,
            discovering: true,
        });
        self.send(gateway.ipc, &discover);
        true
    }

    /// The gateway finished a discovery fan-out we started
    fn discovery_reply(
        &mut self,
        correlation: Correlation,
        accumulated: &crate::message::gateway::DiscoverAccumulatedReply,
    ) {
        let Some(lookup_correlation) = self.discoveries.remove(&correlation) else {
            debug!("no pending was found for discovery reply");
            return;
        };
        let Some(position) = self
            .state
            .pending
            .iter()
            .position(|pending| pending.correlation == lookup_correlation)
        else {
            return;
        };

        let requested = self.state.pending[position].requested.clone();
        let claimed = accumulated.replies.iter().any(|reply| {
            reply
                .services
                .iter()
                .any(|discovered| discovered.service.name == requested)
        });
        let resolvable = self.state.services.contains_key(&requested);

        if claimed && !resolvable {
            // a peer claims the service; its advertisement is still in
            // flight and will drain this entry when it lands
            if let Some(pending) = self.state.pending.get_mut(position) {
                pending.discovering = false;
            }
            return;
        }

        let Some(mut pending) = self.state.pending.remove(position) else {
            return;
        };
        pending.discovering = false;
        self.resolve_pending(pending);
    }

    /// A remote domain (through the inbound gateway) asks which of the
    /// named services this domain hosts
    fn answer_discovery(&mut self, envelope: &Envelope, request: &DiscoverRequest) {
        let Some(reply_to) = request.process else {
            debug!("discovery request without reply address - action: discard");
            return;
        };

        let services = request
            .services
            .iter()
            .filter_map(|name| {
                self.state.services.get(name).map(|entry| {
                    let hops = if entry.sequential.is_empty() {
                        entry
                            .concurrent
                            .first()
                            .map(|reference| reference.hops)
                            .unwrap_or_default()
                    } else {
                        crate::domain_types::Hops::default()
                    };
                    crate::message::gateway::DiscoveredService {
                        service: entry.information.clone(),
                        hops,
                    }
                })
            })
            .collect();

        let reply = envelope.reverse(Message::GatewayDomainDiscoverReply(
            crate::message::gateway::DiscoverReply {
                domain: self.domain_identity(),
                services,
                queues: Vec::new(),
            },
        ));
        self.send(reply_to.ipc, &reply);
    }

    // -- discard ----------------------------------------------------------

    fn discard(&mut self, envelope: &Envelope, request: &LookupDiscardRequest) {
        let state = if self.state.discard_pending(request.correlation) {
            self.discoveries
                .retain(|_, lookup| *lookup != request.correlation);
            DiscardState::Discarded
        } else {
            DiscardState::Replied
        };
        let reply = envelope.reverse(Message::ServiceLookupDiscardReply(LookupDiscardReply {
            state,
        }));
        self.send(request.process.ipc, &reply);
    }

    // -- acknowledge ------------------------------------------------------

    #[instrument(skip_all, fields(pid = %ack.process.pid, service = %ack.metric.service))]
    fn acknowledge(&mut self, ack: &Ack) {
        if self.state.acknowledge(ack.process.pid, &ack.metric).is_some() {
            self.drain_pending_for(ack.process.pid);
        }
    }

    // -- prepare shutdown --------------------------------------------------

    fn prepare_shutdown(&mut self, envelope: &Envelope, request: ProcessPrepareShutdownRequest) {
        for process in &request.processes {
            self.state.deactivate(process.pid);
        }
        self.answer_orphaned_pending();

        let reply = envelope.reverse(Message::DomainProcessPrepareShutdownReply(
            ProcessPrepareShutdownReply {
                processes: request.processes,
            },
        ));
        self.send(request.process.ipc, &reply);
    }

    // -- process exit -----------------------------------------------------

    #[instrument(skip(self))]
    fn process_exit(&mut self, pid: Pid) {
        // a dead caller cannot receive its pending replies
        self.state
            .pending
            .retain(|pending| pending.reply_to.pid != pid);

        if let Some(reservation) = self.state.remove_process(pid) {
            if !reservation.timed_out {
                warn!(caller = %reservation.caller.pid,
                    "reserved instance exited mid-call - action: synthesize reply");
                let reply = Envelope {
                    correlation: reservation.correlation,
                    execution: reservation.execution,
                    message: Message::ServiceReply(Reply::error(state::death_reply_code())),
                };
                self.send(reservation.caller.ipc, &reply);
            }
        }
        self.answer_orphaned_pending();
    }

    fn answer_orphaned_pending(&mut self) {
        for pending in self.state.orphaned_pending() {
            let reply = Envelope {
                correlation: pending.correlation,
                execution: pending.execution,
                message: Message::ServiceLookupReply(LookupReply {
                    service: Service::named(pending.requested.clone()),
                    state: LookupState::Absent,
                    process: None,
                }),
            };
            self.send(pending.reply_to.ipc, &reply);
        }
    }

    // -- execution timeout -------------------------------------------------

    fn handle_timeout(&mut self) {
        let expired = self.state.expired_reservations(Instant::now());
        for (pid, reservation) in expired {
            warn!(%pid, service = %reservation.service, contract = ?reservation.contract,
                "execution timeout - action: notify caller");

            let reply = Envelope {
                correlation: reservation.correlation,
                execution: reservation.execution,
                message: Message::ServiceReply(Reply::error(ErrorKind::Timeout)),
            };
            self.send(reservation.caller.ipc, &reply);

            if let Some(domain) = self.domain {
                let assassination =
                    Envelope::new(Message::EventAssassination(event::Assassination {
                        target: pid,
                        contract: reservation.contract,
                    }));
                self.send(domain.ipc, &assassination);
            }

            if reservation.contract == TimeoutContract::Kill {
                // the domain terminates the instance; its exit removes the
                // registry record without a second caller reply
            }
        }
    }

    // -- admin services ---------------------------------------------------

    fn admin_call(&mut self, envelope: &Envelope, call: &Call) {
        let name = call.service.to_string();
        let reply = match name.as_str() {
            ADMIN_STATE => Reply {
                code: None,
                trid: None,
                payload: serde_json::to_vec(&self.state.snapshot()).unwrap_or_default(),
            },
            ADMIN_METRIC_RESET => {
                let names: Vec<ServiceName> = serde_json::from_slice::<Vec<String>>(&call.payload)
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|name| ServiceName::try_new(name).ok())
                    .collect();
                let reset = self.state.metric_reset(&names);
                Reply {
                    code: None,
                    trid: None,
                    payload: serde_json::to_vec(
                        &reset.iter().map(ToString::to_string).collect::<Vec<_>>(),
                    )
                    .unwrap_or_default(),
                }
            }
            _ => Reply::error(ErrorKind::NoEntry),
        };

        if !call.no_reply {
            let response = envelope.reverse(Message::ServiceReply(reply));
            self.send(call.process.ipc, &response);
        }

        // self-acknowledge so the reservation invariant holds
        let now = std::time::SystemTime::now();
        let metric = Metric {
            service: call.service.clone(),
            start: now,
            end: now,
            code: None,
        };
        if self.state.acknowledge(self.handle.pid, &metric).is_some() {
            self.drain_pending_for(self.handle.pid);
        }
    }

    // -- metric fan-out ----------------------------------------------------

    fn flush_metrics(&mut self) {
        if self.state.metric_batch.is_empty() || self.state.metric_listeners.is_empty() {
            self.state.metric_batch.clear();
            return;
        }
        let metrics = std::mem::take(&mut self.state.metric_batch);
        let listeners = self.state.metric_listeners.clone();
        for listener in listeners {
            let envelope = Envelope::new(Message::EventServiceCalls(event::ServiceCalls {
                metrics: metrics.clone(),
            }));
            self.send(listener.ipc, &envelope);
        }
    }

    // -- plumbing ---------------------------------------------------------

    fn forward_cache(&self) -> Option<ProcessHandle> {
        self.environment.handle(environment::FORWARD_CACHE)
    }

    fn domain_identity(&self) -> Identity {
        domain_identity(&self.environment)
    }

    fn send(&mut self, to: IpcId, envelope: &Envelope) {
        if let Err(error) = self.pending_sends.send(&self.bus, to, envelope) {
            warn!(%error, %to, "failed to send message - action: drop");
        }
    }
}

async fn sleep_until_or_forever(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}
