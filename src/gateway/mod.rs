//! Gateway manager
//!
//! Inter-domain bridge: supervises outbound and inbound connection tasks
//! (regular and reverse), coordinates discovery fan-outs with
//! per-correlation accumulation, and serves the gateway admin surface.
//! Connections are pure forwarders; the manager never touches tunneled
//! payloads.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::configuration;
use crate::domain_types::{Correlation, Execution, IpcId, Pid, ServiceName};
use crate::error::{ErrorKind, Result};
use crate::message::domain::{ConnectDirective, ProcessConnectRequest};
use crate::message::gateway::{DiscoverAccumulatedReply, DiscoverReply, DiscoverRequest};
use crate::message::service::{Call, Reply, Service};
use crate::message::{Envelope, Message};
use crate::process::{ProcessHandle, identity};
use crate::transport::bus::Inbound;
use crate::transport::pending;

pub mod inbound;
pub mod outbound;

use crate::domain::environment::domain_identity;
use crate::domain::spawn::InstanceContext;

/// Admin service: connection registry snapshot
pub const ADMIN_STATE: &str = ".casual/gateway/state";
/// Admin service: re-run discovery on every outbound connection
pub const ADMIN_REDISCOVER: &str = ".casual/gateway/rediscover";

/// Environment slot carrying the gateway configuration as JSON
pub const CONFIGURATION: &str = "CASUAL_GATEWAY_CONFIGURATION";

/// Which way a connection logically faces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Bound {
    /// We route calls out over it
    Out,
    /// We serve remote traffic arriving over it
    In,
}

/// Live per-connection state, shared with the connection tasks
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    /// Logical direction
    pub bound: Bound,
    /// Peer address
    pub peer: String,
    /// Local address
    pub local: String,
    /// Peer domain name once connected
    pub domain: Option<String>,
    /// Negotiated protocol version
    pub version: Option<u64>,
    /// Priority band (outbound)
    pub order: u64,
    /// Messages sent over the wire
    pub sent: u64,
    /// Messages received over the wire
    pub received: u64,
}

/// Supervision events from connection tasks
#[derive(Debug)]
pub enum Supervision {
    /// A connection finished its handshake
    Established {
        /// Connection pseudo-pid
        pid: Pid,
        /// The connection's device
        ipc: IpcId,
        /// Logical direction
        bound: Bound,
    },
    /// A connection is gone (it may come back under a fresh pid after a
    /// reconnect)
    Closed {
        /// Connection pseudo-pid
        pid: Pid,
    },
}

/// A discovery fan-out being accumulated
#[derive(Debug)]
struct FanOut {
    requester: ProcessHandle,
    correlation: Correlation,
    execution: Execution,
    outstanding: usize,
    replies: Vec<DiscoverReply>,
}

/// Runs the gateway manager as a domain instance
///
/// # Errors
///
/// Fails only on construction problems.
pub async fn run(context: InstanceContext) -> Result<()> {
    let configuration: configuration::Gateway = context
        .environment
        .get(CONFIGURATION)
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default();

    let inbound_device = context.bus.register(IpcId::generate());
    let handle = ProcessHandle::new(context.pid, inbound_device.ipc());
    let (supervision_tx, supervision_rx) = mpsc::unbounded_channel();

    let mut manager = Manager {
        handle,
        context,
        inbound: inbound_device,
        configuration,
        connections: Arc::new(DashMap::new()),
        outbound_devices: Vec::new(),
        inbound_devices: Vec::new(),
        supervision_rx,
        supervision_tx,
        fanouts: HashMap::new(),
        legs: HashMap::new(),
        discovered: Vec::new(),
        pending_sends: pending::Holder::new(),
    };

    if !manager.connect().await {
        return Ok(());
    }
    manager.start_connections();
    manager.run().await;
    Ok(())
}

struct Manager {
    handle: ProcessHandle,
    context: InstanceContext,
    inbound: Inbound,
    configuration: configuration::Gateway,
    /// shared with connection tasks for the admin snapshot
    connections: Arc<DashMap<Pid, ConnectionInfo>>,
    /// live outbound connection devices, for fan-out
    outbound_devices: Vec<(Pid, IpcId)>,
    /// live inbound connection devices, for shutdown
    inbound_devices: Vec<(Pid, IpcId)>,
    supervision_rx: mpsc::UnboundedReceiver<Supervision>,
    supervision_tx: mpsc::UnboundedSender<Supervision>,
    /// fan-outs by origin correlation
    fanouts: HashMap<Correlation, FanOut>,
    /// leg correlation to its origin correlation and carrying connection
    legs: HashMap<Correlation, (Correlation, Pid)>,
    /// service names discovery has ever been asked for; rediscovery re-asks
    discovered: Vec<ServiceName>,
    pending_sends: pending::Holder,
}

impl Manager {
    async fn connect(&mut self) -> bool {
        let request = Envelope::new(Message::DomainProcessConnectRequest(ProcessConnectRequest {
            process: self.handle,
            identity: Some(identity::GATEWAY_MANAGER),
            path: self.context.alias.to_string(),
        }));
        self.send(self.context.domain_manager, &request);
        loop {
            match self.inbound.next().await {
                Some(envelope) => {
                    if let Message::DomainProcessConnectReply(reply) = envelope.message {
                        match reply.directive {
                            ConnectDirective::Start => break,
                            ConnectDirective::Singleton | ConnectDirective::Shutdown => {
                                info!(directive = ?reply.directive, "connect refused - action: exit");
                                return false;
                            }
                        }
                    }
                }
                None => return false,
            }
        }
        self.advertise_admin_services();
        true
    }

    fn advertise_admin_services(&mut self) {
        let Some(service_manager) = self
            .context
            .environment
            .handle(crate::process::environment::SERVICE_MANAGER)
        else {
            return;
        };
        let services = [ADMIN_STATE, ADMIN_REDISCOVER]
            .iter()
            .filter_map(|name| ServiceName::try_new(*name).ok())
            .map(|name| Service {
                name,
                category: "admin".into(),
                transaction: crate::message::service::TransactionMode::None,
                timeout: None,
            })
            .collect();
        let advertise = Envelope::new(Message::ServiceAdvertise(
            crate::message::service::Advertise {
                process: self.handle,
                add: services,
                remove: Vec::new(),
                reset: false,
            },
        ));
        self.send(service_manager.ipc, &advertise);
    }

    /// Spawns every configured listener and connector
    fn start_connections(&mut self) {
        for (index, group) in self.configuration.outbound.clone().iter().enumerate() {
            let order = group.order;
            for connection in &group.connections {
                if group.reverse {
                    // we listen; the accepted socket is used outbound
                    if let Some(listener) = group.listener.clone() {
                        outbound::spawn_reverse(
                            listener,
                            connection.clone(),
                            order,
                            self.task_context(),
                        );
                    } else {
                        warn!(group = index, "reverse outbound group without listener - action: skip");
                    }
                } else {
                    outbound::spawn_regular(
                        connection.clone(),
                        order,
                        group.reconnect,
                        self.task_context(),
                    );
                }
            }
        }

        for group in self.configuration.inbound.clone() {
            if let Some(listener) = group.listener {
                inbound::spawn_listener(listener, self.task_context());
            }
            for peer in group.connect {
                // we dial; the established socket serves inbound traffic
                inbound::spawn_reverse(peer, self.task_context());
            }
        }
    }

    fn task_context(&self) -> TaskContext {
        TaskContext {
            bus: Arc::clone(&self.context.bus),
            environment: Arc::clone(&self.context.environment),
            manager: self.handle,
            connections: Arc::clone(&self.connections),
            supervision: self.supervision_tx.clone(),
        }
    }

    async fn run(mut self) {
        info!("gateway manager start");
        loop {
            tokio::select! {
                envelope = self.inbound.next() => {
                    let Some(envelope) = envelope else { break };
                    if !self.dispatch(envelope) {
                        break;
                    }
                }
                event = self.supervision_rx.recv() => {
                    let Some(event) = event else { break };
                    self.supervise(event);
                }
            }
            self.pending_sends.flush(&self.context.bus);
        }

        // take the connections down with us
        let devices: Vec<IpcId> = self
            .outbound_devices
            .iter()
            .chain(self.inbound_devices.iter())
            .map(|(_, ipc)| *ipc)
            .collect();
        for ipc in devices {
            let shutdown = Envelope::new(Message::ShutdownRequest { reply: false });
            self.send(ipc, &shutdown);
        }
        self.pending_sends.flush(&self.context.bus);
        self.context.bus.remove(self.handle.ipc);
        info!("gateway manager off-line");
    }

    fn dispatch(&mut self, envelope: Envelope) -> bool {
        match envelope.message.clone() {
            Message::GatewayDomainDiscoverRequest(request) => self.discover(&envelope, request),
            Message::GatewayDomainDiscoverReply(reply) => {
                self.discover_leg_reply(envelope.correlation, reply);
            }
            Message::ServiceCall(call) => self.admin_call(&envelope, &call),
            Message::ShutdownRequest { .. } => return false,
            Message::Poke | Message::DomainProcessConnectReply(_) => {}
            other => {
                debug!(message_type = %other.message_type(), "unhandled message - action: discard");
            }
        }
        true
    }

    fn supervise(&mut self, event: Supervision) {
        match event {
            Supervision::Established { pid, ipc, bound } => {
                match bound {
                    Bound::Out => self.outbound_devices.push((pid, ipc)),
                    Bound::In => self.inbound_devices.push((pid, ipc)),
                }
                info!(%pid, ?bound, "connection established");
            }
            Supervision::Closed { pid } => {
                self.connections.remove(&pid);
                self.outbound_devices
                    .retain(|(candidate, _)| *candidate != pid);
                self.inbound_devices
                    .retain(|(candidate, _)| *candidate != pid);
                // fan-outs waiting on this connection will never hear back
                self.fail_legs_of(pid);
            }
        }
    }

    // -- discovery coordination -------------------------------------------

    /// Fans a discovery out on every live outbound connection and
    /// accumulates the replies
    #[instrument(skip_all, fields(services = request.services.len(), queues = request.queues.len()))]
    fn discover(&mut self, envelope: &Envelope, request: DiscoverRequest) {
        let Some(requester) = request.process else {
            debug!("discovery request without reply address - action: discard");
            return;
        };

        for name in &request.services {
            if !self.discovered.contains(name) {
                self.discovered.push(name.clone());
            }
        }

        if self.outbound_devices.is_empty() {
            let reply = envelope.reverse(Message::GatewayDomainDiscoverAccumulatedReply(
                DiscoverAccumulatedReply {
                    replies: Vec::new(),
                },
            ));
            self.send(requester.ipc, &reply);
            return;
        }

        let mut outstanding = 0;
        let devices = self.outbound_devices.clone();
        for (pid, device) in devices {
            let leg = Envelope {
                correlation: Correlation::generate(),
                execution: envelope.execution,
                message: Message::GatewayDomainDiscoverRequest(DiscoverRequest {
                    process: Some(self.handle),
                    domain: domain_identity(&self.context.environment),
                    services: request.services.clone(),
                    queues: request.queues.clone(),
                }),
            };
            self.legs.insert(leg.correlation, (envelope.correlation, pid));
            self.send(device, &leg);
            outstanding += 1;
        }

        self.fanouts.insert(
            envelope.correlation,
            FanOut {
                requester,
                correlation: envelope.correlation,
                execution: envelope.execution,
                outstanding,
                replies: Vec::new(),
            },
        );
    }

    /// One leg of a fan-out answered
    fn discover_leg_reply(&mut self, leg: Correlation, reply: DiscoverReply) {
        let Some((origin, _)) = self.legs.remove(&leg) else {
            debug!("discovery reply without fan-out leg - action: discard");
            return;
        };
        let finished = {
            let Some(fanout) = self.fanouts.get_mut(&origin) else {
                return;
            };
            fanout.replies.push(reply);
            fanout.outstanding = fanout.outstanding.saturating_sub(1);
            fanout.outstanding == 0
        };
        if finished {
            self.finish_fanout(origin);
        }
    }

    /// A lost connection can never answer its legs; count them down so the
    /// fan-outs still complete
    fn fail_legs_of(&mut self, pid: Pid) {
        let lost: Vec<Correlation> = self
            .legs
            .iter()
            .filter(|(_, (_, carrier))| *carrier == pid)
            .map(|(leg, _)| *leg)
            .collect();
        for leg in lost {
            let Some((origin, _)) = self.legs.remove(&leg) else {
                continue;
            };
            let finished = {
                let Some(fanout) = self.fanouts.get_mut(&origin) else {
                    continue;
                };
                fanout.outstanding = fanout.outstanding.saturating_sub(1);
                fanout.outstanding == 0
            };
            if finished {
                self.finish_fanout(origin);
            }
        }
    }

    fn finish_fanout(&mut self, origin: Correlation) {
        let Some(fanout) = self.fanouts.remove(&origin) else {
            return;
        };
        let reply = Envelope {
            correlation: fanout.correlation,
            execution: fanout.execution,
            message: Message::GatewayDomainDiscoverAccumulatedReply(DiscoverAccumulatedReply {
                replies: fanout.replies,
            }),
        };
        self.send(fanout.requester.ipc, &reply);
    }

    // -- admin ------------------------------------------------------------

    fn admin_call(&mut self, envelope: &Envelope, call: &Call) {
        let name = call.service.to_string();
        let reply = match name.as_str() {
            ADMIN_STATE => {
                let snapshot: Vec<ConnectionInfo> = self
                    .connections
                    .iter()
                    .map(|entry| entry.value().clone())
                    .collect();
                Reply {
                    code: None,
                    trid: None,
                    payload: serde_json::to_vec(&snapshot).unwrap_or_default(),
                }
            }
            ADMIN_REDISCOVER => {
                let names = self.discovered.clone();
                let rediscover = Envelope::new(Message::GatewayDomainDiscoverRequest(
                    DiscoverRequest {
                        process: Some(self.handle),
                        domain: domain_identity(&self.context.environment),
                        services: names,
                        queues: Vec::new(),
                    },
                ));
                // self-addressed: the fan-out machinery treats it like any
                // other discovery, with ourselves as the requester
                if let Message::GatewayDomainDiscoverRequest(request) = rediscover.message.clone() {
                    self.discover(&rediscover, request);
                }
                Reply {
                    code: None,
                    trid: None,
                    payload: serde_json::to_vec(&serde_json::json!({
                        "connections": self.outbound_devices.len(),
                    }))
                    .unwrap_or_default(),
                }
            }
            _ => Reply::error(ErrorKind::NoEntry),
        };

        if !call.no_reply {
            let response = envelope.reverse(Message::ServiceReply(reply));
            self.send(call.process.ipc, &response);
        }
        self.acknowledge_admin_call(call);
    }

    fn acknowledge_admin_call(&mut self, call: &Call) {
        let Some(service_manager) = self
            .context
            .environment
            .handle(crate::process::environment::SERVICE_MANAGER)
        else {
            return;
        };
        let now = std::time::SystemTime::now();
        let ack = Envelope::new(Message::ServiceAck(crate::message::service::Ack {
            process: self.handle,
            metric: crate::message::service::Metric {
                service: call.service.clone(),
                start: now,
                end: now,
                code: None,
            },
        }));
        self.send(service_manager.ipc, &ack);
    }

    fn send(&mut self, to: IpcId, envelope: &Envelope) {
        if let Err(error) = self.pending_sends.send(&self.context.bus, to, envelope) {
            warn!(%error, %to, "failed to send message - action: drop");
        }
    }
}

/// Everything a connection task needs from the manager
#[derive(Clone)]
pub struct TaskContext {
    /// The domain bus
    pub bus: Arc<crate::transport::bus::Bus>,
    /// The domain environment
    pub environment: Arc<crate::domain::Environment>,
    /// The gateway manager's handle
    pub manager: ProcessHandle,
    /// Shared connection registry for the admin snapshot
    pub connections: Arc<DashMap<Pid, ConnectionInfo>>,
    /// Supervision channel back to the manager
    pub supervision: mpsc::UnboundedSender<Supervision>,
}
