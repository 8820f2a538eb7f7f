//! Queue manager
//!
//! Registry of queues to their hosting groups (local or behind a gateway),
//! lookup with parked entries and gateway discovery for unknown names, and
//! the queue admin surface.

use std::collections::HashMap;

use tracing::{debug, info, instrument, warn};

use crate::configuration;
use crate::domain_types::{Correlation, Execution, InstanceOrder, IpcId, Pid, QueueName};
use crate::error::Result;
use crate::message::domain::{ConnectDirective, ProcessConnectRequest};
use crate::message::event;
use crate::message::gateway::DiscoverRequest;
use crate::message::queue::{
    GroupConnectReply, GroupConnectRequest, LookupDiscardReply, LookupDiscardRequest, LookupReply,
    LookupRequest, Queue, QueueAdvertise,
};
use crate::message::service::DiscardState;
use crate::message::{Envelope, Message, MessageType};
use crate::process::{ProcessHandle, environment, identity};
use crate::transport::bus::Inbound;
use crate::transport::pending;

use crate::domain::environment::domain_identity;
use crate::domain::spawn::InstanceContext;

/// Environment slot carrying the queue configuration as JSON
pub const CONFIGURATION: &str = "CASUAL_QUEUE_CONFIGURATION";

/// Admin service: queue registry snapshot
pub const ADMIN_STATE: &str = ".casual/queue/state";
/// Admin service: move error-queue messages back
pub const ADMIN_RESTORE: &str = ".casual/queue/restore";
/// Admin service: purge a queue
pub const ADMIN_CLEAR: &str = ".casual/queue/clear";
/// Admin service: peek messages without consuming
pub const ADMIN_LIST_MESSAGES: &str = ".casual/queue/list/messages";

/// Payload of the restore/clear/list admin services
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct QueueAdminRequest {
    /// Target queue
    pub queue: String,
}

/// A queue instance: the hosting group and its priority
#[derive(Debug, Clone, Copy)]
struct Instance {
    process: ProcessHandle,
    order: InstanceOrder,
}

/// A lookup parked on gateway discovery
#[derive(Debug)]
struct Parked {
    reply_to: ProcessHandle,
    correlation: Correlation,
    execution: Execution,
    name: QueueName,
}

/// An admin operation forwarded to a group, awaiting its reply
#[derive(Debug)]
struct ForwardedAdmin {
    caller: ProcessHandle,
    correlation: Correlation,
    execution: Execution,
    service: crate::domain_types::ServiceName,
    no_reply: bool,
}

/// Runs the queue manager as a domain instance
///
/// # Errors
///
/// Fails only on construction problems.
pub async fn run(context: InstanceContext) -> Result<()> {
    let configuration: configuration::QueueManager = context
        .environment
        .get(CONFIGURATION)
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default();

    let inbound = context.bus.register(IpcId::generate());
    let handle = ProcessHandle::new(context.pid, inbound.ipc());

    let mut manager = Manager {
        handle,
        context,
        inbound,
        configuration,
        groups: HashMap::new(),
        queues: HashMap::new(),
        parked: Vec::new(),
        discoveries: HashMap::new(),
        forwarded_admin: HashMap::new(),
        pending_sends: pending::Holder::new(),
    };

    if !manager.connect().await {
        return Ok(());
    }
    manager.run().await;
    Ok(())
}

struct Manager {
    handle: ProcessHandle,
    context: InstanceContext,
    inbound: Inbound,
    configuration: configuration::QueueManager,
    /// registered groups by pid
    groups: HashMap<Pid, String>,
    /// queue name to hosting instances, best first
    queues: HashMap<QueueName, Vec<Instance>>,
    parked: Vec<Parked>,
    /// discovery correlation to the parked lookup correlation
    discoveries: HashMap<Correlation, Correlation>,
    /// forwarded admin operations by their group-facing correlation
    forwarded_admin: HashMap<Correlation, ForwardedAdmin>,
    pending_sends: pending::Holder,
}

impl Manager {
    async fn connect(&mut self) -> bool {
        let request = Envelope::new(Message::DomainProcessConnectRequest(ProcessConnectRequest {
            process: self.handle,
            identity: Some(identity::QUEUE_MANAGER),
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

        let subscribe = Envelope::new(Message::EventSubscriptionBegin(event::SubscriptionBegin {
            process: self.handle,
            types: vec![MessageType::EventProcessExit],
        }));
        self.send(self.context.domain_manager, &subscribe);
        self.advertise_admin_services();
        true
    }

    fn advertise_admin_services(&mut self) {
        let Some(service_manager) = self
            .context
            .environment
            .handle(environment::SERVICE_MANAGER)
        else {
            return;
        };
        let services = [ADMIN_STATE, ADMIN_RESTORE, ADMIN_CLEAR, ADMIN_LIST_MESSAGES]
            .iter()
            .filter_map(|name| crate::domain_types::ServiceName::try_new(*name).ok())
            .map(|name| crate::message::service::Service {
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

    async fn run(mut self) {
        info!("queue manager start");
        while let Some(envelope) = self.inbound.next().await {
            if !self.dispatch(envelope) {
                break;
            }
            self.pending_sends.flush(&self.context.bus);
        }
        self.context.bus.remove(self.handle.ipc);
        info!("queue manager off-line");
    }

    fn dispatch(&mut self, envelope: Envelope) -> bool {
        match envelope.message.clone() {
            Message::QueueGroupConnectRequest(request) => self.group_connect(&envelope, &request),
            Message::QueueAdvertise(advertise) => self.advertise(&advertise),
            Message::QueueLookupRequest(request) => self.lookup(&envelope, &request),
            Message::QueueLookupDiscardRequest(request) => self.discard(&envelope, &request),
            Message::GatewayDomainDiscoverRequest(request) => {
                self.answer_discovery(&envelope, &request);
            }
            Message::GatewayDomainDiscoverAccumulatedReply(accumulated) => {
                self.discovery_reply(envelope.correlation, &accumulated);
            }
            Message::EventProcessExit(exit) => self.process_exit(exit.exit.pid),
            Message::ServiceCall(call) => self.admin_call(&envelope, &call),
            Message::QueueRestoreReply(reply) => {
                self.admin_forward_reply(
                    envelope.correlation,
                    serde_json::json!({ "restored": reply.restored }),
                );
            }
            Message::QueueClearReply(reply) => {
                self.admin_forward_reply(
                    envelope.correlation,
                    serde_json::json!({ "removed": reply.removed }),
                );
            }
            Message::QueuePeekReply(reply) => {
                let messages: Vec<serde_json::Value> = reply
                    .messages
                    .iter()
                    .map(|message| {
                        serde_json::json!({
                            "id": message.id.to_string(),
                            "type": message.r#type,
                            "size": message.payload.len(),
                            "redelivered": message.redelivered,
                        })
                    })
                    .collect();
                self.admin_forward_reply(
                    envelope.correlation,
                    serde_json::json!({ "messages": messages }),
                );
            }
            Message::ShutdownRequest { .. } => return false,
            Message::Poke | Message::DomainProcessConnectReply(_) => {}
            other => {
                debug!(message_type = %other.message_type(), "unhandled message - action: discard");
            }
        }
        true
    }

    // -- admin services ---------------------------------------------------

    fn admin_call(&mut self, envelope: &Envelope, call: &crate::message::service::Call) {
        let name = call.service.to_string();

        if name == ADMIN_STATE {
            let snapshot: Vec<serde_json::Value> = self
                .queues
                .iter()
                .map(|(queue, instances)| {
                    serde_json::json!({
                        "name": queue.to_string(),
                        "instances": instances
                            .iter()
                            .map(|instance| u64::from(instance.process.pid))
                            .collect::<Vec<_>>(),
                    })
                })
                .collect();
            self.finish_admin_call(
                envelope,
                call,
                crate::message::service::Reply {
                    code: None,
                    trid: None,
                    payload: serde_json::to_vec(&snapshot).unwrap_or_default(),
                },
            );
            return;
        }

        let target = serde_json::from_slice::<QueueAdminRequest>(&call.payload)
            .ok()
            .and_then(|request| QueueName::try_new(request.queue).ok());
        let Some(queue) = target else {
            self.finish_admin_call(
                envelope,
                call,
                crate::message::service::Reply::error(crate::error::ErrorKind::InvalidSemantics),
            );
            return;
        };
        let Some(group) = self
            .queues
            .get(&queue)
            .and_then(|instances| instances.first())
            .map(|instance| instance.process)
        else {
            self.finish_admin_call(
                envelope,
                call,
                crate::message::service::Reply::error(crate::error::ErrorKind::Absent),
            );
            return;
        };

        let forwarded = match name.as_str() {
            ADMIN_RESTORE => Envelope::new(Message::QueueRestoreRequest(
                crate::message::queue::RestoreRequest {
                    process: self.handle,
                    name: queue,
                },
            )),
            ADMIN_CLEAR => Envelope::new(Message::QueueClearRequest(
                crate::message::queue::ClearRequest {
                    process: self.handle,
                    name: queue,
                },
            )),
            ADMIN_LIST_MESSAGES => Envelope::new(Message::QueuePeekRequest(
                crate::message::queue::PeekRequest {
                    process: self.handle,
                    name: queue,
                },
            )),
            _ => {
                self.finish_admin_call(
                    envelope,
                    call,
                    crate::message::service::Reply::error(crate::error::ErrorKind::NoEntry),
                );
                return;
            }
        };

        self.forwarded_admin.insert(
            forwarded.correlation,
            ForwardedAdmin {
                caller: call.process,
                correlation: envelope.correlation,
                execution: envelope.execution,
                service: call.service.clone(),
                no_reply: call.no_reply,
            },
        );
        self.send(group.ipc, &forwarded);
    }

    /// A group answered a forwarded admin operation
    fn admin_forward_reply(&mut self, correlation: Correlation, payload: serde_json::Value) {
        let Some(forwarded) = self.forwarded_admin.remove(&correlation) else {
            debug!("group reply without forwarded admin operation - action: discard");
            return;
        };
        if !forwarded.no_reply {
            let reply = Envelope {
                correlation: forwarded.correlation,
                execution: forwarded.execution,
                message: Message::ServiceReply(crate::message::service::Reply {
                    code: None,
                    trid: None,
                    payload: serde_json::to_vec(&payload).unwrap_or_default(),
                }),
            };
            self.send(forwarded.caller.ipc, &reply);
        }
        self.acknowledge_admin(&forwarded.service);
    }

    fn finish_admin_call(
        &mut self,
        envelope: &Envelope,
        call: &crate::message::service::Call,
        reply: crate::message::service::Reply,
    ) {
        if !call.no_reply {
            let response = envelope.reverse(Message::ServiceReply(reply));
            self.send(call.process.ipc, &response);
        }
        self.acknowledge_admin(&call.service);
    }

    fn acknowledge_admin(&mut self, service: &crate::domain_types::ServiceName) {
        let Some(service_manager) = self
            .context
            .environment
            .handle(environment::SERVICE_MANAGER)
        else {
            return;
        };
        let now = std::time::SystemTime::now();
        let ack = Envelope::new(Message::ServiceAck(crate::message::service::Ack {
            process: self.handle,
            metric: crate::message::service::Metric {
                service: service.clone(),
                start: now,
                end: now,
                code: None,
            },
        }));
        self.send(service_manager.ipc, &ack);
    }

    // -- groups -----------------------------------------------------------

    #[instrument(skip_all, fields(group = %request.name, pid = %request.process.pid))]
    fn group_connect(&mut self, envelope: &Envelope, request: &GroupConnectRequest) {
        self.groups.insert(request.process.pid, request.name.clone());

        let queues: Vec<Queue> = self
            .configuration
            .groups
            .iter()
            .find(|group| group.name == request.name)
            .map(|group| {
                group
                    .queues
                    .iter()
                    .map(|queue| Queue {
                        name: queue.name.clone(),
                        retry_count: queue.retry_count,
                        retry_delay: queue.retry_delay,
                    })
                    .collect()
            })
            .unwrap_or_default();

        if queues.is_empty() {
            warn!("failed to correlate configuration for group");
        }
        let reply = envelope.reverse(Message::QueueGroupConnectReply(GroupConnectReply {
            queues,
        }));
        self.send(request.process.ipc, &reply);
    }

    // -- advertise --------------------------------------------------------

    fn advertise(&mut self, advertise: &QueueAdvertise) {
        if advertise.reset {
            self.remove_instance(advertise.process.pid);
        }

        // gateway connections carry remote queues; their priority comes in
        // through the concurrent-advertise order convention (pid-keyed
        // instances keep insertion order otherwise)
        for name in &advertise.add {
            let instances = self.queues.entry(name.clone()).or_default();
            if !instances
                .iter()
                .any(|instance| instance.process.pid == advertise.process.pid)
            {
                instances.push(Instance {
                    process: advertise.process,
                    order: InstanceOrder::default(),
                });
                instances.sort_by_key(|instance| instance.order);
            }
        }
        for name in &advertise.remove {
            if let Some(instances) = self.queues.get_mut(name) {
                instances.retain(|instance| instance.process.pid != advertise.process.pid);
                if instances.is_empty() {
                    self.queues.remove(name);
                }
            }
        }

        if !advertise.add.is_empty() {
            self.drain_parked(&advertise.add);
        }
    }

    fn remove_instance(&mut self, pid: Pid) {
        self.queues.retain(|_, instances| {
            instances.retain(|instance| instance.process.pid != pid);
            !instances.is_empty()
        });
    }

    /// Newly added queues answer matching parked lookups
    fn drain_parked(&mut self, added: &[QueueName]) {
        let mut remaining = Vec::new();
        for parked in std::mem::take(&mut self.parked) {
            if added.contains(&parked.name) {
                let process = self
                    .queues
                    .get(&parked.name)
                    .and_then(|instances| instances.first())
                    .map(|instance| instance.process);
                let reply = Envelope {
                    correlation: parked.correlation,
                    execution: parked.execution,
                    message: Message::QueueLookupReply(LookupReply {
                        name: parked.name.clone(),
                        process,
                    }),
                };
                self.send(parked.reply_to.ipc, &reply);
            } else {
                remaining.push(parked);
            }
        }
        self.parked = remaining;
    }

    // -- lookup -----------------------------------------------------------

    #[instrument(skip_all, fields(queue = %request.name))]
    fn lookup(&mut self, envelope: &Envelope, request: &LookupRequest) {
        if let Some(instance) = self
            .queues
            .get(&request.name)
            .and_then(|instances| instances.first())
        {
            let reply = envelope.reverse(Message::QueueLookupReply(LookupReply {
                name: request.name.clone(),
                process: Some(instance.process),
            }));
            self.send(request.process.ipc, &reply);
            return;
        }

        // unknown here: ask the neighbours, when we have any
        if let Some(gateway) = self.context.environment.handle(environment::GATEWAY_MANAGER) {
            let discover = Envelope::new(Message::GatewayDomainDiscoverRequest(DiscoverRequest {
                process: Some(self.handle),
                domain: domain_identity(&self.context.environment),
                services: Vec::new(),
                queues: vec![request.name.clone()],
            }));
            self.discoveries
                .insert(discover.correlation, envelope.correlation);
            self.parked.push(Parked {
                reply_to: request.process,
                correlation: envelope.correlation,
                execution: envelope.execution,
                name: request.name.clone(),
            });
            self.send(gateway.ipc, &discover);
            // the reply follows the discovery outcome
            return;
        }

        let reply = envelope.reverse(Message::QueueLookupReply(LookupReply {
            name: request.name.clone(),
            process: None,
        }));
        self.send(request.process.ipc, &reply);
    }

    fn discard(&mut self, envelope: &Envelope, request: &LookupDiscardRequest) {
        let before = self.parked.len();
        self.parked
            .retain(|parked| parked.correlation != request.correlation);
        let state = if before != self.parked.len() {
            self.discoveries
                .retain(|_, lookup| *lookup != request.correlation);
            DiscardState::Discarded
        } else {
            DiscardState::Replied
        };
        let reply = envelope.reverse(Message::QueueLookupDiscardReply(LookupDiscardReply {
            state,
        }));
        self.send(request.process.ipc, &reply);
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
            .parked
            .iter()
            .position(|parked| parked.correlation == lookup_correlation)
        else {
            return;
        };

        let name = self.parked[position].name.clone();
        let claimed = accumulated
            .replies
            .iter()
            .any(|reply| reply.queues.contains(&name));
        if claimed && !self.queues.contains_key(&name) {
            // a peer claims the queue; its advertisement is still in flight
            // and will drain this entry when it lands
            return;
        }
        let parked = self.parked.remove(position);

        let process = self
            .queues
            .get(&parked.name)
            .and_then(|instances| instances.first())
            .map(|instance| instance.process);
        let reply = Envelope {
            correlation: parked.correlation,
            execution: parked.execution,
            message: Message::QueueLookupReply(LookupReply {
                name: parked.name.clone(),
                process,
            }),
        };
        self.send(parked.reply_to.ipc, &reply);
    }

    /// A remote domain asks which of the named queues this domain hosts
    fn answer_discovery(&mut self, envelope: &Envelope, request: &DiscoverRequest) {
        let Some(reply_to) = request.process else {
            debug!("discovery request without reply address - action: discard");
            return;
        };
        let queues: Vec<QueueName> = request
            .queues
            .iter()
            .filter(|name| self.queues.contains_key(*name))
            .cloned()
            .collect();

        let reply = envelope.reverse(Message::GatewayDomainDiscoverReply(
            crate::message::gateway::DiscoverReply {
                domain: domain_identity(&self.context.environment),
                services: Vec::new(),
                queues,
            },
        ));
        self.send(reply_to.ipc, &reply);
    }

    fn process_exit(&mut self, pid: Pid) {
        self.groups.remove(&pid);
        self.remove_instance(pid);
        // parked lookups whose requester died
        self.parked.retain(|parked| parked.reply_to.pid != pid);
    }

    fn send(&mut self, to: IpcId, envelope: &Envelope) {
        if let Err(error) = self.pending_sends.send(&self.context.bus, to, envelope) {
            warn!(%error, %to, "failed to send message - action: drop");
        }
    }
}
