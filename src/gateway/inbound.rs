//! Inbound connection
//!
//! Serves a peer domain: answers the domain handshake, dispatches remote
//! service calls into the local domain with the caller's correlation
//! preserved, routes remote queue operations through the queue manager,
//! re-injects remote transaction phases into the local coordinator, and
//! answers discovery by consulting the service and queue managers.
//!
//! Regular mode listens; reverse mode dials the peer and then serves the
//! established socket exactly the same way.

use std::collections::HashMap;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream, tcp::OwnedWriteHalf};
use tracing::{debug, info, warn};

use crate::domain_types::{Correlation, IpcId, Pid};
use crate::error::ErrorKind;
use crate::message::gateway::{
    DiscoverReply, DiscoverRequest, DomainConnectReply, PROTOCOL_VERSIONS, negotiate,
};
use crate::message::queue::{DequeueReply, EnqueueReply};
use crate::message::service::{Call, LookupContext, LookupRequest, LookupState, Reply};
use crate::message::{Envelope, Message};
use crate::process::{ProcessHandle, environment};
use crate::transport::{Assembler, pending, tcp};

use super::{Bound, ConnectionInfo, Supervision, TaskContext};

/// A remote call waiting for its local lookup to resolve
#[derive(Debug)]
struct PendingCall {
    call: Call,
}

/// A remote queue operation waiting for its queue lookup
#[derive(Debug)]
enum PendingQueueOp {
    Enqueue(crate::message::queue::EnqueueRequest),
    Dequeue(crate::message::queue::DequeueRequest),
}

/// A discovery being answered locally: legs out to the service and queue
/// managers, merged when all are back
#[derive(Debug)]
struct PendingDiscovery {
    remote_correlation: Correlation,
    outstanding: usize,
    merged: DiscoverReply,
}

/// Listens and serves every accepted peer
pub fn spawn_listener(listener: String, context: TaskContext) {
    tokio::spawn(async move {
        let bound = match TcpListener::bind(&listener).await {
            Ok(bound) => bound,
            Err(error) => {
                warn!(address = %listener, %error, "failed to bind inbound listener");
                return;
            }
        };
        info!(address = %listener, "inbound listening");
        loop {
            match bound.accept().await {
                Ok((stream, peer)) => {
                    debug!(%peer, "inbound accepted");
                    let context = context.clone();
                    tokio::spawn(async move {
                        run_connection(stream, &context).await;
                    });
                }
                Err(error) => {
                    warn!(%error, "inbound accept failed");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        }
    });
}

/// Dials the peer and serves inbound over the established socket, with
/// backoff and reconnection
pub fn spawn_reverse(peer: String, context: TaskContext) {
    tokio::spawn(async move {
        let mut attempts: u32 = 0;
        loop {
            match TcpStream::connect(&peer).await {
                Ok(stream) => {
                    attempts = 0;
                    run_connection(stream, &context).await;
                    info!(address = %peer, "reverse inbound lost - action: reconnect");
                }
                Err(error) => {
                    debug!(address = %peer, %error, "reverse inbound connect failed");
                }
            }
            attempts = attempts.saturating_add(1);
            let backoff = Duration::from_millis(250)
                .saturating_mul(2_u32.saturating_pow(attempts.min(6)))
                .min(Duration::from_secs(15));
            tokio::time::sleep(backoff).await;
        }
    });
}

/// One established connection, from handshake to loss
async fn run_connection(mut stream: TcpStream, context: &TaskContext) {
    let pid = Pid::allocate();
    let mut device = context.bus.register(IpcId::generate());
    let handle = ProcessHandle::new(pid, device.ipc());
    let mut sends = pending::Holder::new();
    let mut assembler = Assembler::new();

    // the logical-outbound side opens the conversation; we answer
    let peer = loop {
        match tcp::receive(&mut stream, &mut assembler).await {
            Ok(Some(envelope)) => {
                if let Message::GatewayDomainConnectRequest(request) = &envelope.message {
                    let version = negotiate(&PROTOCOL_VERSIONS, &request.versions);
                    let reply = envelope.reverse(Message::GatewayDomainConnectReply(
                        DomainConnectReply {
                            domain: crate::domain::environment::domain_identity(
                                &context.environment,
                            ),
                            version: version.unwrap_or(0),
                        },
                    ));
                    if tcp::send(&mut stream, &reply).await.is_err() {
                        context.bus.remove(handle.ipc);
                        return;
                    }
                    match version {
                        Some(_) => break request.domain.clone(),
                        None => {
                            warn!(peer = %request.domain.name,
                                "no common protocol version - action: close");
                            context.bus.remove(handle.ipc);
                            return;
                        }
                    }
                }
            }
            Ok(None) | Err(_) => {
                context.bus.remove(handle.ipc);
                return;
            }
        }
    };

    let (local_address, peer_address) = {
        let local = stream
            .local_addr()
            .map(|address| address.to_string())
            .unwrap_or_default();
        let remote = stream
            .peer_addr()
            .map(|address| address.to_string())
            .unwrap_or_default();
        (local, remote)
    };
    context.connections.insert(
        pid,
        ConnectionInfo {
            bound: Bound::In,
            peer: peer_address,
            local: local_address,
            domain: Some(peer.name.to_string()),
            version: None,
            order: 0,
            sent: 0,
            received: 0,
        },
    );
    let _ = context.supervision.send(Supervision::Established {
        pid,
        ipc: handle.ipc,
        bound: Bound::In,
    });
    info!(peer = %peer.name, "inbound connection established");

    let (read_half, mut write_half) = stream.into_split();
    let mut remote = tcp::spawn_reader(read_half);

    let mut worker = Connection {
        handle,
        context: context.clone(),
        sends,
        pending_calls: HashMap::new(),
        pending_queue: HashMap::new(),
        queue_lookups: HashMap::new(),
        discoveries: HashMap::new(),
        pending_discovery: HashMap::new(),
    };

    loop {
        tokio::select! {
            local = device.next() => {
                let Some(envelope) = local else { break };
                if matches!(envelope.message, Message::ShutdownRequest { .. }) {
                    break;
                }
                if !worker.route_local(&mut write_half, envelope).await {
                    break;
                }
            }
            event = remote.recv() => {
                match event {
                    Some(tcp::ReaderEvent::Message(envelope)) => {
                        if let Some(mut info) = worker.context.connections.get_mut(&pid) {
                            info.received += 1;
                        }
                        worker.dispatch_remote(envelope);
                    }
                    Some(tcp::ReaderEvent::Closed) | None => break,
                    Some(tcp::ReaderEvent::Failed(error)) => {
                        debug!(%error, "receive failed");
                        break;
                    }
                }
            }
        }
        worker.sends.flush(&worker.context.bus);
    }

    sends = worker.sends;
    sends.flush(&context.bus);
    context.bus.remove(handle.ipc);
    let _ = context.supervision.send(Supervision::Closed { pid });
    info!(peer = %peer.name, "inbound connection closed");
}

struct Connection {
    handle: ProcessHandle,
    context: TaskContext,
    sends: pending::Holder,
    /// remote calls awaiting their local lookup, by the remote correlation
    pending_calls: HashMap<Correlation, PendingCall>,
    /// remote queue operations awaiting their queue lookup
    pending_queue: HashMap<Correlation, PendingQueueOp>,
    /// queue-lookup correlation to the operation correlation
    queue_lookups: HashMap<Correlation, Correlation>,
    /// local discovery legs by leg correlation
    discoveries: HashMap<Correlation, Correlation>,
    /// discovery accumulators by remote correlation
    pending_discovery: HashMap<Correlation, PendingDiscovery>,
}

impl Connection {
    /// A message arrived from the peer; dispatch into the local domain
    fn dispatch_remote(&mut self, envelope: Envelope) {
        match envelope.message.clone() {
            Message::ServiceCall(call) => self.remote_call(&envelope, call),
            Message::TransactionResourcePrepareRequest(mut request)
            | Message::TransactionResourceCommitRequest(mut request)
            | Message::TransactionResourceRollbackRequest(mut request) => {
                // re-inject into the local coordinator; the XID crosses
                // unchanged so both logs name the same transaction
                let Some(manager) = self
                    .context
                    .environment
                    .handle(environment::TRANSACTION_MANAGER)
                else {
                    warn!("transaction manager not published - action: drop phase request");
                    return;
                };
                request.process = self.handle;
                let message = match envelope.message.message_type() {
                    crate::message::MessageType::TransactionResourcePrepareRequest => {
                        Message::TransactionResourcePrepareRequest(request)
                    }
                    crate::message::MessageType::TransactionResourceCommitRequest => {
                        Message::TransactionResourceCommitRequest(request)
                    }
                    _ => Message::TransactionResourceRollbackRequest(request),
                };
                let forwarded = Envelope {
                    correlation: envelope.correlation,
                    execution: envelope.execution,
                    message,
                };
                self.send(manager.ipc, &forwarded);
            }
            Message::QueueEnqueueRequest(request) => {
                self.remote_queue_op(&envelope, PendingQueueOp::Enqueue(request));
            }
            Message::QueueDequeueRequest(request) => {
                self.remote_queue_op(&envelope, PendingQueueOp::Dequeue(request));
            }
            Message::GatewayDomainDiscoverRequest(request) => {
                self.remote_discovery(&envelope, &request);
            }
            other => {
                debug!(message_type = %other.message_type(),
                    "unhandled remote message - action: discard");
            }
        }
    }

    /// A remote service call: local lookup under the remote correlation so
    /// reservation, acknowledgement and reply all correlate end-to-end
    fn remote_call(&mut self, envelope: &Envelope, call: Call) {
        let Some(service_manager) = self.context.environment.handle(environment::SERVICE_MANAGER)
        else {
            warn!("service manager not published - action: answer no_entry");
            self.pending_calls.insert(
                envelope.correlation,
                PendingCall { call },
            );
            self.finish_call_absent(envelope.correlation);
            return;
        };

        let lookup = Envelope {
            correlation: envelope.correlation,
            execution: envelope.execution,
            message: Message::ServiceLookupRequest(LookupRequest {
                process: self.handle,
                requested: call.service.clone(),
                context: LookupContext::Regular,
                deadline: call.deadline,
            }),
        };
        self.pending_calls.insert(envelope.correlation, PendingCall { call });
        self.send(service_manager.ipc, &lookup);
    }

    fn finish_call_absent(&mut self, correlation: Correlation) {
        if self.pending_calls.remove(&correlation).is_some() {
            // tunneled back by route_local's catch-all when queued there;
            // here the synthesized reply goes straight out at the next
            // local round
            let reply = Envelope {
                correlation,
                execution: crate::domain_types::Execution::generate(),
                message: Message::ServiceReply(Reply::error(ErrorKind::NoEntry)),
            };
            // route through our own device so the write half handles it
            self.send(self.handle.ipc, &reply);
        }
    }

    /// A remote queue operation: resolve the hosting group first
    fn remote_queue_op(&mut self, envelope: &Envelope, operation: PendingQueueOp) {
        let Some(queue_manager) = self.context.environment.handle(environment::QUEUE_MANAGER)
        else {
            warn!("queue manager not published - action: answer absent");
            let message = match operation {
                PendingQueueOp::Enqueue(_) => Message::QueueEnqueueReply(EnqueueReply {
                    id: None,
                    code: Some(ErrorKind::Absent),
                }),
                PendingQueueOp::Dequeue(_) => Message::QueueDequeueReply(DequeueReply {
                    message: None,
                    code: Some(ErrorKind::Absent),
                }),
            };
            let reply = Envelope {
                correlation: envelope.correlation,
                execution: envelope.execution,
                message,
            };
            self.send(self.handle.ipc, &reply);
            return;
        };

        let name = match &operation {
            PendingQueueOp::Enqueue(request) => request.name.clone(),
            PendingQueueOp::Dequeue(request) => request.name.clone(),
        };
        let lookup = Envelope::new(Message::QueueLookupRequest(
            crate::message::queue::LookupRequest {
                process: self.handle,
                name,
            },
        ));
        self.queue_lookups
            .insert(lookup.correlation, envelope.correlation);
        self.pending_queue.insert(envelope.correlation, operation);
        self.send(queue_manager.ipc, &lookup);
    }

    /// A remote discovery: consult the local service and queue managers and
    /// merge their answers into one reply
    fn remote_discovery(&mut self, envelope: &Envelope, request: &DiscoverRequest) {
        let mut outstanding = 0;
        let merged = DiscoverReply {
            domain: crate::domain::environment::domain_identity(&self.context.environment),
            services: Vec::new(),
            queues: Vec::new(),
        };

        if !request.services.is_empty() {
            if let Some(service_manager) =
                self.context.environment.handle(environment::SERVICE_MANAGER)
            {
                let leg = Envelope::new(Message::GatewayDomainDiscoverRequest(DiscoverRequest {
                    process: Some(self.handle),
                    domain: request.domain.clone(),
                    services: request.services.clone(),
                    queues: Vec::new(),
                }));
                self.discoveries.insert(leg.correlation, envelope.correlation);
                self.send(service_manager.ipc, &leg);
                outstanding += 1;
            }
        }
        if !request.queues.is_empty() {
            if let Some(queue_manager) = self.context.environment.handle(environment::QUEUE_MANAGER)
            {
                let leg = Envelope::new(Message::GatewayDomainDiscoverRequest(DiscoverRequest {
                    process: Some(self.handle),
                    domain: request.domain.clone(),
                    services: Vec::new(),
                    queues: request.queues.clone(),
                }));
                self.discoveries.insert(leg.correlation, envelope.correlation);
                self.send(queue_manager.ipc, &leg);
                outstanding += 1;
            }
        }

        if outstanding == 0 {
            // nothing to consult: answer empty straight away
            let reply = Envelope {
                correlation: envelope.correlation,
                execution: envelope.execution,
                message: Message::GatewayDomainDiscoverReply(merged),
            };
            self.send(self.handle.ipc, &reply);
            return;
        }

        self.pending_discovery.insert(
            envelope.correlation,
            PendingDiscovery {
                remote_correlation: envelope.correlation,
                outstanding,
                merged,
            },
        );
    }

    /// A local message: either a step of a pending dispatch, or a reply to
    /// tunnel back. Returns `false` on write failure.
    async fn route_local(&mut self, write: &mut OwnedWriteHalf, envelope: Envelope) -> bool {
        match envelope.message.clone() {
            Message::ServiceLookupReply(lookup) => {
                match lookup.state {
                    LookupState::Idle => {
                        let Some(pending) = self.pending_calls.remove(&envelope.correlation)
                        else {
                            return true;
                        };
                        let Some(target) = lookup.process else {
                            return true;
                        };
                        let mut call = pending.call;
                        call.process = self.handle;
                        let dispatch = envelope.reverse(Message::ServiceCall(call));
                        self.send(target.ipc, &dispatch);
                    }
                    LookupState::Busy => {
                        // a second reply follows; the call stays parked
                    }
                    LookupState::Absent => {
                        if self.pending_calls.remove(&envelope.correlation).is_some() {
                            let reply = envelope
                                .reverse(Message::ServiceReply(Reply::error(ErrorKind::NoEntry)));
                            return self.tunnel(write, &reply).await;
                        }
                    }
                }
                true
            }
            Message::QueueLookupReply(lookup) => {
                let Some(operation_correlation) = self.queue_lookups.remove(&envelope.correlation)
                else {
                    return true;
                };
                let Some(operation) = self.pending_queue.remove(&operation_correlation) else {
                    return true;
                };
                match lookup.process {
                    Some(group) => {
                        let message = match operation {
                            PendingQueueOp::Enqueue(mut request) => {
                                request.process = self.handle;
                                Message::QueueEnqueueRequest(request)
                            }
                            PendingQueueOp::Dequeue(mut request) => {
                                request.process = self.handle;
                                Message::QueueDequeueRequest(request)
                            }
                        };
                        let forwarded = Envelope {
                            correlation: operation_correlation,
                            execution: envelope.execution,
                            message,
                        };
                        self.send(group.ipc, &forwarded);
                        true
                    }
                    None => {
                        let message = match operation {
                            PendingQueueOp::Enqueue(_) => Message::QueueEnqueueReply(EnqueueReply {
                                id: None,
                                code: Some(ErrorKind::Absent),
                            }),
                            PendingQueueOp::Dequeue(_) => Message::QueueDequeueReply(DequeueReply {
                                message: None,
                                code: Some(ErrorKind::Absent),
                            }),
                        };
                        let reply = Envelope {
                            correlation: operation_correlation,
                            execution: envelope.execution,
                            message,
                        };
                        self.tunnel(write, &reply).await
                    }
                }
            }
            Message::GatewayDomainDiscoverReply(reply) => {
                let Some(remote_correlation) = self.discoveries.remove(&envelope.correlation)
                else {
                    return true;
                };
                let finished = {
                    let Some(pending) = self.pending_discovery.get_mut(&remote_correlation) else {
                        return true;
                    };
                    pending.merged.services.extend(reply.services);
                    pending.merged.queues.extend(reply.queues);
                    pending.outstanding = pending.outstanding.saturating_sub(1);
                    pending.outstanding == 0
                };
                if finished {
                    if let Some(pending) = self.pending_discovery.remove(&remote_correlation) {
                        let merged = Envelope {
                            correlation: pending.remote_correlation,
                            execution: envelope.execution,
                            message: Message::GatewayDomainDiscoverReply(pending.merged),
                        };
                        return self.tunnel(write, &merged).await;
                    }
                }
                true
            }
            // replies from local dispatches tunnel back to the peer
            Message::ServiceReply(_)
            | Message::QueueEnqueueReply(_)
            | Message::QueueDequeueReply(_)
            | Message::TransactionResourcePrepareReply(_)
            | Message::TransactionResourceCommitReply(_)
            | Message::TransactionResourceRollbackReply(_) => self.tunnel(write, &envelope).await,
            Message::Poke => true,
            other => {
                debug!(message_type = %other.message_type(),
                    "unhandled local message - action: discard");
                true
            }
        }
    }

    async fn tunnel(&mut self, write: &mut OwnedWriteHalf, envelope: &Envelope) -> bool {
        match tcp::send(write, envelope).await {
            Ok(()) => {
                if let Some(mut info) = self.context.connections.get_mut(&self.handle.pid) {
                    info.sent += 1;
                }
                true
            }
            Err(error) => {
                debug!(%error, "tunnel send failed");
                false
            }
        }
    }

    fn send(&mut self, to: IpcId, envelope: &Envelope) {
        if let Err(error) = self.sends.send(&self.context.bus, to, envelope) {
            warn!(%error, %to, "failed to send message - action: drop");
        }
    }
}
