//! Outbound connection
//!
//! A pseudo-process carrying calls, queue operations, transaction phases
//! and discovery to one peer domain. Locally it is addressed like any
//! concurrent instance; remotely it speaks the network codec over framed
//! TCP. The connection is a pure forwarder: correlations and XIDs cross
//! unchanged; only reply-address headers are rewritten for routing.
//!
//! Regular mode dials the peer; reverse mode listens and uses the accepted
//! socket the same way. Loss synthesizes `service_error` for everything in
//! flight, withdraws the remote services, and reconnects with backoff when
//! configured.

use std::collections::HashMap;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::configuration::OutboundConnection;
use crate::domain_types::{Correlation, InstanceOrder, IpcId, Pid, QueueName, ResourceId, Xid};
use crate::error::ErrorKind;
use crate::message::gateway::{
    DiscoverReply, DomainConnectRequest, PROTOCOL_VERSIONS, negotiate,
};
use crate::message::queue::{DequeueReply, EnqueueReply};
use crate::message::service::{ConcurrentAdvertise, ConcurrentService, Reply};
use crate::message::transaction::ResourceReply;
use crate::message::{Envelope, Message, MessageType};
use crate::process::{ProcessHandle, environment};
use crate::transport::bus::Inbound;
use crate::transport::{Assembler, pending, tcp};
use crate::xa::XaCode;

use super::{Bound, ConnectionInfo, Supervision, TaskContext};

/// Ceiling for the reconnect backoff
const BACKOFF_CAP: Duration = Duration::from_secs(15);

/// What an in-flight tunneled request needs for reply routing and loss
/// synthesis
#[derive(Debug)]
enum InFlight {
    Call {
        caller: ProcessHandle,
    },
    Resource {
        caller: ProcessHandle,
        trid: Xid,
        resource: ResourceId,
        message_type: MessageType,
    },
    Enqueue {
        caller: ProcessHandle,
    },
    Dequeue {
        caller: ProcessHandle,
    },
    Discover {
        requester: ProcessHandle,
    },
}

/// Dials the peer, with backoff, forever while reconnect is configured
pub fn spawn_regular(
    configuration: OutboundConnection,
    order: InstanceOrder,
    reconnect: bool,
    context: TaskContext,
) {
    tokio::spawn(async move {
        let mut attempts: u32 = 0;
        loop {
            match TcpStream::connect(&configuration.address).await {
                Ok(stream) => {
                    attempts = 0;
                    run_connection(stream, &configuration, order, &context).await;
                    if !reconnect {
                        break;
                    }
                    info!(address = %configuration.address,
                        "lost connection - action: try to reconnect");
                }
                Err(error) => {
                    debug!(address = %configuration.address, %error, "connect failed");
                    if !reconnect && attempts > 0 {
                        break;
                    }
                }
            }
            attempts = attempts.saturating_add(1);
            let backoff = Duration::from_millis(250)
                .saturating_mul(2_u32.saturating_pow(attempts.min(6)))
                .min(BACKOFF_CAP);
            tokio::time::sleep(backoff).await;
        }
    });
}

/// Listens; every accepted socket becomes an outbound connection (the peer
/// dialed through the firewall, we still route calls out over it)
pub fn spawn_reverse(
    listener: String,
    configuration: OutboundConnection,
    order: InstanceOrder,
    context: TaskContext,
) {
    tokio::spawn(async move {
        let bound = match TcpListener::bind(&listener).await {
            Ok(bound) => bound,
            Err(error) => {
                warn!(address = %listener, %error, "failed to bind reverse outbound listener");
                return;
            }
        };
        info!(address = %listener, "reverse outbound listening");
        loop {
            match bound.accept().await {
                Ok((stream, peer)) => {
                    debug!(%peer, "reverse outbound accepted");
                    let configuration = configuration.clone();
                    let context = context.clone();
                    tokio::spawn(async move {
                        run_connection(stream, &configuration, order, &context).await;
                    });
                }
                Err(error) => {
                    warn!(%error, "reverse outbound accept failed");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        }
    });
}

/// One established connection, from handshake to loss
async fn run_connection(
    mut stream: TcpStream,
    configuration: &OutboundConnection,
    order: InstanceOrder,
    context: &TaskContext,
) {
    let pid = Pid::allocate();
    let mut device = context.bus.register(IpcId::generate());
    let handle = ProcessHandle::new(pid, device.ipc());
    let mut sends = pending::Holder::new();
    let mut assembler = Assembler::new();
    let mut inflight: HashMap<Correlation, InFlight> = HashMap::new();
    let mut advertised_services: Vec<crate::domain_types::ServiceName> = Vec::new();
    let mut advertised_queues: Vec<QueueName> = Vec::new();

    // the logical-outbound side opens the conversation
    let connect = Envelope::new(Message::GatewayDomainConnectRequest(DomainConnectRequest {
        domain: crate::domain::environment::domain_identity(&context.environment),
        versions: PROTOCOL_VERSIONS.to_vec(),
    }));
    if let Err(error) = tcp::send(&mut stream, &connect).await {
        warn!(%error, "failed to open domain connection");
        context.bus.remove(handle.ipc);
        return;
    }

    let peer = loop {
        match tcp::receive(&mut stream, &mut assembler).await {
            Ok(Some(envelope)) => {
                if let Message::GatewayDomainConnectReply(reply) = envelope.message {
                    if reply.version == 0 || negotiate(&PROTOCOL_VERSIONS, &[reply.version]).is_none()
                    {
                        warn!(peer = %reply.domain.name, "no common protocol version - action: close");
                        context.bus.remove(handle.ipc);
                        return;
                    }
                    break reply;
                }
            }
            Ok(None) | Err(_) => {
                context.bus.remove(handle.ipc);
                return;
            }
        }
    };

    let (local_address, peer_address) = addresses(&stream);
    context.connections.insert(
        pid,
        ConnectionInfo {
            bound: Bound::Out,
            peer: peer_address,
            local: local_address,
            domain: Some(peer.domain.name.to_string()),
            version: Some(peer.version),
            order: u64::from(order),
            sent: 0,
            received: 0,
        },
    );
    let _ = context.supervision.send(Supervision::Established {
        pid,
        ipc: handle.ipc,
        bound: Bound::Out,
    });
    info!(peer = %peer.domain.name, version = peer.version, "outbound connection established");

    // reads are not cancellation-safe under select; a reader task feeds a
    // channel instead
    let (read_half, mut write_half) = stream.into_split();
    let mut remote = tcp::spawn_reader(read_half);

    // serve until the peer or the domain goes away
    let clean = serve(
        &mut write_half,
        &mut remote,
        &mut device,
        handle,
        order,
        configuration,
        context,
        &mut sends,
        &mut inflight,
        &mut advertised_services,
        &mut advertised_queues,
    )
    .await;

    // loss handling: everything in flight gets a synthesized error, the
    // remote services disappear from the registry
    for (correlation, entry) in inflight.drain() {
        synthesize_loss_reply(&context.bus, &mut sends, correlation, entry);
    }
    withdraw(context, handle, &mut sends, &advertised_services, &advertised_queues);
    sends.flush(&context.bus);

    context.bus.remove(handle.ipc);
    let _ = context.supervision.send(Supervision::Closed { pid });
    if clean {
        info!(peer = %peer.domain.name, "outbound connection closed");
    } else {
        warn!(peer = %peer.domain.name, "outbound connection lost");
    }
}

#[allow(clippy::too_many_arguments)]
async fn serve(
    write: &mut tokio::net::tcp::OwnedWriteHalf,
    remote: &mut tokio::sync::mpsc::Receiver<tcp::ReaderEvent>,
    device: &mut Inbound,
    handle: ProcessHandle,
    order: InstanceOrder,
    configuration: &OutboundConnection,
    context: &TaskContext,
    sends: &mut pending::Holder,
    inflight: &mut HashMap<Correlation, InFlight>,
    advertised_services: &mut Vec<crate::domain_types::ServiceName>,
    advertised_queues: &mut Vec<QueueName>,
) -> bool {
    loop {
        tokio::select! {
            local = device.next() => {
                let Some(envelope) = local else { return true };
                match tunnel_local(write, handle, configuration, context, sends, inflight, envelope).await {
                    Ok(true) => {}
                    Ok(false) => return true,
                    Err(()) => return false,
                }
            }
            event = remote.recv() => {
                match event {
                    Some(tcp::ReaderEvent::Message(envelope)) => {
                        route_remote(
                            handle, order, configuration, context, sends, inflight,
                            advertised_services, advertised_queues, envelope,
                        );
                        if let Some(mut info) = context.connections.get_mut(&handle.pid) {
                            info.received += 1;
                        }
                    }
                    Some(tcp::ReaderEvent::Closed) | None => return true,
                    Some(tcp::ReaderEvent::Failed(error)) => {
                        debug!(%error, "receive failed");
                        return false;
                    }
                }
            }
        }
        sends.flush(&context.bus);
    }
}

/// A local message for the peer: remember the caller, rewrite the reply
/// address, tunnel. `Ok(false)` means an orderly local shutdown.
async fn tunnel_local(
    stream: &mut tokio::net::tcp::OwnedWriteHalf,
    handle: ProcessHandle,
    configuration: &OutboundConnection,
    context: &TaskContext,
    sends: &mut pending::Holder,
    inflight: &mut HashMap<Correlation, InFlight>,
    envelope: Envelope,
) -> Result<bool, ()> {
    let outgoing = match envelope.message.clone() {
        Message::ServiceCall(mut call) => {
            // route pinning: a whitelisted connection carries only its listed
            // services
            if !configuration.services.is_empty() && !configuration.services.contains(&call.service)
            {
                warn!(service = %call.service, "service not routed over this connection - action: reject");
                let reply = envelope.reverse(Message::ServiceReply(Reply::error(ErrorKind::NoEntry)));
                let _ = sends.send(&context.bus, call.process.ipc, &reply);
                return Ok(true);
            }
            if let Some(trid) = call.trid {
                involve(context, handle, trid, sends);
            }
            if !call.no_reply {
                inflight.insert(envelope.correlation, InFlight::Call { caller: call.process });
            }
            call.process = handle;
            envelope.reverse(Message::ServiceCall(call))
        }
        Message::TransactionResourcePrepareRequest(mut request)
        | Message::TransactionResourceCommitRequest(mut request)
        | Message::TransactionResourceRollbackRequest(mut request) => {
            inflight.insert(
                envelope.correlation,
                InFlight::Resource {
                    caller: request.process,
                    trid: request.trid,
                    resource: request.resource,
                    message_type: envelope.message.message_type(),
                },
            );
            request.process = handle;
            let message = match envelope.message.message_type() {
                MessageType::TransactionResourcePrepareRequest => {
                    Message::TransactionResourcePrepareRequest(request)
                }
                MessageType::TransactionResourceCommitRequest => {
                    Message::TransactionResourceCommitRequest(request)
                }
                _ => Message::TransactionResourceRollbackRequest(request),
            };
            envelope.reverse(message)
        }
        Message::QueueEnqueueRequest(mut request) => {
            if let Some(trid) = request.trid {
                involve(context, handle, trid, sends);
            }
            inflight.insert(envelope.correlation, InFlight::Enqueue { caller: request.process });
            request.process = handle;
            envelope.reverse(Message::QueueEnqueueRequest(request))
        }
        Message::QueueDequeueRequest(mut request) => {
            if let Some(trid) = request.trid {
                involve(context, handle, trid, sends);
            }
            inflight.insert(envelope.correlation, InFlight::Dequeue { caller: request.process });
            request.process = handle;
            envelope.reverse(Message::QueueDequeueRequest(request))
        }
        Message::GatewayDomainDiscoverRequest(mut request) => {
            let requester = request.process.unwrap_or(handle);
            // filter by the whitelists before asking the peer
            if !configuration.services.is_empty() {
                request
                    .services
                    .retain(|name| configuration.services.contains(name));
            }
            if !configuration.queues.is_empty() {
                request.queues.retain(|name| configuration.queues.contains(name));
            }
            if request.services.is_empty() && request.queues.is_empty() {
                // nothing this connection may carry: answer empty locally
                let reply = envelope.reverse(Message::GatewayDomainDiscoverReply(DiscoverReply {
                    domain: crate::domain::environment::domain_identity(&context.environment),
                    services: Vec::new(),
                    queues: Vec::new(),
                }));
                let _ = sends.send(&context.bus, requester.ipc, &reply);
                return Ok(true);
            }
            inflight.insert(envelope.correlation, InFlight::Discover { requester });
            request.process = Some(handle);
            envelope.reverse(Message::GatewayDomainDiscoverRequest(request))
        }
        Message::ShutdownRequest { .. } => return Ok(false),
        Message::Poke => return Ok(true),
        other => {
            debug!(message_type = %other.message_type(), "unhandled local message - action: discard");
            return Ok(true);
        }
    };

    match tcp::send(stream, &outgoing).await {
        Ok(()) => {
            if let Some(mut info) = context.connections.get_mut(&handle.pid) {
                info.sent += 1;
            }
            Ok(true)
        }
        Err(error) => {
            debug!(%error, "send failed");
            // the tunneled request is in flight; loss handling answers it
            Err(())
        }
    }
}

/// A message from the peer: a reply to something in flight, or an
/// unsolicited advertisement
#[allow(clippy::too_many_arguments)]
fn route_remote(
    handle: ProcessHandle,
    order: InstanceOrder,
    configuration: &OutboundConnection,
    context: &TaskContext,
    sends: &mut pending::Holder,
    inflight: &mut HashMap<Correlation, InFlight>,
    advertised_services: &mut Vec<crate::domain_types::ServiceName>,
    advertised_queues: &mut Vec<QueueName>,
    envelope: Envelope,
) {
    match &envelope.message {
        Message::GatewayDomainDiscoverReply(reply) => {
            advertise_discovered(
                handle,
                order,
                configuration,
                context,
                sends,
                reply,
                advertised_services,
                advertised_queues,
            );
            if let Some(InFlight::Discover { requester }) = inflight.remove(&envelope.correlation)
            {
                let forwarded = Envelope {
                    correlation: envelope.correlation,
                    execution: envelope.execution,
                    message: envelope.message.clone(),
                };
                let _ = sends.send(&context.bus, requester.ipc, &forwarded);
            }
        }
        Message::GatewayDomainAdvertise(advertise) => {
            let as_reply = DiscoverReply {
                domain: advertise.domain.clone(),
                services: advertise.services.clone(),
                queues: advertise.queues.clone(),
            };
            advertise_discovered(
                handle,
                order,
                configuration,
                context,
                sends,
                &as_reply,
                advertised_services,
                advertised_queues,
            );
        }
        _ => {
            let Some(entry) = inflight.remove(&envelope.correlation) else {
                debug!(message_type = %envelope.message.message_type(),
                    "remote message without in-flight entry - action: discard");
                return;
            };
            let caller = match entry {
                InFlight::Call { caller }
                | InFlight::Resource { caller, .. }
                | InFlight::Enqueue { caller }
                | InFlight::Dequeue { caller }
                | InFlight::Discover { requester: caller } => caller,
            };
            let _ = sends.send(&context.bus, caller.ipc, &envelope);
        }
    }
}

/// Remote claims become local concurrent instances, one hop further away
#[allow(clippy::too_many_arguments)]
fn advertise_discovered(
    handle: ProcessHandle,
    order: InstanceOrder,
    configuration: &OutboundConnection,
    context: &TaskContext,
    sends: &mut pending::Holder,
    reply: &DiscoverReply,
    advertised_services: &mut Vec<crate::domain_types::ServiceName>,
    advertised_queues: &mut Vec<QueueName>,
) {
    let services: Vec<ConcurrentService> = reply
        .services
        .iter()
        .filter(|discovered| {
            configuration.services.is_empty()
                || configuration.services.contains(&discovered.service.name)
        })
        .map(|discovered| ConcurrentService {
            service: discovered.service.clone(),
            hops: discovered.hops.increment(),
        })
        .collect();
    if !services.is_empty() {
        if let Some(service_manager) = context.environment.handle(environment::SERVICE_MANAGER) {
            for discovered in &services {
                if !advertised_services.contains(&discovered.service.name) {
                    advertised_services.push(discovered.service.name.clone());
                }
            }
            let advertise = Envelope::new(Message::ServiceConcurrentAdvertise(
                ConcurrentAdvertise {
                    process: handle,
                    order,
                    add: services,
                    remove: Vec::new(),
                    reset: false,
                },
            ));
            let _ = sends.send(&context.bus, service_manager.ipc, &advertise);
        }
    }

    let queues: Vec<QueueName> = reply
        .queues
        .iter()
        .filter(|name| configuration.queues.is_empty() || configuration.queues.contains(*name))
        .cloned()
        .collect();
    if !queues.is_empty() {
        if let Some(queue_manager) = context.environment.handle(environment::QUEUE_MANAGER) {
            for name in &queues {
                if !advertised_queues.contains(name) {
                    advertised_queues.push(name.clone());
                }
            }
            let advertise = Envelope::new(Message::QueueAdvertise(
                crate::message::queue::QueueAdvertise {
                    process: handle,
                    add: queues,
                    remove: Vec::new(),
                    reset: false,
                },
            ));
            let _ = sends.send(&context.bus, queue_manager.ipc, &advertise);
        }
    }
}

/// The connection joined a transaction: the local coordinator will drive
/// this connection as an external resource
fn involve(context: &TaskContext, handle: ProcessHandle, trid: Xid, sends: &mut pending::Holder) {
    let Some(manager) = context.environment.handle(environment::TRANSACTION_MANAGER) else {
        warn!("transaction manager not published - transactional call crosses unmanaged");
        return;
    };
    let involved = Envelope::new(Message::TransactionExternalResourceInvolved(
        crate::message::transaction::ExternalResourceInvolved {
            process: handle,
            trid,
        },
    ));
    let _ = sends.send(&context.bus, manager.ipc, &involved);
}

/// Loss: every in-flight request gets an error reply so callers progress
fn synthesize_loss_reply(
    bus: &crate::transport::bus::Bus,
    sends: &mut pending::Holder,
    correlation: Correlation,
    entry: InFlight,
) {
    let (to, message) = match entry {
        InFlight::Call { caller } => (
            caller,
            Message::ServiceReply(Reply::error(ErrorKind::ServiceError)),
        ),
        InFlight::Resource {
            caller,
            trid,
            resource,
            message_type,
        } => {
            let reply = ResourceReply {
                process: caller,
                trid,
                resource,
                state: XaCode::ResourceFailure,
            };
            let message = match message_type {
                MessageType::TransactionResourcePrepareRequest => {
                    Message::TransactionResourcePrepareReply(reply)
                }
                MessageType::TransactionResourceCommitRequest => {
                    Message::TransactionResourceCommitReply(reply)
                }
                _ => Message::TransactionResourceRollbackReply(reply),
            };
            (caller, message)
        }
        InFlight::Enqueue { caller } => (
            caller,
            Message::QueueEnqueueReply(EnqueueReply {
                id: None,
                code: Some(ErrorKind::CommunicationUnavailable),
            }),
        ),
        InFlight::Dequeue { caller } => (
            caller,
            Message::QueueDequeueReply(DequeueReply {
                message: None,
                code: Some(ErrorKind::CommunicationUnavailable),
            }),
        ),
        InFlight::Discover { requester } => (
            requester,
            Message::GatewayDomainDiscoverReply(DiscoverReply {
                domain: crate::message::gateway::Identity {
                    id: crate::domain_types::DomainId::generate(),
                    name: crate::domain_types::DomainName::try_new("lost")
                        .unwrap_or_else(|_| unreachable!("static name is valid")),
                },
                services: Vec::new(),
                queues: Vec::new(),
            }),
        ),
    };
    let envelope = Envelope {
        correlation,
        execution: crate::domain_types::Execution::generate(),
        message,
    };
    let _ = sends.send(bus, to.ipc, &envelope);
}

/// Withdraws everything this connection advertised
fn withdraw(
    context: &TaskContext,
    handle: ProcessHandle,
    sends: &mut pending::Holder,
    advertised_services: &[crate::domain_types::ServiceName],
    advertised_queues: &[QueueName],
) {
    if !advertised_services.is_empty() {
        if let Some(service_manager) = context.environment.handle(environment::SERVICE_MANAGER) {
            let reset = Envelope::new(Message::ServiceConcurrentAdvertise(ConcurrentAdvertise {
                process: handle,
                order: InstanceOrder::default(),
                add: Vec::new(),
                remove: Vec::new(),
                reset: true,
            }));
            let _ = sends.send(&context.bus, service_manager.ipc, &reset);
        }
    }
    if !advertised_queues.is_empty() {
        if let Some(queue_manager) = context.environment.handle(environment::QUEUE_MANAGER) {
            let reset = Envelope::new(Message::QueueAdvertise(
                crate::message::queue::QueueAdvertise {
                    process: handle,
                    add: Vec::new(),
                    remove: Vec::new(),
                    reset: true,
                },
            ));
            let _ = sends.send(&context.bus, queue_manager.ipc, &reset);
        }
    }
}

fn addresses(stream: &TcpStream) -> (String, String) {
    let local = stream
        .local_addr()
        .map(|address| address.to_string())
        .unwrap_or_default();
    let peer = stream
        .peer_addr()
        .map(|address| address.to_string())
        .unwrap_or_default();
    (local, peer)
}
