//! Sequential server instance
//!
//! A single-threaded XATMI-style server: advertises its services, processes
//! exactly one call at a time, replies to the caller and acknowledges to
//! the service manager so the reservation is released and pending lookups
//! drain. Service implementations are async closures; a slow implementation
//! keeps the instance busy, which is the sequential contract.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::SystemTime;

use tracing::{debug, info, instrument, warn};

use crate::domain::Environment;
use crate::domain::spawn::InstanceContext;
use crate::domain_types::{IpcId, ResourceId, Xid};
use crate::error::{ErrorKind, Result};
use crate::message::domain::{ConnectDirective, ProcessConnectRequest};
use crate::message::service::{Ack, Advertise, Call, Metric, Reply, Service};
use crate::message::transaction::ResourceInvolved;
use crate::message::{Envelope, Message};
use crate::process::{ProcessHandle, environment};
use crate::transport::bus::Bus;
use crate::transport::pending;

/// What a service implementation returns
pub type CallOutcome = std::result::Result<Vec<u8>, ErrorKind>;

/// One invocation of a service
pub struct Invocation {
    /// The called service
    pub service: Service,
    /// Call payload
    pub payload: Vec<u8>,
    /// Ambient transaction, if the call is transactional
    pub trid: Option<Xid>,
    /// Access to the domain for resource involvement
    pub api: Api,
}

/// Handle a service implementation uses to talk to the domain
#[derive(Clone)]
pub struct Api {
    handle: ProcessHandle,
    bus: Arc<Bus>,
    environment: Arc<Environment>,
}

impl Api {
    /// Reports resources as joined in a transaction, the way a resource
    /// framework would when the implementation touches them
    pub fn involve(&self, trid: Xid, resources: &[ResourceId]) {
        let Some(manager) = self.environment.handle(environment::TRANSACTION_MANAGER) else {
            warn!("transaction manager not published - involvement dropped");
            return;
        };
        let involved = Envelope::new(Message::TransactionResourceInvolved(ResourceInvolved {
            process: self.handle,
            trid,
            resources: resources.to_vec(),
            deadline: None,
        }));
        let mut sends = pending::Holder::new();
        if let Err(error) = sends.send(&self.bus, manager.ipc, &involved) {
            warn!(%error, "failed to report involvement");
        }
    }
}

/// An async service implementation
pub type Implementation =
    Arc<dyn Fn(Invocation) -> Pin<Box<dyn Future<Output = CallOutcome> + Send>> + Send + Sync>;

/// A service with its implementation
#[derive(Clone)]
pub struct Entry {
    /// Advertised properties
    pub service: Service,
    /// The implementation
    pub implementation: Implementation,
}

impl Entry {
    /// Builds an entry from a service and an async closure
    #[must_use]
    pub fn new<F, Fut>(service: Service, implementation: F) -> Self
    where
        F: Fn(Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallOutcome> + Send + 'static,
    {
        Self {
            service,
            implementation: Arc::new(move |invocation| Box::pin(implementation(invocation))),
        }
    }
}

/// Runs a sequential server instance hosting the given services
///
/// # Errors
///
/// Fails only on construction problems.
#[instrument(skip_all, fields(alias = %context.alias, pid = %context.pid))]
pub async fn run(context: InstanceContext, services: Vec<Entry>) -> Result<()> {
    let mut inbound = context.bus.register(IpcId::generate());
    let handle = ProcessHandle::new(context.pid, inbound.ipc());
    let mut sends = pending::Holder::new();

    // join the domain
    let connect = Envelope::new(Message::DomainProcessConnectRequest(ProcessConnectRequest {
        process: handle,
        identity: None,
        path: context.alias.to_string(),
    }));
    sends.send(&context.bus, context.domain_manager, &connect)?;
    loop {
        match inbound.next().await {
            Some(envelope) => {
                if let Message::DomainProcessConnectReply(reply) = envelope.message {
                    match reply.directive {
                        ConnectDirective::Start => break,
                        ConnectDirective::Singleton | ConnectDirective::Shutdown => return Ok(()),
                    }
                }
            }
            None => return Ok(()),
        }
    }

    // advertise
    let service_manager = context.environment.handle(environment::SERVICE_MANAGER);
    match service_manager {
        Some(manager) => {
            let advertise = Envelope::new(Message::ServiceAdvertise(Advertise {
                process: handle,
                add: services.iter().map(|entry| entry.service.clone()).collect(),
                remove: Vec::new(),
                reset: false,
            }));
            sends.send(&context.bus, manager.ipc, &advertise)?;
        }
        None => warn!("service manager not published - nothing advertised"),
    }

    let api = Api {
        handle,
        bus: Arc::clone(&context.bus),
        environment: Arc::clone(&context.environment),
    };
    info!(services = services.len(), "server instance on-line");

    while let Some(envelope) = inbound.next().await {
        match envelope.message.clone() {
            Message::ServiceCall(call) => {
                handle_call(&envelope, call, &services, &api, &mut sends, &context.bus).await;
            }
            Message::ServerPingRequest(requester) => {
                let reply = envelope.reverse(Message::ServerPingReply(handle));
                let _ = sends.send(&context.bus, requester.ipc, &reply);
            }
            Message::ShutdownRequest { .. } => break,
            Message::Poke => {}
            other => {
                debug!(message_type = %other.message_type(), "unhandled message - action: discard");
            }
        }
        sends.flush(&context.bus);
    }

    // withdraw before leaving
    if let Some(manager) = service_manager {
        let reset = Envelope::new(Message::ServiceAdvertise(Advertise::reset(handle)));
        let _ = sends.send(&context.bus, manager.ipc, &reset);
        sends.flush(&context.bus);
    }
    context.bus.remove(handle.ipc);
    info!("server instance off-line");
    Ok(())
}

async fn handle_call(
    envelope: &Envelope,
    call: Call,
    services: &[Entry],
    api: &Api,
    sends: &mut pending::Holder,
    bus: &Bus,
) {
    let start = SystemTime::now();
    let entry = services
        .iter()
        .find(|entry| entry.service.name == call.service);

    let outcome = match entry {
        Some(entry) => {
            let invocation = Invocation {
                service: entry.service.clone(),
                payload: call.payload.clone(),
                trid: call.trid,
                api: api.clone(),
            };
            (entry.implementation)(invocation).await
        }
        None => Err(ErrorKind::NoEntry),
    };
    let end = SystemTime::now();

    let code = outcome.as_ref().err().copied();
    if !call.no_reply {
        let reply = envelope.reverse(Message::ServiceReply(match outcome {
            Ok(payload) => Reply {
                code: None,
                trid: call.trid,
                payload,
            },
            Err(kind) => Reply::error(kind),
        }));
        if let Err(error) = sends.send(bus, call.process.ipc, &reply) {
            warn!(%error, "failed to send service reply");
        }
    }

    // release the reservation
    if let Some(manager) = api.environment.handle(environment::SERVICE_MANAGER) {
        let ack = Envelope::new(Message::ServiceAck(Ack {
            process: api.handle,
            metric: Metric {
                service: call.service,
                start,
                end,
                code,
            },
        }));
        if let Err(error) = sends.send(bus, manager.ipc, &ack) {
            warn!(%error, "failed to acknowledge call");
        }
    }
}
