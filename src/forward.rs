//! Forward cache
//!
//! Fire-and-forget calls resolve to this singleton when every instance of
//! the target service is busy. The cache accepts the call, runs its own
//! lookup, and re-dispatches once an instance frees up, letting the caller
//! proceed without waiting. With concurrent-only remote instances the
//! cache proxies the call over the gateway route itself. Nothing persists:
//! the cache trades durability for caller progress, which is the
//! fire-and-forget contract.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::domain::spawn::InstanceContext;
use crate::domain_types::{Correlation, IpcId};
use crate::error::Result;
use crate::message::domain::{ConnectDirective, ProcessConnectRequest};
use crate::message::service::{Call, LookupContext, LookupRequest, LookupState};
use crate::message::{Envelope, Message};
use crate::process::{ProcessHandle, environment, identity};
use crate::transport::pending;

/// Runs the forward cache as a domain instance
///
/// # Errors
///
/// Fails only on construction problems.
pub async fn run(context: InstanceContext) -> Result<()> {
    let mut inbound = context.bus.register(IpcId::generate());
    let handle = ProcessHandle::new(context.pid, inbound.ipc());
    let mut sends = pending::Holder::new();

    // in-flight re-dispatches by lookup correlation
    let mut pending_calls: HashMap<Correlation, Call> = HashMap::new();

    let connect = Envelope::new(Message::DomainProcessConnectRequest(ProcessConnectRequest {
        process: handle,
        identity: Some(identity::FORWARD_CACHE),
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
    info!("forward cache on-line");

    while let Some(envelope) = inbound.next().await {
        match envelope.message.clone() {
            Message::ServiceCall(call) => {
                // a call to forward: start our own lookup and remember it
                let Some(service_manager) =
                    context.environment.handle(environment::SERVICE_MANAGER)
                else {
                    warn!("service manager not published - action: drop call");
                    continue;
                };
                let lookup = Envelope::new(Message::ServiceLookupRequest(LookupRequest {
                    process: handle,
                    requested: call.service.clone(),
                    context: LookupContext::Forward,
                    deadline: call.deadline,
                }));
                pending_calls.insert(lookup.correlation, call);
                if let Err(error) = sends.send(&context.bus, service_manager.ipc, &lookup) {
                    warn!(%error, "failed to send forward lookup");
                }
            }
            Message::ServiceLookupReply(reply) => match reply.state {
                LookupState::Idle => {
                    let Some(call) = pending_calls.remove(&envelope.correlation) else {
                        debug!("lookup reply without pending call - action: discard");
                        continue;
                    };
                    let Some(target) = reply.process else {
                        warn!(service = %reply.service.name, "idle reply without instance - action: drop");
                        continue;
                    };
                    // re-dispatch under the lookup correlation so the
                    // acknowledgement correlates with the reservation
                    let dispatch = envelope.reverse(Message::ServiceCall(call));
                    if let Err(error) = sends.send(&context.bus, target.ipc, &dispatch) {
                        warn!(%error, "failed to re-dispatch call");
                    }
                }
                LookupState::Busy => {
                    // a second reply follows; the call stays parked
                }
                LookupState::Absent => {
                    if let Some(call) = pending_calls.remove(&envelope.correlation) {
                        warn!(service = %call.service, "service absent - action: drop forwarded call");
                    }
                }
            },
            Message::ShutdownRequest { .. } => break,
            Message::Poke => {}
            other => {
                debug!(message_type = %other.message_type(), "unhandled message - action: discard");
            }
        }
        sends.flush(&context.bus);
    }

    context.bus.remove(handle.ipc);
    info!("forward cache off-line");
    Ok(())
}
