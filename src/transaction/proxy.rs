//! Resource proxy instance
//!
//! Drives one XA resource on behalf of the transaction manager. The actual
//! resource-manager driver is opaque; this instance obeys the XA state
//! machine: it answers prepare/commit/rollback requests with XA codes from
//! a pluggable behavior, records the phases it observes, and stays
//! single-threaded (one phase request at a time, which is what makes the
//! manager's idle/busy accounting sound).

use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::domain_types::{IpcId, ResourceId, Xid};
use crate::error::Result;
use crate::message::domain::{ConnectDirective, ProcessConnectRequest};
use crate::message::transaction::{ResourceProxyConnect, ResourceReply, ResourceRequest};
use crate::message::{Envelope, Message};
use crate::process::{ProcessHandle, environment};
use crate::transport::pending;
use crate::xa::XaCode;

use crate::domain::spawn::InstanceContext;

/// A 2PC phase as observed by a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Vote request
    Prepare,
    /// Commit decision
    Commit,
    /// Rollback decision
    Rollback,
}

/// One observed phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    /// The transaction the phase belonged to
    pub trid: Xid,
    /// Which phase
    pub phase: Phase,
}

/// Observable record of the phases a resource saw, in order
#[derive(Debug, Default)]
pub struct Journal {
    events: Mutex<Vec<Observation>>,
}

impl Journal {
    /// Creates an empty journal
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn record(&self, trid: Xid, phase: Phase) {
        if let Ok(mut events) = self.events.lock() {
            events.push(Observation { trid, phase });
        }
    }

    /// All observations so far
    #[must_use]
    pub fn observations(&self) -> Vec<Observation> {
        self.events.lock().map(|events| events.clone()).unwrap_or_default()
    }

    /// Observations for one transaction
    #[must_use]
    pub fn phases(&self, trid: Xid) -> Vec<Phase> {
        self.observations()
            .into_iter()
            .filter(|observation| observation.trid == trid)
            .map(|observation| observation.phase)
            .collect()
    }
}

/// What a proxy answers per phase; the default votes and acts `XA_OK`
pub trait Behavior: Send + Sync + 'static {
    /// Vote on prepare
    fn prepare(&self, trid: Xid) -> XaCode {
        let _ = trid;
        XaCode::Ok
    }
    /// Act on commit
    fn commit(&self, trid: Xid) -> XaCode {
        let _ = trid;
        XaCode::Ok
    }
    /// Act on rollback
    fn rollback(&self, trid: Xid) -> XaCode {
        let _ = trid;
        XaCode::Ok
    }
}

/// The always-OK resource
#[derive(Debug, Default, Clone, Copy)]
pub struct WellBehaved;

impl Behavior for WellBehaved {}

/// Runs a resource proxy instance
///
/// # Errors
///
/// Fails only on construction problems.
pub async fn run(
    context: InstanceContext,
    resource: ResourceId,
    behavior: Arc<dyn Behavior>,
    journal: Option<Arc<Journal>>,
) -> Result<()> {
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

    // announce to the transaction manager
    if let Some(manager) = context.environment.handle(environment::TRANSACTION_MANAGER) {
        let announce = Envelope::new(Message::TransactionResourceProxyConnect(
            ResourceProxyConnect {
                process: handle,
                resource,
            },
        ));
        sends.send(&context.bus, manager.ipc, &announce)?;
    }
    info!(%resource, pid = %handle.pid, "resource proxy connected");

    while let Some(envelope) = inbound.next().await {
        let reply = match &envelope.message {
            Message::TransactionResourcePrepareRequest(request) => {
                Some(phase_reply(request, handle, Phase::Prepare, &*behavior, journal.as_deref()))
            }
            Message::TransactionResourceCommitRequest(request) => {
                Some(phase_reply(request, handle, Phase::Commit, &*behavior, journal.as_deref()))
            }
            Message::TransactionResourceRollbackRequest(request) => {
                Some(phase_reply(request, handle, Phase::Rollback, &*behavior, journal.as_deref()))
            }
            Message::ShutdownRequest { .. } => break,
            other => {
                debug!(message_type = %other.message_type(), "unhandled message - action: discard");
                None
            }
        };

        if let Some((to, message)) = reply {
            let response = envelope.reverse(message);
            sends.send(&context.bus, to, &response)?;
        }
        sends.flush(&context.bus);
    }

    context.bus.remove(handle.ipc);
    Ok(())
}

fn phase_reply(
    request: &ResourceRequest,
    handle: ProcessHandle,
    phase: Phase,
    behavior: &dyn Behavior,
    journal: Option<&Journal>,
) -> (crate::domain_types::IpcId, Message) {
    if let Some(journal) = journal {
        journal.record(request.trid, phase);
    }
    let state = match phase {
        Phase::Prepare => behavior.prepare(request.trid),
        Phase::Commit => behavior.commit(request.trid),
        Phase::Rollback => behavior.rollback(request.trid),
    };
    let message = match phase {
        Phase::Prepare => Message::TransactionResourcePrepareReply(ResourceReply {
            process: handle,
            trid: request.trid,
            resource: request.resource,
            state,
        }),
        Phase::Commit => Message::TransactionResourceCommitReply(ResourceReply {
            process: handle,
            trid: request.trid,
            resource: request.resource,
            state,
        }),
        Phase::Rollback => Message::TransactionResourceRollbackReply(ResourceReply {
            process: handle,
            trid: request.trid,
            resource: request.resource,
            state,
        }),
    };
    (request.process.ipc, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn journal_keeps_order_per_transaction() {
        let journal = Journal::new();
        let trid = Xid::generate();
        let other = Xid::generate();
        journal.record(trid, Phase::Prepare);
        journal.record(other, Phase::Prepare);
        journal.record(trid, Phase::Commit);

        assert_eq!(journal.phases(trid), vec![Phase::Prepare, Phase::Commit]);
        assert_eq!(journal.phases(other), vec![Phase::Prepare]);
    }

    #[test]
    fn default_behavior_votes_ok() {
        let behavior = WellBehaved;
        let trid = Xid::generate();
        assert_eq!(behavior.prepare(trid), XaCode::Ok);
        assert_eq!(behavior.commit(trid), XaCode::Ok);
        assert_eq!(behavior.rollback(trid), XaCode::Ok);
    }
}
