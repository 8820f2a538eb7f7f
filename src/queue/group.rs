//! Queue group instance
//!
//! Hosts a set of persistent queues over one exclusively owned store. Every
//! operation joins the ambient transaction: the group registers itself with
//! the transaction manager as an external resource and answers the pinned
//! resource messages like any other participant. Blocking dequeues park as
//! FIFO waiters, woken by enqueues, commits, and retry delays elapsing.

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::time::Instant;

use tracing::{debug, info, instrument, warn};

use crate::domain_types::{Correlation, Execution, IpcId, QueueName, Xid};
use crate::error::{ErrorKind, Result};
use crate::message::domain::{ConnectDirective, ProcessConnectRequest};
use crate::message::queue::{
    ClearReply, DequeueForgetReply, DequeueReply, EnqueueReply, GroupConnectReply,
    GroupConnectRequest, InformationReply, PeekReply, QueueAdvertise, RestoreReply,
};
use crate::message::transaction::{ExternalResourceInvolved, ResourceReply};
use crate::message::{Envelope, Message};
use crate::process::{ProcessHandle, environment};
use crate::transport::bus::Inbound;
use crate::transport::pending;
use crate::xa::XaCode;

use super::store::Store;
use crate::domain::spawn::InstanceContext;

/// A parked blocking dequeue
#[derive(Debug)]
struct Waiter {
    queue: QueueName,
    reply_to: ProcessHandle,
    correlation: Correlation,
    execution: Execution,
    trid: Option<Xid>,
    properties: Option<String>,
}

/// Runs a queue group instance
///
/// # Errors
///
/// Fails when the store cannot be opened; fatal, observed by the domain
/// manager.
pub async fn run(context: InstanceContext, group: String, store_path: Option<PathBuf>) -> Result<()> {
    let inbound = context.bus.register(IpcId::generate());
    let handle = ProcessHandle::new(context.pid, inbound.ipc());

    let store = match &store_path {
        Some(path) => Store::open(path).await?,
        None => Store::in_memory().await?,
    };

    let mut worker = Group {
        handle,
        context,
        inbound,
        store,
        group,
        queues: Vec::new(),
        waiters: VecDeque::new(),
        involved: HashSet::new(),
        pending_sends: pending::Holder::new(),
        next_wake: None,
    };

    if !worker.connect().await {
        return Ok(());
    }
    worker.run().await
}

struct Group {
    handle: ProcessHandle,
    context: InstanceContext,
    inbound: Inbound,
    store: Store,
    group: String,
    queues: Vec<QueueName>,
    waiters: VecDeque<Waiter>,
    /// transactions this group has reported itself involved in
    involved: HashSet<Xid>,
    pending_sends: pending::Holder,
    next_wake: Option<Instant>,
}

impl Group {
    async fn connect(&mut self) -> bool {
        // join the domain
        let connect = Envelope::new(Message::DomainProcessConnectRequest(ProcessConnectRequest {
            process: self.handle,
            identity: None,
            path: self.context.alias.to_string(),
        }));
        self.send(self.context.domain_manager, &connect);
        loop {
            match self.inbound.next().await {
                Some(envelope) => {
                    if let Message::DomainProcessConnectReply(reply) = envelope.message {
                        match reply.directive {
                            ConnectDirective::Start => break,
                            ConnectDirective::Singleton | ConnectDirective::Shutdown => {
                                return false;
                            }
                        }
                    }
                }
                None => return false,
            }
        }

        // fetch our configured queues from the queue manager
        let Some(manager) = self.context.environment.handle(environment::QUEUE_MANAGER) else {
            warn!("queue manager not published - action: exit");
            return false;
        };
        let request = Envelope::new(Message::QueueGroupConnectRequest(GroupConnectRequest {
            process: self.handle,
            name: self.group.clone(),
        }));
        let correlation = request.correlation;
        self.send(manager.ipc, &request);

        let configured: GroupConnectReply = loop {
            match self.inbound.next().await {
                Some(envelope) if envelope.correlation == correlation => {
                    if let Message::QueueGroupConnectReply(reply) = envelope.message {
                        break reply;
                    }
                }
                Some(_) => {}
                None => return false,
            }
        };

        for queue in &configured.queues {
            if let Err(failure) = self
                .store
                .create_queue(&queue.name, queue.retry_count, queue.retry_delay)
                .await
            {
                warn!(queue = %queue.name, error = %failure, "failed to create queue");
                continue;
            }
            self.queues.push(queue.name.clone());
        }

        // make the queues routable
        let advertise = Envelope::new(Message::QueueAdvertise(QueueAdvertise {
            process: self.handle,
            add: self.queues.clone(),
            remove: Vec::new(),
            reset: false,
        }));
        self.send(manager.ipc, &advertise);
        info!(group = %self.group, queues = self.queues.len(), "queue group on-line");
        true
    }

    async fn run(mut self) -> Result<()> {
        loop {
            let envelope = tokio::select! {
                envelope = self.inbound.next() => envelope,
                () = sleep_until_or_forever(self.next_wake) => {
                    self.wake_waiters().await;
                    continue;
                }
            };
            let Some(envelope) = envelope else { break };

            if !self.dispatch(envelope).await {
                break;
            }
            self.pending_sends.flush(&self.context.bus);
        }

        // withdraw the queues before going down
        if let Some(manager) = self.context.environment.handle(environment::QUEUE_MANAGER) {
            let reset = Envelope::new(Message::QueueAdvertise(QueueAdvertise {
                process: self.handle,
                add: Vec::new(),
                remove: Vec::new(),
                reset: true,
            }));
            self.send(manager.ipc, &reset);
            self.pending_sends.flush(&self.context.bus);
        }
        self.context.bus.remove(self.handle.ipc);
        info!(group = %self.group, "queue group off-line");
        Ok(())
    }

    async fn dispatch(&mut self, envelope: Envelope) -> bool {
        match envelope.message.clone() {
            Message::QueueEnqueueRequest(request) => {
                if let Some(trid) = request.trid {
                    self.involve(trid);
                }
                let (id, code) = match self
                    .store
                    .enqueue(&request.name, request.trid, &request.message)
                    .await
                {
                    Ok(Some(id)) => (Some(id), None),
                    Ok(None) => (None, Some(ErrorKind::Absent)),
                    Err(failure) => {
                        warn!(error = %failure, "enqueue failed");
                        (None, Some(ErrorKind::InvalidSemantics))
                    }
                };
                let reply = envelope.reverse(Message::QueueEnqueueReply(EnqueueReply { id, code }));
                self.send(request.process.ipc, &reply);

                // an auto-committed enqueue makes the message deliverable now
                if request.trid.is_none() {
                    self.wake_waiters().await;
                }
            }
            Message::QueueDequeueRequest(request) => {
                if let Some(trid) = request.trid {
                    self.involve(trid);
                }
                let dequeued = self
                    .store
                    .dequeue(&request.name, request.trid, request.properties.as_deref())
                    .await;
                match dequeued {
                    Ok(Some(message)) => {
                        let reply = envelope.reverse(Message::QueueDequeueReply(DequeueReply {
                            message: Some(message),
                            code: None,
                        }));
                        self.send(request.process.ipc, &reply);
                    }
                    Ok(None) if request.block => {
                        self.waiters.push_back(Waiter {
                            queue: request.name.clone(),
                            reply_to: request.process,
                            correlation: envelope.correlation,
                            execution: envelope.execution,
                            trid: request.trid,
                            properties: request.properties.clone(),
                        });
                        self.arm_wake().await;
                    }
                    Ok(None) => {
                        let reply = envelope.reverse(Message::QueueDequeueReply(DequeueReply {
                            message: None,
                            code: None,
                        }));
                        self.send(request.process.ipc, &reply);
                    }
                    Err(failure) => {
                        warn!(error = %failure, "dequeue failed");
                        let reply = envelope.reverse(Message::QueueDequeueReply(DequeueReply {
                            message: None,
                            code: Some(ErrorKind::InvalidSemantics),
                        }));
                        self.send(request.process.ipc, &reply);
                    }
                }
            }
            Message::QueueDequeueForgetRequest(request) => {
                let before = self.waiters.len();
                self.waiters
                    .retain(|waiter| waiter.correlation != request.correlation);
                let reply = envelope.reverse(Message::QueueDequeueForgetReply(DequeueForgetReply {
                    found: before != self.waiters.len(),
                }));
                self.send(request.process.ipc, &reply);
            }
            Message::TransactionResourcePrepareRequest(request) => {
                // every store operation is already durable; vote yes
                let reply = envelope.reverse(Message::TransactionResourcePrepareReply(
                    ResourceReply {
                        process: self.handle,
                        trid: request.trid,
                        resource: request.resource,
                        state: XaCode::Ok,
                    },
                ));
                self.send(request.process.ipc, &reply);
            }
            Message::TransactionResourceCommitRequest(request) => {
                let state = match self.store.commit(request.trid).await {
                    Ok(()) => XaCode::Ok,
                    Err(failure) => {
                        warn!(error = %failure, trid = %request.trid, "queue commit failed");
                        XaCode::ResourceError
                    }
                };
                self.involved.remove(&request.trid);
                let reply = envelope.reverse(Message::TransactionResourceCommitReply(
                    ResourceReply {
                        process: self.handle,
                        trid: request.trid,
                        resource: request.resource,
                        state,
                    },
                ));
                self.send(request.process.ipc, &reply);
                self.wake_waiters().await;
            }
            Message::TransactionResourceRollbackRequest(request) => {
                let state = match self.store.rollback(request.trid).await {
                    Ok(()) => XaCode::Ok,
                    Err(failure) => {
                        warn!(error = %failure, trid = %request.trid, "queue rollback failed");
                        XaCode::ResourceError
                    }
                };
                self.involved.remove(&request.trid);
                let reply = envelope.reverse(Message::TransactionResourceRollbackReply(
                    ResourceReply {
                        process: self.handle,
                        trid: request.trid,
                        resource: request.resource,
                        state,
                    },
                ));
                self.send(request.process.ipc, &reply);
                // rolled-back messages become available after their delay
                self.arm_wake().await;
            }
            Message::QueuePeekRequest(request) => {
                let messages = self.store.peek(&request.name).await.unwrap_or_default();
                let reply = envelope.reverse(Message::QueuePeekReply(PeekReply { messages }));
                self.send(request.process.ipc, &reply);
            }
            Message::QueueInformationRequest(request) => {
                let queues = self.store.information().await.unwrap_or_default();
                let reply =
                    envelope.reverse(Message::QueueInformationReply(InformationReply { queues }));
                self.send(request.process.ipc, &reply);
            }
            Message::QueueRestoreRequest(request) => {
                let restored = self.store.restore(&request.name).await.unwrap_or_default();
                let reply =
                    envelope.reverse(Message::QueueRestoreReply(RestoreReply { restored }));
                self.send(request.process.ipc, &reply);
                self.wake_waiters().await;
            }
            Message::QueueClearRequest(request) => {
                let removed = self.store.clear(&request.name).await.unwrap_or_default();
                let reply = envelope.reverse(Message::QueueClearReply(ClearReply { removed }));
                self.send(request.process.ipc, &reply);
            }
            Message::ShutdownRequest { .. } => return false,
            Message::SignalTimeout => self.wake_waiters().await,
            Message::Poke | Message::DomainProcessConnectReply(_) => {}
            other => {
                debug!(message_type = %other.message_type(), "unhandled message - action: discard");
            }
        }
        true
    }

    /// Reports this group as involved in a transaction, once per trid
    #[instrument(skip(self), fields(%trid))]
    fn involve(&mut self, trid: Xid) {
        if !self.involved.insert(trid) {
            return;
        }
        let Some(manager) = self
            .context
            .environment
            .handle(environment::TRANSACTION_MANAGER)
        else {
            warn!("transaction manager not published - transactional semantics degraded");
            return;
        };
        let involved = Envelope::new(Message::TransactionExternalResourceInvolved(
            ExternalResourceInvolved {
                process: self.handle,
                trid,
            },
        ));
        self.send(manager.ipc, &involved);
    }

    /// Serves parked waiters FIFO; each waiter gets at most the oldest
    /// matching message
    async fn wake_waiters(&mut self) {
        let mut remaining = VecDeque::new();
        while let Some(waiter) = self.waiters.pop_front() {
            if let Some(trid) = waiter.trid {
                self.involve(trid);
            }
            match self
                .store
                .dequeue(&waiter.queue, waiter.trid, waiter.properties.as_deref())
                .await
            {
                Ok(Some(message)) => {
                    let reply = Envelope {
                        correlation: waiter.correlation,
                        execution: waiter.execution,
                        message: Message::QueueDequeueReply(DequeueReply {
                            message: Some(message),
                            code: None,
                        }),
                    };
                    self.send(waiter.reply_to.ipc, &reply);
                }
                Ok(None) => remaining.push_back(waiter),
                Err(failure) => {
                    warn!(error = %failure, "waiter dequeue failed");
                    remaining.push_back(waiter);
                }
            }
        }
        self.waiters = remaining;
        self.arm_wake().await;
    }

    /// Arms the wake timer for the earliest future availability among
    /// queues with waiters
    async fn arm_wake(&mut self) {
        let queues: HashSet<QueueName> = self
            .waiters
            .iter()
            .map(|waiter| waiter.queue.clone())
            .collect();

        let mut earliest: Option<std::time::SystemTime> = None;
        for queue in queues {
            if let Ok(Some(at)) = self.store.earliest_available(&queue).await {
                earliest = Some(match earliest {
                    Some(existing) => existing.min(at),
                    None => at,
                });
            }
        }
        self.next_wake = earliest.map(|at| {
            let now_system = std::time::SystemTime::now();
            let now = Instant::now();
            match at.duration_since(now_system) {
                Ok(ahead) => now + ahead,
                Err(_) => now,
            }
        });
    }

    fn send(&mut self, to: IpcId, envelope: &Envelope) {
        if let Err(error) = self.pending_sends.send(&self.context.bus, to, envelope) {
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
