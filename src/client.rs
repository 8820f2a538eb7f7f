//! Caller-side session
//!
//! The calling discipline a service framework wraps: lookup, call, await
//! reply, with busy lookups armed with a deadline and discarded on expiry;
//! transaction demarcation against the coordinator; queue operations
//! against the resolved group. One session owns one inbound device and is
//! itself a registered process of its domain.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::{debug, instrument};
use uuid::Uuid;

use crate::domain::Environment;
use crate::domain_types::{Correlation, IpcId, Pid, QueueName, ResourceId, ServiceName, Xid};
use crate::error::{CasualError, ErrorKind, Result};
use crate::message::domain::{ConnectDirective, ProcessConnectRequest};
use crate::message::queue as queue_message;
use crate::message::service::{
    Call, LookupContext, LookupDiscardRequest, LookupRequest, LookupState,
};
use crate::message::transaction::{
    CommitRequest, ResourceInvolved, RollbackRequest,
};
use crate::message::{Envelope, Message};
use crate::process::{ProcessHandle, environment};
use crate::transport::bus::{Bus, Inbound};
use crate::transport::pending;
use crate::xa::XaCode;

/// Default patience for call lookups and replies
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of a service call
pub type CallResult = std::result::Result<Vec<u8>, ErrorKind>;

/// A connected caller
pub struct Session {
    handle: ProcessHandle,
    bus: Arc<Bus>,
    environment: Arc<Environment>,
    inbound: Inbound,
    sends: pending::Holder,
    transaction: Option<Xid>,
    timeout: Duration,
    shutdown_requested: bool,
}

impl Session {
    /// Connects a new session to a domain
    ///
    /// # Errors
    ///
    /// Fails when the domain manager is not published or refuses the
    /// connect.
    pub async fn connect(bus: Arc<Bus>, environment: Arc<Environment>) -> Result<Self> {
        Self::connect_as(bus, environment, Pid::allocate(), "client").await
    }

    /// Connects with a pre-allocated pid, for instances that already have
    /// one from the domain manager
    ///
    /// # Errors
    ///
    /// Fails when the domain manager is not published or refuses the
    /// connect.
    pub async fn connect_as(
        bus: Arc<Bus>,
        environment: Arc<Environment>,
        pid: Pid,
        path: &str,
    ) -> Result<Self> {
        let Some(domain_manager) = environment.handle(environment::DOMAIN_MANAGER) else {
            return Err(CasualError::CommunicationUnavailable {
                context: "domain manager is not published".into(),
            });
        };

        let inbound = bus.register(IpcId::generate());
        let handle = ProcessHandle::new(pid, inbound.ipc());
        let mut session = Self {
            handle,
            bus,
            environment,
            inbound,
            sends: pending::Holder::new(),
            transaction: None,
            timeout: DEFAULT_TIMEOUT,
            shutdown_requested: false,
        };

        let connect = Envelope::new(Message::DomainProcessConnectRequest(ProcessConnectRequest {
            process: handle,
            identity: None,
            path: path.into(),
        }));
        session.send(domain_manager.ipc, &connect)?;

        let reply = session
            .await_correlated(connect.correlation, session.timeout)
            .await?;
        match reply.message {
            Message::DomainProcessConnectReply(reply)
                if reply.directive == ConnectDirective::Start => {}
            _ => {
                return Err(CasualError::CommunicationUnavailable {
                    context: "domain refused the connect".into(),
                });
            }
        }
        Ok(session)
    }

    /// The session's process handle
    #[must_use]
    pub fn handle(&self) -> ProcessHandle {
        self.handle
    }

    /// Overrides the call patience
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// A cooperative shutdown request arrived while waiting
    #[must_use]
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested
    }

    // -- transactions -----------------------------------------------------

    /// Begins a transaction; the coordinator learns of it at first
    /// involvement
    ///
    /// # Errors
    ///
    /// Fails when a transaction is already in progress.
    pub fn begin(&mut self) -> Result<Xid> {
        if self.transaction.is_some() {
            return Err(CasualError::InvalidSemantics {
                reason: "transaction already in progress".into(),
            });
        }
        let trid = Xid::generate();
        self.transaction = Some(trid);
        Ok(trid)
    }

    /// The ambient transaction, if any
    #[must_use]
    pub fn transaction(&self) -> Option<Xid> {
        self.transaction
    }

    /// Reports resources as involved in the ambient transaction
    ///
    /// # Errors
    ///
    /// Fails without an ambient transaction or published coordinator.
    pub fn involve(&mut self, resources: &[ResourceId]) -> Result<()> {
        let Some(trid) = self.transaction else {
            return Err(CasualError::InvalidSemantics {
                reason: "no transaction in progress".into(),
            });
        };
        let manager = self.transaction_manager()?;
        let involved = Envelope::new(Message::TransactionResourceInvolved(ResourceInvolved {
            process: self.handle,
            trid,
            resources: resources.to_vec(),
            deadline: Some(SystemTime::now() + self.timeout),
        }));
        self.send(manager.ipc, &involved)
    }

    /// Commits the ambient transaction
    ///
    /// # Errors
    ///
    /// Fails on communication trouble; a rolled-back outcome surfaces as
    /// the coordinator's XA code.
    #[instrument(skip(self))]
    pub async fn commit(&mut self) -> Result<XaCode> {
        let Some(trid) = self.transaction.take() else {
            return Err(CasualError::InvalidSemantics {
                reason: "no transaction in progress".into(),
            });
        };
        let manager = self.transaction_manager()?;
        let request = Envelope::new(Message::TransactionCommitRequest(CommitRequest {
            process: self.handle,
            trid,
        }));
        self.send(manager.ipc, &request)?;

        let reply = self
            .await_correlated(request.correlation, self.timeout)
            .await?;
        match reply.message {
            Message::TransactionCommitReply(reply) => Ok(reply.code),
            other => Err(unexpected(&other)),
        }
    }

    /// Rolls the ambient transaction back
    ///
    /// # Errors
    ///
    /// Fails on communication trouble.
    #[instrument(skip(self))]
    pub async fn rollback(&mut self) -> Result<XaCode> {
        let Some(trid) = self.transaction.take() else {
            return Err(CasualError::InvalidSemantics {
                reason: "no transaction in progress".into(),
            });
        };
        let manager = self.transaction_manager()?;
        let request = Envelope::new(Message::TransactionRollbackRequest(RollbackRequest {
            process: self.handle,
            trid,
        }));
        self.send(manager.ipc, &request)?;

        let reply = self
            .await_correlated(request.correlation, self.timeout)
            .await?;
        match reply.message {
            Message::TransactionRollbackReply(reply) => Ok(reply.code),
            other => Err(unexpected(&other)),
        }
    }

    // -- service calls ----------------------------------------------------

    /// Synchronous service call: lookup, call, await the reply
    ///
    /// # Errors
    ///
    /// Communication-level failures; call-level outcomes are the inner
    /// [`ErrorKind`].
    #[instrument(skip(self, payload), fields(service = %service))]
    pub async fn call(&mut self, service: &ServiceName, payload: Vec<u8>) -> Result<CallResult> {
        let Some(service_manager) = self.environment.handle(environment::SERVICE_MANAGER) else {
            return Err(CasualError::CommunicationUnavailable {
                context: "service manager is not published".into(),
            });
        };

        let deadline = SystemTime::now() + self.timeout;
        let lookup = Envelope::new(Message::ServiceLookupRequest(LookupRequest {
            process: self.handle,
            requested: service.clone(),
            context: LookupContext::Regular,
            deadline: Some(deadline),
        }));
        let correlation = lookup.correlation;
        self.send(service_manager.ipc, &lookup)?;

        // first reply: idle, busy (second reply follows), or absent
        let target = match self.await_lookup(correlation, service_manager).await? {
            Ok(target) => target,
            Err(kind) => return Ok(Err(kind)),
        };

        // the call continues under the lookup correlation so the service
        // manager can correlate the acknowledgement
        let call = Envelope {
            correlation,
            execution: lookup.execution,
            message: Message::ServiceCall(Call {
                process: self.handle,
                service: service.clone(),
                trid: self.transaction,
                no_reply: false,
                deadline: Some(deadline),
                payload,
            }),
        };
        self.send(target.ipc, &call)?;

        let reply = self.await_correlated(correlation, self.timeout).await?;
        match reply.message {
            Message::ServiceReply(reply) => match reply.code {
                None => Ok(Ok(reply.payload)),
                Some(kind) => Ok(Err(kind)),
            },
            other => Err(unexpected(&other)),
        }
    }

    /// Fire-and-forget call: resolves through the forward cache when
    /// everything is busy and never waits for a reply
    ///
    /// # Errors
    ///
    /// Communication-level failures; `absent` surfaces as the inner kind.
    pub async fn call_no_reply(
        &mut self,
        service: &ServiceName,
        payload: Vec<u8>,
    ) -> Result<std::result::Result<(), ErrorKind>> {
        let Some(service_manager) = self.environment.handle(environment::SERVICE_MANAGER) else {
            return Err(CasualError::CommunicationUnavailable {
                context: "service manager is not published".into(),
            });
        };

        let lookup = Envelope::new(Message::ServiceLookupRequest(LookupRequest {
            process: self.handle,
            requested: service.clone(),
            context: LookupContext::NoReply,
            deadline: Some(SystemTime::now() + self.timeout),
        }));
        let correlation = lookup.correlation;
        self.send(service_manager.ipc, &lookup)?;

        let target = match self.await_lookup(correlation, service_manager).await? {
            Ok(target) => target,
            Err(kind) => return Ok(Err(kind)),
        };

        let call = Envelope {
            correlation,
            execution: lookup.execution,
            message: Message::ServiceCall(Call {
                process: self.handle,
                service: service.clone(),
                trid: None,
                no_reply: true,
                deadline: None,
                payload,
            }),
        };
        self.send(target.ipc, &call)?;
        Ok(Ok(()))
    }

    async fn await_lookup(
        &mut self,
        correlation: Correlation,
        service_manager: ProcessHandle,
    ) -> Result<std::result::Result<ProcessHandle, ErrorKind>> {
        loop {
            let reply = match self.await_correlated(correlation, self.timeout).await {
                Ok(reply) => reply,
                Err(CasualError::CommunicationUnavailable { .. }) => {
                    // patience ran out: withdraw the pending lookup
                    let discard = Envelope::new(Message::ServiceLookupDiscardRequest(
                        LookupDiscardRequest {
                            process: self.handle,
                            requested: ServiceName::try_new("-")
                                .unwrap_or_else(|_| unreachable!("static name is valid")),
                            correlation,
                        },
                    ));
                    let _ = self.send(service_manager.ipc, &discard);
                    return Ok(Err(ErrorKind::Timeout));
                }
                Err(error) => return Err(error),
            };
            match reply.message {
                Message::ServiceLookupReply(lookup) => match lookup.state {
                    LookupState::Idle => match lookup.process {
                        Some(process) => return Ok(Ok(process)),
                        None => return Ok(Err(ErrorKind::NoEntry)),
                    },
                    LookupState::Busy => {
                        // a second reply follows
                    }
                    LookupState::Absent => return Ok(Err(ErrorKind::NoEntry)),
                },
                other => {
                    debug!(message_type = %other.message_type(), "unexpected reply while waiting for lookup");
                }
            }
        }
    }

    // -- queue operations -------------------------------------------------

    /// Resolves a queue to its hosting group
    ///
    /// # Errors
    ///
    /// Communication-level failures; `absent` surfaces as the inner kind.
    pub async fn queue_lookup(
        &mut self,
        name: &QueueName,
    ) -> Result<std::result::Result<ProcessHandle, ErrorKind>> {
        let Some(queue_manager) = self.environment.handle(environment::QUEUE_MANAGER) else {
            return Err(CasualError::CommunicationUnavailable {
                context: "queue manager is not published".into(),
            });
        };
        let lookup = Envelope::new(Message::QueueLookupRequest(queue_message::LookupRequest {
            process: self.handle,
            name: name.clone(),
        }));
        self.send(queue_manager.ipc, &lookup)?;

        let reply = self
            .await_correlated(lookup.correlation, self.timeout)
            .await?;
        match reply.message {
            Message::QueueLookupReply(reply) => Ok(reply.process.ok_or(ErrorKind::Absent)),
            other => Err(unexpected(&other)),
        }
    }

    /// Enqueues a message under the ambient transaction
    ///
    /// # Errors
    ///
    /// Communication-level failures; enqueue-level outcomes are the inner
    /// kind.
    pub async fn enqueue(
        &mut self,
        name: &QueueName,
        message: queue_message::Message,
    ) -> Result<std::result::Result<Uuid, ErrorKind>> {
        let group = match self.queue_lookup(name).await? {
            Ok(group) => group,
            Err(kind) => return Ok(Err(kind)),
        };
        let request = Envelope::new(Message::QueueEnqueueRequest(queue_message::EnqueueRequest {
            process: self.handle,
            name: name.clone(),
            trid: self.transaction,
            message,
        }));
        self.send(group.ipc, &request)?;

        let reply = self
            .await_correlated(request.correlation, self.timeout)
            .await?;
        match reply.message {
            Message::QueueEnqueueReply(reply) => match (reply.id, reply.code) {
                (Some(id), None) => Ok(Ok(id)),
                (_, Some(kind)) => Ok(Err(kind)),
                (None, None) => Ok(Err(ErrorKind::InvalidSemantics)),
            },
            other => Err(unexpected(&other)),
        }
    }

    /// Dequeues under the ambient transaction; `block` parks as a waiter
    ///
    /// # Errors
    ///
    /// Communication-level failures; dequeue-level outcomes are the inner
    /// kind.
    pub async fn dequeue(
        &mut self,
        name: &QueueName,
        block: bool,
    ) -> Result<std::result::Result<Option<queue_message::Message>, ErrorKind>> {
        let group = match self.queue_lookup(name).await? {
            Ok(group) => group,
            Err(kind) => return Ok(Err(kind)),
        };
        let request = Envelope::new(Message::QueueDequeueRequest(queue_message::DequeueRequest {
            process: self.handle,
            name: name.clone(),
            trid: self.transaction,
            properties: None,
            block,
        }));
        self.send(group.ipc, &request)?;

        let patience = if block {
            // a blocking dequeue waits as long as the caller does
            Duration::from_secs(3600)
        } else {
            self.timeout
        };
        let reply = self.await_correlated(request.correlation, patience).await?;
        match reply.message {
            Message::QueueDequeueReply(reply) => match reply.code {
                None => Ok(Ok(reply.message)),
                Some(kind) => Ok(Err(kind)),
            },
            other => Err(unexpected(&other)),
        }
    }

    // -- plumbing ---------------------------------------------------------

    fn transaction_manager(&self) -> Result<ProcessHandle> {
        self.environment
            .handle(environment::TRANSACTION_MANAGER)
            .ok_or_else(|| CasualError::CommunicationUnavailable {
                context: "transaction manager is not published".into(),
            })
    }

    /// Awaits the reply carrying a correlation, discarding unrelated
    /// messages (stale second lookup replies, late service replies)
    async fn await_correlated(
        &mut self,
        correlation: Correlation,
        patience: Duration,
    ) -> Result<Envelope> {
        let deadline = tokio::time::Instant::now() + patience;
        loop {
            let envelope = tokio::select! {
                envelope = self.inbound.next() => envelope,
                () = tokio::time::sleep_until(deadline) => {
                    return Err(CasualError::CommunicationUnavailable {
                        context: "timed out waiting for reply".into(),
                    });
                }
            };
            match envelope {
                Some(envelope) if envelope.correlation == correlation => return Ok(envelope),
                Some(envelope) if matches!(envelope.message, Message::ShutdownRequest { .. }) => {
                    self.shutdown_requested = true;
                    return Err(CasualError::CommunicationUnavailable {
                        context: "shutdown requested".into(),
                    });
                }
                Some(other) => {
                    debug!(message_type = %other.message.message_type(),
                        "uncorrelated message while waiting - action: discard");
                }
                None => {
                    return Err(CasualError::CommunicationUnavailable {
                        context: "inbound device closed".into(),
                    });
                }
            }
        }
    }

    fn send(&mut self, to: IpcId, envelope: &Envelope) -> Result<()> {
        self.sends.send(&self.bus, to, envelope)?;
        self.sends.flush(&self.bus);
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.bus.remove(self.handle.ipc);
    }
}

fn unexpected(message: &Message) -> CasualError {
    CasualError::InvalidSemantics {
        reason: format!("unexpected reply type {}", message.message_type()),
    }
}
