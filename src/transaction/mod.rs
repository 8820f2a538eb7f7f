//! Transaction manager
//!
//! Distributed two-phase-commit coordinator. Local XA resources are reached
//! through per-resource proxy pools; remote domains and queue groups
//! register dynamically as external resources and are driven with the same
//! pinned resource messages. The `prepared` transition is durable before
//! any decision leaves the manager; other log writes batch per pump
//! iteration.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use crate::domain_types::{IpcId, Pid, ResourceId, Xid};
use crate::error::{ErrorKind, Result};
use crate::message::domain::{ConnectDirective, ProcessConnectRequest};
use crate::message::event;
use crate::message::service::{Call, Reply, Service};
use crate::message::transaction::{
    CommitReply, CommitRequest, CommitStage, ResourceProxyConnect, ResourceReply, ResourceRequest,
    RollbackReply, RollbackRequest,
};
use crate::message::{Envelope, Message, MessageType};
use crate::process::{ProcessHandle, identity};
use crate::transport::bus::{Bus, Inbound};
use crate::transport::pending;
use crate::xa::XaCode;

pub mod log;
pub mod proxy;
pub mod state;

use crate::domain::Environment;
use crate::domain::spawn::InstanceContext;
use log::Log;
use state::{Owner, ParkedRequest, Stage, State};

/// Admin service: coordinator snapshot
pub const ADMIN_STATE: &str = ".casual/transaction/state";

/// Environment slot carrying the manager configuration as JSON
pub const CONFIGURATION: &str = "CASUAL_TRANSACTION_CONFIGURATION";

/// Manager configuration published through the environment
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Configuration {
    /// Transaction log path; in-memory when absent
    pub log: Option<std::path::PathBuf>,
    /// Configured resources as `(id, name, instances)`
    pub resources: Vec<(u64, String, usize)>,
}

/// A 2PC phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Prepare,
    Commit,
    Rollback,
}

/// Runs the transaction manager as a domain instance
///
/// # Errors
///
/// Fails when the transaction log cannot be opened; that is fatal and the
/// domain manager observes the exit.
pub async fn run(context: InstanceContext) -> Result<()> {
    let configuration: Configuration = context
        .environment
        .get(CONFIGURATION)
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default();

    let log = match &configuration.log {
        Some(path) => Log::open(path).await?,
        None => Log::in_memory().await?,
    };

    let inbound = context.bus.register(IpcId::generate());
    let handle = ProcessHandle::new(context.pid, inbound.ipc());

    let resources: Vec<(ResourceId, String, usize)> = configuration
        .resources
        .iter()
        .map(|(id, name, instances)| (ResourceId::new(*id), name.clone(), *instances))
        .collect();

    let mut manager = Manager {
        handle,
        bus: Arc::clone(&context.bus),
        environment: Arc::clone(&context.environment),
        inbound,
        state: State::new(&resources),
        log,
        pending_sends: pending::Holder::new(),
        inflight: HashMap::new(),
    };

    if !manager.connect(&context).await {
        return Ok(());
    }
    manager.recover().await?;
    manager.run().await
}

struct Manager {
    handle: ProcessHandle,
    bus: Arc<Bus>,
    environment: Arc<Environment>,
    inbound: Inbound,
    state: State,
    log: Log,
    pending_sends: pending::Holder,
    /// which proxy serves which `(trid, resource)` phase, for exit handling
    inflight: HashMap<(Xid, ResourceId), Pid>,
}

impl Manager {
    async fn connect(&mut self, context: &InstanceContext) -> bool {
        let request = Envelope::new(Message::DomainProcessConnectRequest(ProcessConnectRequest {
            process: self.handle,
            identity: Some(identity::TRANSACTION_MANAGER),
            path: context.alias.to_string(),
        }));
        self.send(context.domain_manager, &request);

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
        self.send(context.domain_manager, &subscribe);

        self.advertise_admin_services();
        true
    }

    fn advertise_admin_services(&mut self) {
        let Some(service_manager) = self
            .environment
            .handle(crate::process::environment::SERVICE_MANAGER)
        else {
            return;
        };
        let Ok(name) = crate::domain_types::ServiceName::try_new(ADMIN_STATE) else {
            return;
        };
        let advertise = Envelope::new(Message::ServiceAdvertise(
            crate::message::service::Advertise {
                process: self.handle,
                add: vec![Service {
                    name,
                    category: "admin".into(),
                    transaction: crate::message::service::TransactionMode::None,
                    timeout: None,
                }],
                remove: Vec::new(),
                reset: false,
            },
        ));
        self.send(service_manager.ipc, &advertise);
    }

    /// Replays the log: surviving `prepared` transactions are re-driven
    async fn recover(&mut self) -> Result<()> {
        let recovered = self.log.recover().await?;
        for entry in recovered {
            match entry.state {
                log::LoggedState::Prepared => {
                    info!(trid = %entry.trid, "re-driving prepared transaction after restart");
                    let transaction = self.state.transaction(entry.trid);
                    transaction.involve(&entry.resources);
                    for resource in &entry.resources {
                        transaction.votes.insert(*resource, XaCode::Ok);
                    }
                    transaction.stage = Stage::Committing;
                    for resource in entry.resources {
                        self.send_phase(Phase::Commit, entry.trid, resource);
                    }
                }
                log::LoggedState::Heuristic => {
                    warn!(trid = %entry.trid, "heuristic evidence in log - operator attention");
                }
                log::LoggedState::Committed | log::LoggedState::RolledBack => {
                    self.log.committed(entry.trid);
                }
            }
        }
        Ok(())
    }

    async fn run(mut self) -> Result<()> {
        info!("transaction manager start");
        loop {
            let deadline = self.state.earliest_deadline();
            let envelope = tokio::select! {
                envelope = self.inbound.next() => envelope,
                () = sleep_until_or_forever(deadline) => {
                    self.handle_deadline();
                    continue;
                }
            };
            let Some(envelope) = envelope else { break };

            if !self.dispatch(envelope).await {
                break;
            }

            // batched transitions become durable at idle
            if let Err(failure) = self.log.flush().await {
                error!(error = %failure, "transaction log flush failed - retry next iteration");
            }
            self.state.sweep();
            self.pending_sends.flush(&self.bus);
        }

        let _ = self.log.flush().await;
        self.bus.remove(self.handle.ipc);
        info!("transaction manager off-line");
        Ok(())
    }

    async fn dispatch(&mut self, envelope: Envelope) -> bool {
        match envelope.message.clone() {
            Message::TransactionResourceProxyConnect(connect) => self.proxy_connect(&connect),
            Message::TransactionResourceInvolved(involved) => {
                let transaction = self.state.transaction(involved.trid);
                transaction.involve(&involved.resources);
                if let Some(deadline) = involved.deadline {
                    let instant = to_instant(deadline);
                    transaction.deadline = Some(match transaction.deadline {
                        Some(existing) => existing.min(instant),
                        None => instant,
                    });
                }
            }
            Message::TransactionExternalResourceInvolved(involved) => {
                let resource = self.state.external_resource(involved.process);
                self.state.transaction(involved.trid).involve(&[resource]);
            }
            Message::TransactionCommitRequest(request) => {
                self.commit(&envelope, &request).await;
            }
            Message::TransactionRollbackRequest(request) => self.rollback(&envelope, &request),
            Message::TransactionResourcePrepareRequest(request) => {
                self.subordinate_prepare(&envelope, &request).await;
            }
            Message::TransactionResourceCommitRequest(request) => {
                self.subordinate_phase_two(&envelope, &request, Phase::Commit);
            }
            Message::TransactionResourceRollbackRequest(request) => {
                self.subordinate_phase_two(&envelope, &request, Phase::Rollback);
            }
            Message::TransactionResourcePrepareReply(reply) => {
                self.prepare_reply(&reply).await;
            }
            Message::TransactionResourceCommitReply(reply) => {
                self.phase_two_reply(&reply, Phase::Commit).await;
            }
            Message::TransactionResourceRollbackReply(reply) => {
                self.phase_two_reply(&reply, Phase::Rollback).await;
            }
            Message::EventProcessExit(exit) => self.process_exit(exit.exit.pid).await,
            Message::ServiceCall(call) => self.admin_call(&envelope, &call),
            Message::ShutdownRequest { .. } => return false,
            Message::SignalTimeout => self.handle_deadline(),
            Message::Poke | Message::DomainProcessConnectReply(_) => {}
            other => {
                debug!(message_type = %other.message_type(), "unhandled message - action: discard");
            }
        }
        true
    }

    // -- proxies ----------------------------------------------------------

    fn proxy_connect(&mut self, connect: &ResourceProxyConnect) {
        match self.state.pool_mut(connect.resource) {
            Some(pool) => {
                pool.instances.push(state::Proxy {
                    process: connect.process,
                    busy: false,
                });
                info!(resource = %connect.resource, pid = %connect.process.pid,
                    "resource proxy connected");
            }
            None => {
                error!(resource = %connect.resource, pid = %connect.process.pid,
                    "unexpected resource proxy connecting - action: discard");
                return;
            }
        }
        self.flush_parked();
    }

    fn flush_parked(&mut self) {
        let mut keep = std::collections::VecDeque::new();
        while let Some(parked) = self.state.parked.pop_front() {
            let reserved = self
                .state
                .pool_mut(parked.resource)
                .and_then(state::Pool::reserve);
            match reserved {
                Some(proxy) => {
                    if let Message::TransactionResourcePrepareRequest(request)
                    | Message::TransactionResourceCommitRequest(request)
                    | Message::TransactionResourceRollbackRequest(request) =
                        &parked.envelope.message
                    {
                        self.inflight
                            .insert((request.trid, parked.resource), proxy.pid);
                    }
                    let envelope = parked.envelope.clone();
                    self.send(proxy.ipc, &envelope);
                }
                None => keep.push_back(parked),
            }
        }
        self.state.parked = keep;
    }

    // -- commit / rollback ------------------------------------------------

    #[instrument(skip_all, fields(trid = %request.trid))]
    async fn commit(&mut self, envelope: &Envelope, request: &CommitRequest) {
        let owner = Owner {
            process: request.process,
            correlation: envelope.correlation,
            execution: envelope.execution,
        };

        let involved = {
            let transaction = self.state.transaction(request.trid);
            if transaction.stage != Stage::Active {
                warn!(stage = ?transaction.stage, "commit for transaction not active - action: discard");
                return;
            }
            transaction.owner = Some(owner);
            transaction.owner_requested_commit = true;
            transaction.involved.clone()
        };

        match involved.len() {
            // nothing joined: read-only commit, no log record
            0 => {
                self.state.transaction(request.trid).stage = Stage::Committed;
                self.owner_commit_reply(request.trid, CommitStage::Committed, XaCode::ReadOnly);
            }
            // single resource: commit-one-phase, no prepared record
            1 => {
                let resource = involved[0];
                {
                    let transaction = self.state.transaction(request.trid);
                    transaction.stage = Stage::Committing;
                    transaction.one_phase = true;
                    transaction.votes.insert(resource, XaCode::Ok);
                }
                self.send_phase(Phase::Commit, request.trid, resource);
            }
            _ => {
                self.state.transaction(request.trid).stage = Stage::Preparing;
                for resource in involved {
                    self.send_phase(Phase::Prepare, request.trid, resource);
                }
            }
        }
    }

    #[instrument(skip_all, fields(trid = %request.trid))]
    fn rollback(&mut self, envelope: &Envelope, request: &RollbackRequest) {
        let owner = Owner {
            process: request.process,
            correlation: envelope.correlation,
            execution: envelope.execution,
        };
        let involved = {
            let transaction = self.state.transaction(request.trid);
            transaction.owner = Some(owner);
            transaction.owner_requested_commit = false;
            transaction.involved.clone()
        };

        if involved.is_empty() {
            self.state.transaction(request.trid).stage = Stage::RolledBack;
            self.owner_rollback_reply(request.trid, XaCode::Ok);
            return;
        }

        self.state.transaction(request.trid).stage = Stage::RollingBack;
        for resource in involved {
            self.send_phase(Phase::Rollback, request.trid, resource);
        }
    }

    // -- subordinate coordination -----------------------------------------

    /// A superior coordinator (a remote domain, through the inbound
    /// gateway) drives this manager as one of its resources: prepare every
    /// locally involved resource and answer one aggregated vote. The
    /// aggregated yes is durable before it is released.
    #[instrument(skip_all, fields(trid = %request.trid))]
    async fn subordinate_prepare(
        &mut self,
        envelope: &Envelope,
        request: &crate::message::transaction::ResourceRequest,
    ) {
        let involved = {
            let transaction = self.state.transaction(request.trid);
            transaction.subordinate = Some(state::Subordinate {
                requester: request.process,
                correlation: envelope.correlation,
                execution: envelope.execution,
                resource: request.resource,
                awaiting: Some(state::SubordinatePhase::Prepare),
            });
            transaction.involved.clone()
        };

        if involved.is_empty() {
            // nothing joined locally: the branch is read-only
            self.state.transaction(request.trid).stage = Stage::Committed;
            self.subordinate_reply(request.trid, Phase::Prepare, XaCode::ReadOnly);
            return;
        }

        self.state.transaction(request.trid).stage = Stage::Preparing;
        for resource in involved {
            self.send_phase(Phase::Prepare, request.trid, resource);
        }
    }

    /// Superior decision: drive commit or rollback on the local
    /// participants and answer one aggregated result
    fn subordinate_phase_two(
        &mut self,
        envelope: &Envelope,
        request: &crate::message::transaction::ResourceRequest,
        phase: Phase,
    ) {
        let (targets, stage) = {
            let transaction = self.state.transaction(request.trid);
            transaction.subordinate = Some(state::Subordinate {
                requester: request.process,
                correlation: envelope.correlation,
                execution: envelope.execution,
                resource: request.resource,
                awaiting: Some(match phase {
                    Phase::Commit => state::SubordinatePhase::Commit,
                    _ => state::SubordinatePhase::Rollback,
                }),
            });
            transaction.results.clear();
            let targets = match phase {
                Phase::Commit => transaction.committable(),
                _ => {
                    if transaction.votes.is_empty() {
                        transaction.involved.clone()
                    } else {
                        transaction.committable()
                    }
                }
            };
            let stage = match phase {
                Phase::Commit => Stage::Committing,
                _ => Stage::RollingBack,
            };
            (targets, stage)
        };

        if targets.is_empty() {
            let code = XaCode::Ok;
            self.state.transaction(request.trid).stage = match phase {
                Phase::Commit => Stage::Committed,
                _ => Stage::RolledBack,
            };
            if phase == Phase::Commit {
                self.log.committed(request.trid);
            }
            self.subordinate_reply(request.trid, phase, code);
            return;
        }

        self.state.transaction(request.trid).stage = stage;
        for resource in targets {
            self.send_phase(phase, request.trid, resource);
        }
    }

    /// Answers the superior on the pinned resource pair and clears the owed
    /// phase
    fn subordinate_reply(&mut self, trid: Xid, phase: Phase, code: XaCode) {
        let Some(subordinate) = self
            .state
            .transactions
            .get_mut(&trid)
            .and_then(|transaction| {
                let subordinate = transaction.subordinate?;
                transaction.subordinate = Some(state::Subordinate {
                    awaiting: None,
                    ..subordinate
                });
                Some(subordinate)
            })
        else {
            return;
        };
        if subordinate.awaiting.is_none() {
            return;
        }

        let reply = ResourceReply {
            process: self.handle,
            trid,
            resource: subordinate.resource,
            state: code,
        };
        let message = match phase {
            Phase::Prepare => Message::TransactionResourcePrepareReply(reply),
            Phase::Commit => Message::TransactionResourceCommitReply(reply),
            Phase::Rollback => Message::TransactionResourceRollbackReply(reply),
        };
        let envelope = Envelope {
            correlation: subordinate.correlation,
            execution: subordinate.execution,
            message,
        };
        self.send(subordinate.requester.ipc, &envelope);
    }

    /// Deadline passed: the manager rolls the transaction back so resources
    /// can release what they hold
    fn handle_deadline(&mut self) {
        for trid in self.state.expired(Instant::now()) {
            warn!(%trid, "transaction deadline passed - action: rollback");
            let involved = {
                let transaction = self.state.transaction(trid);
                transaction.stage = Stage::RollingBack;
                transaction.involved.clone()
            };
            if involved.is_empty() {
                self.state.transaction(trid).stage = Stage::RolledBack;
                continue;
            }
            for resource in involved {
                self.send_phase(Phase::Rollback, trid, resource);
            }
        }
    }

    // -- resource replies -------------------------------------------------

    async fn prepare_reply(&mut self, reply: &ResourceReply) {
        self.release_proxy(reply);

        let (voted, subordinate) = {
            let Some(transaction) = self.state.transactions.get_mut(&reply.trid) else {
                State::consistency_warning(reply.trid, reply.resource, "prepare reply");
                return;
            };
            if transaction.stage != Stage::Preparing {
                State::consistency_warning(reply.trid, reply.resource, "prepare reply out of stage");
                return;
            }
            transaction.votes.insert(reply.resource, reply.state);
            (transaction.voted(), transaction.subordinate.is_some())
        };
        if !voted {
            return;
        }
        if subordinate {
            self.subordinate_vote_complete(reply.trid).await;
            return;
        }
        let Some(transaction) = self.state.transactions.get_mut(&reply.trid) else {
            return;
        };

        // all votes collected: decide
        if transaction.heuristic() {
            let trid = transaction.trid;
            let involved = transaction.involved.clone();
            transaction.stage = Stage::Heuristic;
            if let Err(failure) = self.log.heuristic(trid, &involved).await {
                error!(error = %failure, "failed to log heuristic evidence");
            }
            self.owner_commit_reply(trid, CommitStage::Committed, XaCode::HeuristicHazard);
            return;
        }

        let all_ok = transaction
            .votes
            .values()
            .all(|code| code.prepare_ok());
        let trid = transaction.trid;

        if all_ok {
            let committable = transaction.committable();
            if committable.is_empty() {
                // every participant was read-only
                transaction.stage = Stage::Committed;
                self.owner_commit_reply(trid, CommitStage::Committed, XaCode::ReadOnly);
                return;
            }

            transaction.stage = Stage::Prepared;
            // the decision must be durable before it is released anywhere
            if let Err(failure) = self.log.prepare(trid, &committable).await {
                error!(error = %failure, "failed to persist prepared state - action: rollback");
                let transaction = self.state.transaction(trid);
                transaction.stage = Stage::RollingBack;
                for resource in transaction.committable() {
                    self.send_phase(Phase::Rollback, trid, resource);
                }
                return;
            }

            self.state.transaction(trid).stage = Stage::Committing;
            for resource in committable {
                self.send_phase(Phase::Commit, trid, resource);
            }
        } else {
            // at least one no-vote: roll back the yes-voters
            let failure = transaction
                .votes
                .values()
                .copied()
                .find(|code| !code.prepare_ok())
                .unwrap_or(XaCode::RollbackUnspecified);
            let to_roll_back = transaction.committable();
            transaction.stage = Stage::RollingBack;

            if to_roll_back.is_empty() {
                self.finish_rollback(trid, failure);
                return;
            }
            // the no-voters have already rolled their branches back; only
            // the yes-voters need the decision
            for resource in to_roll_back {
                self.send_phase(Phase::Rollback, trid, resource);
            }
        }
    }

    /// All local votes are in for a subordinate coordination: aggregate and
    /// answer the superior. The aggregated yes is durable first.
    async fn subordinate_vote_complete(&mut self, trid: Xid) {
        enum Verdict {
            Heuristic,
            ReadOnly,
            Prepared(Vec<ResourceId>),
            Failed(XaCode, Vec<ResourceId>),
        }

        let verdict = {
            let Some(transaction) = self.state.transactions.get_mut(&trid) else {
                return;
            };
            if transaction.heuristic() {
                transaction.stage = Stage::Heuristic;
                Verdict::Heuristic
            } else if transaction.votes.values().all(|code| code.prepare_ok()) {
                let committable = transaction.committable();
                if committable.is_empty() {
                    transaction.stage = Stage::Committed;
                    Verdict::ReadOnly
                } else {
                    transaction.stage = Stage::Prepared;
                    Verdict::Prepared(committable)
                }
            } else {
                let failure = transaction
                    .votes
                    .values()
                    .copied()
                    .find(|code| !code.prepare_ok())
                    .unwrap_or(XaCode::RollbackUnspecified);
                let to_roll_back = transaction.committable();
                transaction.stage = Stage::RollingBack;
                Verdict::Failed(failure, to_roll_back)
            }
        };

        match verdict {
            Verdict::Heuristic => {
                let involved = self
                    .state
                    .transaction(trid)
                    .involved
                    .clone();
                if let Err(failure) = self.log.heuristic(trid, &involved).await {
                    error!(error = %failure, "failed to log heuristic evidence");
                }
                self.subordinate_reply(trid, Phase::Prepare, XaCode::HeuristicHazard);
            }
            Verdict::ReadOnly => {
                self.subordinate_reply(trid, Phase::Prepare, XaCode::ReadOnly);
            }
            Verdict::Prepared(committable) => {
                if let Err(failure) = self.log.prepare(trid, &committable).await {
                    error!(error = %failure, "failed to persist prepared state - action: vote no");
                    self.subordinate_reply(trid, Phase::Prepare, XaCode::ResourceError);
                    let transaction = self.state.transaction(trid);
                    transaction.stage = Stage::RollingBack;
                    for resource in committable {
                        self.send_phase(Phase::Rollback, trid, resource);
                    }
                    return;
                }
                self.subordinate_reply(trid, Phase::Prepare, XaCode::Ok);
            }
            Verdict::Failed(failure, to_roll_back) => {
                // the superior learns the branch is rolled back; the local
                // yes-voters are rolled back here and now
                self.subordinate_reply(trid, Phase::Prepare, failure);
                if to_roll_back.is_empty() {
                    self.state.transaction(trid).stage = Stage::RolledBack;
                    self.log.rolled_back(trid);
                } else {
                    for resource in to_roll_back {
                        self.send_phase(Phase::Rollback, trid, resource);
                    }
                }
            }
        }
    }

    async fn phase_two_reply(&mut self, reply: &ResourceReply, phase: Phase) {
        self.release_proxy(reply);

        let Some(transaction) = self.state.transactions.get_mut(&reply.trid) else {
            State::consistency_warning(reply.trid, reply.resource, "phase-two reply");
            return;
        };
        transaction.results.insert(reply.resource, reply.state);

        match (transaction.stage, phase) {
            (Stage::Committing, Phase::Commit) => {
                let expected = if transaction.one_phase {
                    transaction.involved.clone()
                } else {
                    transaction.committable()
                };
                if !transaction.resolved(&expected) {
                    return;
                }
                let trid = transaction.trid;
                let subordinate = transaction
                    .subordinate
                    .and_then(|subordinate| subordinate.awaiting)
                    == Some(state::SubordinatePhase::Commit);
                if transaction.heuristic() {
                    let involved = transaction.involved.clone();
                    transaction.stage = Stage::Heuristic;
                    if let Err(failure) = self.log.heuristic(trid, &involved).await {
                        error!(error = %failure, "failed to log heuristic evidence");
                    }
                    if subordinate {
                        self.subordinate_reply(trid, Phase::Commit, XaCode::HeuristicHazard);
                    } else {
                        self.owner_commit_reply(
                            trid,
                            CommitStage::Committed,
                            XaCode::HeuristicHazard,
                        );
                    }
                    return;
                }
                let code = transaction
                    .results
                    .values()
                    .copied()
                    .find(|code| *code != XaCode::Ok)
                    .unwrap_or(XaCode::Ok);
                transaction.stage = Stage::Committed;
                self.log.committed(trid);
                if subordinate {
                    self.subordinate_reply(trid, Phase::Commit, code);
                } else {
                    self.owner_commit_reply(trid, CommitStage::Committed, code);
                }
            }
            (Stage::RollingBack, Phase::Rollback) => {
                // awaited: resources we actually sent rollback to - every
                // involved one on a rollback request (no votes), or the
                // yes-voters after a failed prepare; read-only voters and
                // no-voters are already done
                let expected: Vec<ResourceId> = transaction.involved.clone();
                let outstanding = expected.iter().any(|resource| {
                    !transaction.results.contains_key(resource)
                        && transaction
                            .votes
                            .get(resource)
                            .map_or(true, |code| *code == XaCode::Ok)
                });
                if outstanding {
                    return;
                }
                let trid = transaction.trid;
                let subordinate = transaction
                    .subordinate
                    .and_then(|subordinate| subordinate.awaiting)
                    == Some(state::SubordinatePhase::Rollback);
                let code = transaction
                    .votes
                    .values()
                    .copied()
                    .find(|code| !code.prepare_ok())
                    .unwrap_or(XaCode::Ok);
                if subordinate {
                    transaction.stage = Stage::RolledBack;
                    self.log.rolled_back(trid);
                    self.subordinate_reply(trid, Phase::Rollback, XaCode::Ok);
                } else {
                    self.finish_rollback(trid, code);
                }
            }
            (stage, _) => {
                debug!(%reply.trid, ?stage, ?phase, "late phase reply - action: discard");
            }
        }
    }

    fn finish_rollback(&mut self, trid: Xid, code: XaCode) {
        let requested_commit = {
            let transaction = self.state.transaction(trid);
            transaction.stage = Stage::RolledBack;
            transaction.owner_requested_commit
        };
        self.log.rolled_back(trid);

        if requested_commit {
            // a commit request that ended in rollback answers on the commit
            // pair with the failing vote
            let code = if code == XaCode::Ok {
                XaCode::RollbackUnspecified
            } else {
                code
            };
            self.owner_commit_reply(trid, CommitStage::Committed, code);
        } else {
            self.owner_rollback_reply(trid, XaCode::Ok);
        }
    }

    fn release_proxy(&mut self, reply: &ResourceReply) {
        self.inflight.remove(&(reply.trid, reply.resource));
        if let Some(pool) = self.state.pool_of_mut(reply.process.pid) {
            pool.release(reply.process.pid);
        }
        self.flush_parked();
    }

    // -- phase routing ----------------------------------------------------

    fn send_phase(&mut self, phase: Phase, trid: Xid, resource: ResourceId) {
        let request = ResourceRequest {
            process: self.handle,
            trid,
            resource,
            flags: 0,
        };
        let message = match phase {
            Phase::Prepare => Message::TransactionResourcePrepareRequest(request),
            Phase::Commit => Message::TransactionResourceCommitRequest(request),
            Phase::Rollback => Message::TransactionResourceRollbackRequest(request),
        };
        let envelope = Envelope::new(message);

        // external resources (gateway connections, queue groups) are driven
        // directly; configured resources go through their proxy pool
        if let Some(carrier) = self.state.externals.get(&resource).copied() {
            self.send(carrier.ipc, &envelope);
            return;
        }

        let reserved = self.state.pool_mut(resource).and_then(state::Pool::reserve);
        match reserved {
            Some(proxy) => {
                self.inflight.insert((trid, resource), proxy.pid);
                self.send(proxy.ipc, &envelope);
            }
            None => {
                if self.state.pool_mut(resource).is_none() {
                    error!(%resource, %trid, "no route to resource - action: fail with resource failure");
                    let synthesized = ResourceReply {
                        process: self.handle,
                        trid,
                        resource,
                        state: XaCode::ResourceFailure,
                    };
                    // fed back through the inbound device to keep handling uniform
                    let reply = match phase {
                        Phase::Prepare => Message::TransactionResourcePrepareReply(synthesized),
                        Phase::Commit => Message::TransactionResourceCommitReply(synthesized),
                        Phase::Rollback => Message::TransactionResourceRollbackReply(synthesized),
                    };
                    let envelope = Envelope::new(reply);
                    self.send(self.handle.ipc, &envelope);
                } else {
                    self.state.parked.push_back(ParkedRequest { resource, envelope });
                }
            }
        }
    }

    // -- owner replies ----------------------------------------------------

    fn owner_commit_reply(&mut self, trid: Xid, stage: CommitStage, code: XaCode) {
        let Some(owner) = self
            .state
            .transactions
            .get(&trid)
            .and_then(|transaction| transaction.owner)
        else {
            return;
        };
        let reply = Envelope {
            correlation: owner.correlation,
            execution: owner.execution,
            message: Message::TransactionCommitReply(CommitReply { trid, stage, code }),
        };
        self.send(owner.process.ipc, &reply);
    }

    fn owner_rollback_reply(&mut self, trid: Xid, code: XaCode) {
        let Some(owner) = self
            .state
            .transactions
            .get(&trid)
            .and_then(|transaction| transaction.owner)
        else {
            return;
        };
        let reply = Envelope {
            correlation: owner.correlation,
            execution: owner.execution,
            message: Message::TransactionRollbackReply(RollbackReply { trid, code }),
        };
        self.send(owner.process.ipc, &reply);
    }

    // -- process exit -----------------------------------------------------

    async fn process_exit(&mut self, pid: Pid) {
        // synthesize failure replies for phases the dead proxy was serving
        let affected: Vec<(Xid, ResourceId)> = self
            .inflight
            .iter()
            .filter(|(_, proxy)| **proxy == pid)
            .map(|(key, _)| *key)
            .collect();
        self.state.remove_process(pid);

        for (trid, resource) in affected {
            self.inflight.remove(&(trid, resource));
            warn!(%trid, %resource, %pid,
                "resource proxy exited mid-phase - action: synthesize resource failure");
            let stage = self
                .state
                .transactions
                .get(&trid)
                .map(|transaction| transaction.stage);
            let synthesized = ResourceReply {
                process: self.handle,
                trid,
                resource,
                state: XaCode::ResourceFailure,
            };
            match stage {
                Some(Stage::Preparing) => self.prepare_reply(&synthesized).await,
                Some(Stage::Committing) => self.phase_two_reply(&synthesized, Phase::Commit).await,
                Some(Stage::RollingBack) => {
                    self.phase_two_reply(&synthesized, Phase::Rollback).await;
                }
                _ => {}
            }
        }
    }

    // -- admin ------------------------------------------------------------

    fn admin_call(&mut self, envelope: &Envelope, call: &Call) {
        let reply = if call.service.to_string() == ADMIN_STATE {
            Reply {
                code: None,
                trid: None,
                payload: serde_json::to_vec(
                    &self.state.snapshot(self.log.writes, self.log.batched),
                )
                .unwrap_or_default(),
            }
        } else {
            Reply::error(ErrorKind::NoEntry)
        };

        if !call.no_reply {
            let response = envelope.reverse(Message::ServiceReply(reply));
            self.send(call.process.ipc, &response);
        }
        self.acknowledge_admin_call(call);
    }

    fn acknowledge_admin_call(&mut self, call: &Call) {
        let Some(service_manager) = self
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

    // -- plumbing ---------------------------------------------------------

    fn send(&mut self, to: IpcId, envelope: &Envelope) {
        if let Err(error) = self.pending_sends.send(&self.bus, to, envelope) {
            warn!(%error, %to, "failed to send message - action: drop");
        }
    }
}

fn to_instant(deadline: std::time::SystemTime) -> Instant {
    let now_system = std::time::SystemTime::now();
    let now = Instant::now();
    match deadline.duration_since(now_system) {
        Ok(ahead) => now + ahead,
        Err(_) => now,
    }
}

async fn sleep_until_or_forever(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}
