//! Domain manager
//!
//! Process supervisor of a domain: boots the dependency-ordered group graph,
//! registers processes and singletons, serves identity lookups, scales
//! aliases, fans out exit events and orchestrates graceful shutdown.
//!
//! The manager is single-threaded cooperative: one loop over its inbound
//! device, the exit channel (the SIGCHLD stand-in) and a single timer armed
//! for the earliest outstanding deadline.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, instrument, warn};

use crate::configuration::Model;
use crate::domain_types::{Alias, IpcId, Pid, ServiceName};
use crate::error::Result;
use crate::message::domain::{
    ConnectDirective, LookupDirective, ProcessConnectReply, ProcessConnectRequest,
    ProcessLookupReply, ProcessLookupRequest, ProcessPrepareShutdownReply,
    ProcessPrepareShutdownRequest, ScaleExecutable,
};
use crate::message::event;
use crate::message::service::{Advertise, Call, Reply, Service};
use crate::message::{Envelope, Message};
use crate::process::{Exit, ExitReason, ProcessHandle, identity};
use crate::transport::bus::{Bus, Inbound};

pub mod boot;
pub mod environment;
pub mod spawn;
pub mod state;

pub use environment::Environment;

use spawn::{InstanceContext, Registry};
use state::{Grace, ParkedLookup, Runlevel, State, TaskKind};

/// Admin service: domain state snapshot
pub const ADMIN_STATE: &str = ".casual/domain/state";
/// Admin service: scale an alias
pub const ADMIN_SCALE: &str = ".casual/domain/scale/instances";
/// Admin service: initiate shutdown
pub const ADMIN_SHUTDOWN: &str = ".casual/domain/shutdown";

/// Environment variable carrying the domain name
pub const DOMAIN_NAME_VARIABLE: &str = "CASUAL_DOMAIN_NAME";
/// Environment variable carrying the domain identity
pub const DOMAIN_ID_VARIABLE: &str = "CASUAL_DOMAIN_ID";

/// Payload of the scale admin service
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct ScaleRequest {
    /// Alias to scale
    pub alias: String,
    /// Target instance count
    pub instances: usize,
}

/// The domain manager
pub struct Manager {
    handle: ProcessHandle,
    bus: Arc<Bus>,
    inbound: Inbound,
    environment: Arc<Environment>,
    state: State,
    exits_tx: mpsc::UnboundedSender<Exit>,
    exits_rx: mpsc::UnboundedReceiver<Exit>,
    runlevel_tx: watch::Sender<Runlevel>,
}

impl Manager {
    /// Creates the manager, its device, and the boot task list
    ///
    /// # Errors
    ///
    /// Fails when the configuration does not validate or the group graph has
    /// a cycle.
    pub fn new(
        configuration: Model,
        registry: Registry,
        managers: Vec<Alias>,
        bus: Arc<Bus>,
    ) -> Result<(Self, watch::Receiver<Runlevel>)> {
        configuration.validate()?;

        let pid = Pid::allocate();
        let inbound = bus.register(IpcId::generate());
        let handle = ProcessHandle::new(pid, inbound.ipc());

        let environment = Environment::new();
        environment.set_handle(crate::process::environment::DOMAIN_MANAGER, handle);
        environment.set(DOMAIN_NAME_VARIABLE, configuration.name.to_string());

        let mut state = State::new(configuration, registry);
        environment.set(DOMAIN_ID_VARIABLE, uuid::Uuid::from(state.identity).to_string());
        state.processes.insert(pid, handle);

        // core managers are executables too, so scaling and shutdown see them
        for alias in &managers {
            state.executables.push(state::Executable {
                alias: alias.clone(),
                configured_instances: 1,
                memberships: Vec::new(),
                restart: false,
                instances: Vec::new(),
            });
        }
        let batches = boot::boot_batches(&state.configuration, managers)?;
        state.tasks.extend(batches);

        let (exits_tx, exits_rx) = mpsc::unbounded_channel();
        let (runlevel_tx, runlevel_rx) = watch::channel(Runlevel::Startup);

        Ok((
            Self {
                handle,
                bus,
                inbound,
                environment,
                state,
                exits_tx,
                exits_rx,
                runlevel_tx,
            },
            runlevel_rx,
        ))
    }

    /// The manager's own process handle
    #[must_use]
    pub fn handle(&self) -> ProcessHandle {
        self.handle
    }

    /// The domain environment handed to spawned instances
    #[must_use]
    pub fn environment(&self) -> Arc<Environment> {
        Arc::clone(&self.environment)
    }

    /// Runs the event loop until the domain is fully shut down
    pub async fn run(mut self) {
        info!(domain = %self.state.name, "domain manager start");
        self.advance_tasks();

        loop {
            let deadline = self.state.earliest_deadline();
            tokio::select! {
                envelope = self.inbound.next() => {
                    let Some(envelope) = envelope else { break };
                    self.dispatch(envelope);
                }
                exit = self.exits_rx.recv() => {
                    let Some(exit) = exit else { break };
                    self.handle_exit(exit);
                }
                () = sleep_until_or_forever(deadline) => {
                    self.handle_timeout();
                }
            }

            self.advance_tasks();
            self.state.pending_sends.flush(&self.bus);

            if self.state.runlevel == Runlevel::Shutdown && self.state.tasks.is_empty() {
                break;
            }
        }

        self.bus.remove(self.handle.ipc);
        let _ = self.runlevel_tx.send(Runlevel::Shutdown);
        info!(domain = %self.state.name, "domain manager off-line");
    }

    fn dispatch(&mut self, envelope: Envelope) {
        match envelope.message.clone() {
            Message::DomainProcessConnectRequest(request) => self.connect(&envelope, request),
            Message::DomainProcessLookupRequest(request) => self.lookup(&envelope, request),
            Message::DomainScaleExecutable(scale) => self.scale(&scale),
            Message::DomainProcessPrepareShutdownReply(reply) => {
                self.prepare_shutdown_reply(reply);
            }
            Message::EventSubscriptionBegin(begin) => {
                self.state
                    .event_listeners
                    .retain(|(handle, _)| handle.pid != begin.process.pid);
                self.state.event_listeners.push((begin.process, begin.types));
            }
            Message::EventSubscriptionEnd(end) => {
                self.state
                    .event_listeners
                    .retain(|(handle, _)| handle.pid != end.process.pid);
            }
            Message::EventAssassination(assassination) => {
                self.assassinate(&assassination);
            }
            Message::ShutdownRequest { .. } => self.initiate_shutdown(),
            Message::ServiceCall(call) => self.admin_call(&envelope, call),
            Message::SignalTimeout => self.handle_timeout(),
            Message::Poke => {}
            other => {
                debug!(message_type = %other.message_type(), "unhandled message - action: discard");
            }
        }
    }

    // -- connect ----------------------------------------------------------

    #[instrument(skip_all, fields(pid = %request.process.pid, path = %request.path))]
    fn connect(&mut self, envelope: &Envelope, request: ProcessConnectRequest) {
        if self.state.runlevel == Runlevel::Shutdown {
            self.reply(
                envelope,
                request.process,
                Message::DomainProcessConnectReply(ProcessConnectReply {
                    directive: ConnectDirective::Shutdown,
                }),
            );
            return;
        }

        if let Some(identity) = request.identity {
            if self.state.singletons.contains_key(&identity) {
                error!(%identity, "only one instance is allowed per identity");
                self.reply(
                    envelope,
                    request.process,
                    Message::DomainProcessConnectReply(ProcessConnectReply {
                        directive: ConnectDirective::Singleton,
                    }),
                );
                return;
            }
            self.state.singletons.insert(identity, request.process);
            if let Some(variable) = crate::process::environment::variable(identity) {
                self.environment.set_handle(variable, request.process);
            }
        }

        self.reply(
            envelope,
            request.process,
            Message::DomainProcessConnectReply(ProcessConnectReply {
                directive: ConnectDirective::Start,
            }),
        );

        // after the reply, so the connecting manager is past its handshake
        // when this lands
        if request.identity == Some(identity::SERVICE_MANAGER) {
            self.advertise_admin_services(request.process);
        }

        self.state
            .processes
            .insert(request.process.pid, request.process);
        debug!("process registered");

        self.drain_pending_lookups();
    }

    fn drain_pending_lookups(&mut self) {
        let mut remaining = Vec::new();
        for parked in std::mem::take(&mut self.state.pending_lookups) {
            let resolved = match (parked.identity, parked.pid) {
                (Some(identity), _) => self.state.singletons.get(&identity).copied(),
                (None, Some(pid)) => self.state.processes.get(&pid).copied(),
                (None, None) => None,
            };
            match resolved {
                Some(process) => {
                    let reply = Envelope {
                        correlation: parked.correlation,
                        execution: parked.execution,
                        message: Message::DomainProcessLookupReply(ProcessLookupReply {
                            identity: parked.identity,
                            process: Some(process),
                        }),
                    };
                    if let Err(send_error) =
                        self.state
                            .pending_sends
                            .send(&self.bus, parked.reply_to.ipc, &reply)
                    {
                        warn!(error = %send_error, "failed to answer parked lookup");
                    }
                }
                None => remaining.push(parked),
            }
        }
        self.state.pending_lookups = remaining;
    }

    // -- lookup -----------------------------------------------------------

    fn lookup(&mut self, envelope: &Envelope, request: ProcessLookupRequest) {
        let resolved = match (request.identity, request.pid) {
            (Some(identity), _) => self.state.singletons.get(&identity).copied(),
            (None, Some(pid)) => self.state.processes.get(&pid).copied(),
            (None, None) => {
                error!("lookup request without identity or pid - action: discard");
                return;
            }
        };

        match (resolved, request.directive) {
            (Some(_), _) | (None, LookupDirective::Direct) => {
                self.reply(
                    envelope,
                    request.process,
                    Message::DomainProcessLookupReply(ProcessLookupReply {
                        identity: request.identity,
                        process: resolved,
                    }),
                );
            }
            (None, LookupDirective::Wait) => {
                self.state.pending_lookups.push(ParkedLookup {
                    reply_to: request.process,
                    correlation: envelope.correlation,
                    execution: envelope.execution,
                    identity: request.identity,
                    pid: request.pid,
                });
            }
        }
    }

    // -- scaling ----------------------------------------------------------

    #[instrument(skip(self))]
    fn scale(&mut self, scale: &ScaleExecutable) {
        let Some(executable) = self.state.executable_mut(&scale.alias) else {
            warn!(alias = %scale.alias, "failed to locate alias - action: discard");
            return;
        };
        executable.configured_instances = scale.instances;
        let current = executable.instances.len();

        if current < scale.instances {
            self.scale_out(&scale.alias.clone());
        } else if current > scale.instances {
            let excess: Vec<Pid> = self
                .state
                .executable_mut(&scale.alias)
                .map(|executable| executable.instances[scale.instances..].to_vec())
                .unwrap_or_default();
            self.scale_in(&excess);
        }
    }

    fn scale_out(&mut self, alias: &Alias) {
        let Some(factory) = self.state.registry.resolve(alias) else {
            error!(%alias, "no implementation registered - action: skip");
            return;
        };
        let (configured, current) = match self.state.executable_mut(alias) {
            Some(executable) => (executable.configured_instances, executable.instances.len()),
            None => return,
        };

        let mut spawned = Vec::new();
        for _ in current..configured {
            let pid = Pid::allocate();
            let context = InstanceContext {
                pid,
                alias: alias.clone(),
                bus: Arc::clone(&self.bus),
                environment: Arc::clone(&self.environment),
                domain_manager: self.handle.ipc,
            };
            let running = spawn::spawn(&factory, context, self.exits_tx.clone());
            self.state.running.insert(pid, running);
            self.state.alias_of.insert(pid, alias.clone());
            if let Some(executable) = self.state.executable_mut(alias) {
                executable.instances.push(pid);
            }
            spawned.push(pid);
            debug!(%alias, %pid, "instance spawned");
        }

        if !spawned.is_empty() {
            self.fan_out_event(&Message::EventProcessSpawn(event::ProcessSpawn {
                alias: alias.clone(),
                pids: spawned,
            }));
        }
    }

    /// Cooperative scale-in: unadvertise through the service manager first,
    /// then ask the instances to shut down, with a bounded grace period.
    fn scale_in(&mut self, pids: &[Pid]) {
        let connected: Vec<ProcessHandle> = pids
            .iter()
            .filter_map(|pid| self.state.processes.get(pid).copied())
            .collect();
        let unconnected: Vec<Pid> = pids
            .iter()
            .filter(|pid| !self.state.processes.contains_key(pid))
            .copied()
            .collect();

        // never connected; all we can do is terminate
        for pid in unconnected {
            if let Some(running) = self.state.running.get(&pid) {
                running.terminate();
            }
        }

        if connected.is_empty() {
            return;
        }

        match self
            .state
            .singletons
            .get(&identity::SERVICE_MANAGER)
            .copied()
        {
            Some(service_manager) => {
                let request = Envelope::new(Message::DomainProcessPrepareShutdownRequest(
                    ProcessPrepareShutdownRequest {
                        process: self.handle,
                        processes: connected,
                    },
                ));
                self.send(service_manager.ipc, &request);
            }
            None => {
                for process in connected {
                    self.shutdown_instance(process.pid);
                }
            }
        }
    }

    fn prepare_shutdown_reply(&mut self, reply: ProcessPrepareShutdownReply) {
        for process in reply.processes {
            self.shutdown_instance(process.pid);
        }
    }

    fn shutdown_instance(&mut self, pid: Pid) {
        if let Some(process) = self.state.processes.get(&pid).copied() {
            let request = Envelope::new(Message::ShutdownRequest { reply: false });
            self.send(process.ipc, &request);
            self.state.graces.push(Grace {
                pid,
                deadline: Instant::now() + boot::SHUTDOWN_GRACE,
            });
        } else if let Some(running) = self.state.running.get(&pid) {
            running.terminate();
        }
    }

    // -- exit -------------------------------------------------------------

    #[instrument(skip(self), fields(pid = %exit.pid))]
    fn handle_exit(&mut self, exit: Exit) {
        match exit.reason {
            ExitReason::Core => error!(reason = ?exit.reason, "process cored"),
            _ => info!(reason = ?exit.reason, "process exited"),
        }

        let alias = self.state.alias_of.get(&exit.pid).cloned();
        if let Some(handle) = self.state.remove_process(exit.pid) {
            self.state.pending_sends.discard(handle.ipc);
        }

        self.fan_out_event(&Message::EventProcessExit(event::ProcessExit { exit }));

        // restart policy
        if self.state.runlevel == Runlevel::Running {
            if let Some(alias) = alias {
                let wants_restart = self.state.executable_mut(&alias).is_some_and(|executable| {
                    executable.restart
                        && executable.instances.len() < executable.configured_instances
                });
                if wants_restart {
                    info!(%alias, "restart configured - action: spawn replacement");
                    self.scale_out(&alias);
                }
            }
        }
    }

    /// A reserved call overran its execution timeout. Under `kill` the
    /// domain terminates the instance; under `linger` only the event is
    /// fanned out.
    fn assassinate(&mut self, assassination: &event::Assassination) {
        self.fan_out_event(&Message::EventAssassination(*assassination));
        if assassination.contract == crate::message::service::TimeoutContract::Kill {
            if let Some(running) = self.state.running.get(&assassination.target) {
                warn!(target = %assassination.target, "assassination contract - action: terminate");
                running.terminate();
            }
        }
    }

    fn fan_out_event(&mut self, message: &Message) {
        let message_type = message.message_type();
        let listeners: Vec<ProcessHandle> = self
            .state
            .event_listeners
            .iter()
            .filter(|(_, types)| types.is_empty() || types.contains(&message_type))
            .map(|(handle, _)| *handle)
            .collect();
        for listener in listeners {
            let envelope = Envelope::new(message.clone());
            self.send(listener.ipc, &envelope);
        }
    }

    // -- boot / shutdown progression --------------------------------------

    fn advance_tasks(&mut self) {
        loop {
            if self.state.tasks.front().is_none() {
                if self.state.runlevel == Runlevel::Startup {
                    self.state.runlevel = Runlevel::Running;
                    info!(domain = %self.state.name, "domain is on-line");
                    let _ = self.runlevel_tx.send(Runlevel::Running);
                }
                return;
            }

            let needs_start = self
                .state
                .tasks
                .front()
                .is_some_and(|task| !task.started);
            if needs_start {
                let (kind, aliases, group) = {
                    let task = self
                        .state
                        .tasks
                        .front_mut()
                        .unwrap_or_else(|| unreachable!("checked non-empty above"));
                    task.started = true;
                    task.deadline = Some(Instant::now() + boot::BOOT_BATCH_DEADLINE);
                    (task.kind, task.aliases.clone(), task.group.clone())
                };
                match kind {
                    TaskKind::Boot => {
                        info!(%group, "boot group");
                        for alias in &aliases {
                            self.scale_out(alias);
                        }
                    }
                    TaskKind::Shutdown => {
                        info!(%group, "shutdown group");
                        let pids: Vec<Pid> = aliases
                            .iter()
                            .filter_map(|alias| {
                                self.state
                                    .executables
                                    .iter()
                                    .find(|executable| &executable.alias == alias)
                            })
                            .flat_map(|executable| executable.instances.clone())
                            .filter(|pid| *pid != self.handle.pid)
                            .collect();
                        self.scale_in(&pids);
                    }
                }
            }

            let done = match self.state.tasks.front() {
                Some(task) if task.kind == TaskKind::Boot => self.state.batch_online(task),
                Some(task) => self.state.batch_offline(task),
                None => return,
            };
            if done {
                self.state.tasks.pop_front();
            } else {
                return;
            }
        }
    }

    fn initiate_shutdown(&mut self) {
        if self.state.runlevel == Runlevel::Shutdown {
            return;
        }
        info!(domain = %self.state.name, "domain shutdown begin");
        self.state.runlevel = Runlevel::Shutdown;

        for executable in &mut self.state.executables {
            executable.configured_instances = 0;
        }

        let managers = self.manager_aliases();
        let boot = boot::boot_batches(&self.state.configuration, managers).unwrap_or_default();
        self.state.tasks.clear();
        self.state.tasks.extend(boot::shutdown_batches(&boot));
    }

    fn manager_aliases(&self) -> Vec<Alias> {
        // core managers are executables that are not configured servers
        self.state
            .executables
            .iter()
            .filter(|executable| {
                !self
                    .state
                    .configuration
                    .servers
                    .iter()
                    .any(|server| server.alias == executable.alias)
            })
            .map(|executable| executable.alias.clone())
            .collect()
    }

    fn handle_timeout(&mut self) {
        let now = Instant::now();

        // expired graces: cooperative shutdown becomes termination
        let expired: Vec<Pid> = self
            .state
            .graces
            .iter()
            .filter(|grace| grace.deadline <= now)
            .map(|grace| grace.pid)
            .collect();
        for pid in expired {
            if let Some(running) = self.state.running.get(&pid) {
                warn!(%pid, "grace period expired - action: terminate");
                running.terminate();
            }
            self.state.graces.retain(|grace| grace.pid != pid);
        }

        // expired batch deadline
        let expired_batch = self.state.tasks.front().is_some_and(|task| {
            task.started && task.deadline.is_some_and(|deadline| deadline <= now)
        });
        if !expired_batch {
            return;
        }
        let Some(task) = self.state.tasks.front() else {
            return;
        };
        match task.kind {
            TaskKind::Boot => {
                error!(group = %task.group,
                    "failed to boot group within its deadline - action: shutdown");
                self.initiate_shutdown();
            }
            TaskKind::Shutdown => {
                warn!(group = %task.group,
                    "group did not shut down within its deadline - action: terminate");
                let pids: Vec<Pid> = task
                    .aliases
                    .iter()
                    .filter_map(|alias| {
                        self.state
                            .executables
                            .iter()
                            .find(|executable| &executable.alias == alias)
                    })
                    .flat_map(|executable| executable.instances.clone())
                    .collect();
                for pid in pids {
                    if let Some(running) = self.state.running.get(&pid) {
                        running.terminate();
                    }
                }
                // push the deadline out so the timer does not spin while the
                // terminations propagate
                if let Some(task) = self.state.tasks.front_mut() {
                    task.deadline = Some(now + boot::SHUTDOWN_GRACE);
                }
            }
        }
    }

    // -- admin services ---------------------------------------------------

    fn advertise_admin_services(&mut self, service_manager: ProcessHandle) {
        let services = [ADMIN_STATE, ADMIN_SCALE, ADMIN_SHUTDOWN]
            .iter()
            .filter_map(|name| ServiceName::try_new(*name).ok())
            .map(|name| Service {
                name,
                category: "admin".into(),
                transaction: crate::message::service::TransactionMode::None,
                timeout: None,
            })
            .collect();

        let advertise = Envelope::new(Message::ServiceAdvertise(Advertise {
            process: self.handle,
            add: services,
            remove: Vec::new(),
            reset: false,
        }));
        self.send(service_manager.ipc, &advertise);
    }

    fn admin_call(&mut self, envelope: &Envelope, call: Call) {
        let name = call.service.to_string();
        let reply = match name.as_str() {
            ADMIN_STATE => Reply {
                code: None,
                trid: None,
                payload: serde_json::to_vec(&self.state.snapshot()).unwrap_or_default(),
            },
            ADMIN_SCALE => match serde_json::from_slice::<ScaleRequest>(&call.payload)
                .ok()
                .and_then(|request| {
                    Alias::try_new(request.alias)
                        .ok()
                        .map(|alias| (alias, request.instances))
                }) {
                Some((alias, instances)) => {
                    self.scale(&ScaleExecutable { alias, instances });
                    Reply {
                        code: None,
                        trid: None,
                        payload: Vec::new(),
                    }
                }
                None => Reply::error(crate::error::ErrorKind::InvalidSemantics),
            },
            ADMIN_SHUTDOWN => {
                self.initiate_shutdown();
                Reply {
                    code: None,
                    trid: None,
                    payload: Vec::new(),
                }
            }
            _ => Reply::error(crate::error::ErrorKind::NoEntry),
        };

        if !call.no_reply {
            let response = envelope.reverse(Message::ServiceReply(reply));
            self.send(call.process.ipc, &response);
        }
        self.acknowledge_admin_call(&call);
    }

    fn acknowledge_admin_call(&mut self, call: &Call) {
        let Some(service_manager) = self
            .state
            .singletons
            .get(&identity::SERVICE_MANAGER)
            .copied()
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

    fn reply(&mut self, request: &Envelope, to: ProcessHandle, message: Message) {
        let envelope = request.reverse(message);
        self.send(to.ipc, &envelope);
    }

    fn send(&mut self, to: IpcId, envelope: &Envelope) {
        if let Err(error) = self.state.pending_sends.send(&self.bus, to, envelope) {
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
