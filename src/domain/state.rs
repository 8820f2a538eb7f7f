//! Domain manager state
//!
//! Flat keyed collections; cross-references are pids and aliases, never
//! pointers. Mutation happens only inside message handlers.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use serde::Serialize;
use uuid::Uuid;

use crate::configuration;
use crate::domain_types::{Alias, Correlation, DomainId, DomainName, Execution, Pid};
use crate::message::MessageType;
use crate::process::ProcessHandle;
use crate::transport::pending;

use super::spawn::{Registry, Running};

/// Lifecycle stage of the domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Runlevel {
    /// Booting the configured groups
    Startup,
    /// All groups booted; normal operation
    Running,
    /// Walking the reverse boot order down
    Shutdown,
}

/// A configured executable and its running instances
#[derive(Debug)]
pub struct Executable {
    /// Alias, resolved through the spawn registry
    pub alias: Alias,
    /// Target instance count
    pub configured_instances: usize,
    /// Boot groups this executable belongs to
    pub memberships: Vec<String>,
    /// Respawn on exit while the domain is running
    pub restart: bool,
    /// Pids of running (or starting) instances
    pub instances: Vec<Pid>,
}

/// What a batch task is doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Waiting for every member to connect
    Boot,
    /// Waiting for every member to exit
    Shutdown,
}

/// One batch of the boot or shutdown order
#[derive(Debug)]
pub struct BatchTask {
    /// Boot or shutdown
    pub kind: TaskKind,
    /// Group the batch came from
    pub group: String,
    /// Member aliases
    pub aliases: Vec<Alias>,
    /// Deadline for the whole batch; set when the batch starts
    pub deadline: Option<Instant>,
    /// Whether the batch has been started
    pub started: bool,
}

/// A `wait` lookup parked until a matching connect arrives
#[derive(Debug)]
pub struct ParkedLookup {
    /// Where the reply goes
    pub reply_to: ProcessHandle,
    /// Correlation of the request
    pub correlation: Correlation,
    /// Execution of the request
    pub execution: Execution,
    /// Identity being waited for
    pub identity: Option<Uuid>,
    /// Pid being waited for
    pub pid: Option<Pid>,
}

/// A cooperative shutdown in flight: terminate when the grace expires
#[derive(Debug)]
pub struct Grace {
    /// Instance being shut down
    pub pid: Pid,
    /// Hard-termination point
    pub deadline: Instant,
}

/// The domain manager's state
pub struct State {
    /// Domain name
    pub name: DomainName,
    /// Domain identity
    pub identity: DomainId,
    /// Current runlevel
    pub runlevel: Runlevel,
    /// The booted configuration
    pub configuration: configuration::Model,
    /// Spawnable implementations
    pub registry: Registry,
    /// Configured executables
    pub executables: Vec<Executable>,
    /// Every registered process
    pub processes: HashMap<Pid, ProcessHandle>,
    /// Registered singleton identities
    pub singletons: HashMap<Uuid, ProcessHandle>,
    /// Supervision handles of spawned instances
    pub running: HashMap<Pid, Running>,
    /// Alias each spawned pid belongs to
    pub alias_of: HashMap<Pid, Alias>,
    /// Parked `wait` lookups
    pub pending_lookups: Vec<ParkedLookup>,
    /// Undeliverable sends, retried at idle
    pub pending_sends: pending::Holder,
    /// Event subscribers with their type filters (empty = all)
    pub event_listeners: Vec<(ProcessHandle, Vec<MessageType>)>,
    /// Boot/shutdown progression
    pub tasks: VecDeque<BatchTask>,
    /// Cooperative shutdowns awaiting exit
    pub graces: Vec<Grace>,
}

impl State {
    /// Builds initial state from a configuration model
    #[must_use]
    pub fn new(configuration: configuration::Model, registry: Registry) -> Self {
        let executables = configuration
            .servers
            .iter()
            .map(|server| Executable {
                alias: server.alias.clone(),
                configured_instances: server.instances,
                memberships: server.memberships.clone(),
                restart: server.restart,
                instances: Vec::new(),
            })
            .collect();

        Self {
            name: configuration.name.clone(),
            identity: DomainId::generate(),
            runlevel: Runlevel::Startup,
            configuration,
            registry,
            executables,
            processes: HashMap::new(),
            singletons: HashMap::new(),
            running: HashMap::new(),
            alias_of: HashMap::new(),
            pending_lookups: Vec::new(),
            pending_sends: pending::Holder::new(),
            event_listeners: Vec::new(),
            tasks: VecDeque::new(),
            graces: Vec::new(),
        }
    }

    /// Finds a configured executable by alias
    pub fn executable_mut(&mut self, alias: &Alias) -> Option<&mut Executable> {
        self.executables
            .iter_mut()
            .find(|executable| &executable.alias == alias)
    }

    /// Removes every trace of a pid; returns its handle if it was registered
    pub fn remove_process(&mut self, pid: Pid) -> Option<ProcessHandle> {
        self.running.remove(&pid);
        self.alias_of.remove(&pid);
        self.singletons.retain(|_, handle| handle.pid != pid);
        self.event_listeners.retain(|(handle, _)| handle.pid != pid);
        self.pending_lookups.retain(|parked| parked.reply_to.pid != pid);
        self.graces.retain(|grace| grace.pid != pid);
        for executable in &mut self.executables {
            executable.instances.retain(|instance| *instance != pid);
        }
        self.processes.remove(&pid)
    }

    /// Whether every instance of the current boot batch has connected
    #[must_use]
    pub fn batch_online(&self, task: &BatchTask) -> bool {
        task.aliases.iter().all(|alias| {
            self.executables
                .iter()
                .filter(|executable| &executable.alias == alias)
                .all(|executable| {
                    executable.instances.len() >= executable.configured_instances
                        && executable
                            .instances
                            .iter()
                            .all(|pid| self.processes.contains_key(pid))
                })
        })
    }

    /// Whether every instance of the current shutdown batch has exited
    #[must_use]
    pub fn batch_offline(&self, task: &BatchTask) -> bool {
        task.aliases.iter().all(|alias| {
            self.executables
                .iter()
                .filter(|executable| &executable.alias == alias)
                .all(|executable| executable.instances.is_empty())
        })
    }

    /// Earliest outstanding deadline: current batch or shutdown graces
    #[must_use]
    pub fn earliest_deadline(&self) -> Option<Instant> {
        let batch = self
            .tasks
            .front()
            .and_then(|task| task.deadline);
        let grace = self.graces.iter().map(|grace| grace.deadline).min();
        match (batch, grace) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

/// Serializable snapshot for the admin surface
#[derive(Debug, Serialize)]
pub struct Snapshot {
    /// Domain name
    pub name: String,
    /// Current runlevel
    pub runlevel: Runlevel,
    /// Executables with configured and running counts
    pub executables: Vec<ExecutableSnapshot>,
    /// Registered singleton identities
    pub singletons: Vec<SingletonSnapshot>,
}

/// Executable part of the snapshot
#[derive(Debug, Serialize)]
pub struct ExecutableSnapshot {
    /// Alias
    pub alias: String,
    /// Target instance count
    pub configured: usize,
    /// Running pids
    pub instances: Vec<u64>,
    /// Restart policy
    pub restart: bool,
}

/// Singleton part of the snapshot
#[derive(Debug, Serialize)]
pub struct SingletonSnapshot {
    /// Identity
    pub identity: String,
    /// Owning pid
    pub pid: u64,
}

impl State {
    /// Takes an admin snapshot
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            name: self.name.to_string(),
            runlevel: self.runlevel,
            executables: self
                .executables
                .iter()
                .map(|executable| ExecutableSnapshot {
                    alias: executable.alias.to_string(),
                    configured: executable.configured_instances,
                    instances: executable
                        .instances
                        .iter()
                        .map(|pid| u64::from(*pid))
                        .collect(),
                    restart: executable.restart,
                })
                .collect(),
            singletons: self
                .singletons
                .iter()
                .map(|(identity, handle)| SingletonSnapshot {
                    identity: identity.to_string(),
                    pid: u64::from(handle.pid),
                })
                .collect(),
        }
    }
}
