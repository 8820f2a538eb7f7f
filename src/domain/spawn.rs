//! Instance spawning
//!
//! An instance is a supervised task: the domain manager resolves an alias
//! through the registry, spawns the body with its context, and observes the
//! outcome through an exit channel, the stand-in for SIGCHLD. Termination
//! aborts the task, which the watcher reports as a signaled exit.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::error;

use crate::domain_types::{Alias, IpcId, Pid};
use crate::error::Result;
use crate::process::{Exit, ExitReason};
use crate::transport::bus::Bus;

use super::environment::Environment;

/// Everything an instance needs to participate in the domain
#[derive(Clone)]
pub struct InstanceContext {
    /// The instance's pid
    pub pid: Pid,
    /// Alias it was spawned under
    pub alias: Alias,
    /// The domain's message bus
    pub bus: Arc<Bus>,
    /// The domain's environment
    pub environment: Arc<Environment>,
    /// Device of the domain manager, for connect and lookup
    pub domain_manager: IpcId,
}

/// The running body of an instance
pub type InstanceFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Produces an instance body from its context
pub type InstanceFactory = Arc<dyn Fn(InstanceContext) -> InstanceFuture + Send + Sync>;

/// Alias-to-implementation registry.
///
/// Built-in manager aliases are registered by the runtime; user servers by
/// the embedding application or test.
#[derive(Default, Clone)]
pub struct Registry {
    factories: HashMap<Alias, InstanceFactory>,
}

impl Registry {
    /// Creates an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory under an alias; the last registration wins
    pub fn register<F, Fut>(&mut self, alias: Alias, factory: F)
    where
        F: Fn(InstanceContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.factories
            .insert(alias, Arc::new(move |context| Box::pin(factory(context))));
    }

    /// Resolves an alias
    #[must_use]
    pub fn resolve(&self, alias: &Alias) -> Option<InstanceFactory> {
        self.factories.get(alias).cloned()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("aliases", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// A running, supervised instance
#[derive(Debug)]
pub struct Running {
    worker: tokio::task::AbortHandle,
}

impl Running {
    /// Terminates the instance; the watcher reports a signaled exit
    pub fn terminate(&self) {
        self.worker.abort();
    }
}

impl Drop for Running {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

/// Spawns an instance and its exit watcher
pub fn spawn(
    factory: &InstanceFactory,
    context: InstanceContext,
    exits: mpsc::UnboundedSender<Exit>,
) -> Running {
    let pid = context.pid;
    let alias = context.alias.clone();
    let body = factory(context);

    let worker: JoinHandle<()> = tokio::spawn(async move {
        if let Err(failure) = body.await {
            error!(%pid, %alias, error = %failure, "instance failed");
            // propagate the failure through the exit reason
            panic!("instance {pid} failed: {failure}");
        }
    });
    let running = Running {
        worker: worker.abort_handle(),
    };

    tokio::spawn(async move {
        let reason = match worker.await {
            Ok(()) => ExitReason::Exited { code: 0 },
            Err(join_error) if join_error.is_cancelled() => ExitReason::Signaled { signal: 15 },
            Err(_) => ExitReason::Core,
        };
        // receiver gone means the domain manager itself is down
        let _ = exits.send(Exit { pid, reason });
    });

    running
}
