//! Domain runtime
//!
//! Assembles a domain: the bus, the domain manager with its spawn registry,
//! the core managers, queue groups, resource proxies, forward workers and
//! user servers. The builder is the embedding surface for binaries and
//! tests; a booted [`Domain`] hands out caller sessions.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use crate::client::Session;
use crate::configuration::Model;
use crate::domain::spawn::Registry;
use crate::domain::state::Runlevel;
use crate::domain::{Environment, Manager};
use crate::domain_types::{Alias, ResourceId};
use crate::error::{CasualError, Result};
use crate::message::{Envelope, Message};
use crate::process::ProcessHandle;
use crate::server;
use crate::transaction::proxy;
use crate::transport::bus::Bus;

/// Alias of the service manager
pub const SERVICE_MANAGER_ALIAS: &str = "casual-service-manager";
/// Alias of the transaction manager
pub const TRANSACTION_MANAGER_ALIAS: &str = "casual-transaction-manager";
/// Alias of the queue manager
pub const QUEUE_MANAGER_ALIAS: &str = "casual-queue-manager";
/// Alias of the gateway manager
pub const GATEWAY_MANAGER_ALIAS: &str = "casual-gateway-manager";
/// Alias of the forward cache
pub const FORWARD_CACHE_ALIAS: &str = "casual-forward-cache";

/// Builds and boots a domain
pub struct Builder {
    model: Model,
    registry: Registry,
    behaviors: Vec<(String, Arc<dyn proxy::Behavior>, Option<Arc<proxy::Journal>>)>,
}

impl Builder {
    /// Starts from a configuration model
    #[must_use]
    pub fn new(model: Model) -> Self {
        Self {
            model,
            registry: Registry::new(),
            behaviors: Vec::new(),
        }
    }

    /// Registers a sequential server implementation under an alias; the
    /// alias is added to the model when not already configured
    #[must_use]
    pub fn with_server(mut self, alias: &str, services: Vec<server::Entry>) -> Self {
        let Ok(alias) = Alias::try_new(alias) else {
            return self;
        };
        if !self
            .model
            .servers
            .iter()
            .any(|server| server.alias == alias)
        {
            self.model.servers.push(crate::configuration::Server {
                alias: alias.clone(),
                instances: 1,
                memberships: Vec::new(),
                restart: false,
            });
        }
        self.registry.register(alias, move |context| {
            let services = services.clone();
            server::run(context, services)
        });
        self
    }

    /// Overrides the behavior of a configured resource (tests inject
    /// journals and misbehaving resources this way)
    #[must_use]
    pub fn with_resource(
        mut self,
        name: &str,
        behavior: Arc<dyn proxy::Behavior>,
        journal: Option<Arc<proxy::Journal>>,
    ) -> Self {
        self.behaviors.push((name.to_string(), behavior, journal));
        self
    }

    /// Boots the domain and waits for it to come on-line
    ///
    /// # Errors
    ///
    /// Fails when the configuration is invalid or the boot ends in
    /// shutdown (a group missed its deadline).
    pub async fn boot(self) -> Result<Domain> {
        let Self {
            mut model,
            mut registry,
            behaviors,
        } = self;

        let bus = Bus::new();

        // core managers, always booted first
        registry.register(manager_alias(SERVICE_MANAGER_ALIAS), crate::service::run);
        registry.register(
            manager_alias(TRANSACTION_MANAGER_ALIAS),
            crate::transaction::run,
        );
        registry.register(manager_alias(QUEUE_MANAGER_ALIAS), crate::queue::manager::run);
        registry.register(manager_alias(GATEWAY_MANAGER_ALIAS), crate::gateway::run);
        registry.register(manager_alias(FORWARD_CACHE_ALIAS), crate::forward::run);

        // resource proxies: one configured server per resource
        for (index, resource) in model.transaction.resources.clone().iter().enumerate() {
            let id = ResourceId::new(index as u64 + 1);
            let (behavior, journal) = behaviors
                .iter()
                .find(|(name, _, _)| *name == resource.name)
                .map_or(
                    (
                        Arc::new(proxy::WellBehaved) as Arc<dyn proxy::Behavior>,
                        None,
                    ),
                    |(_, behavior, journal)| (Arc::clone(behavior), journal.clone()),
                );
            let alias = format!("rm-{}", resource.name);
            if let Ok(alias) = Alias::try_new(alias) {
                model.servers.push(crate::configuration::Server {
                    alias: alias.clone(),
                    instances: resource.instances,
                    memberships: Vec::new(),
                    restart: true,
                });
                registry.register(alias, move |context| {
                    proxy::run(context, id, Arc::clone(&behavior), journal.clone())
                });
            }
        }

        // queue groups
        for group in model.queue.groups.clone() {
            let alias = format!("queue-group-{}", group.name);
            if let Ok(alias) = Alias::try_new(alias) {
                model.servers.push(crate::configuration::Server {
                    alias: alias.clone(),
                    instances: 1,
                    memberships: Vec::new(),
                    restart: false,
                });
                let name = group.name.clone();
                let store = group.store.clone();
                registry.register(alias, move |context| {
                    crate::queue::group::run(context, name.clone(), store.clone())
                });
            }
        }

        // forward workers
        for (index, forward) in model.queue.forwards.clone().iter().enumerate() {
            let alias = format!("queue-forward-{index}");
            if let Ok(alias) = Alias::try_new(alias) {
                model.servers.push(crate::configuration::Server {
                    alias: alias.clone(),
                    instances: 1,
                    memberships: Vec::new(),
                    restart: false,
                });
                let forward = forward.clone();
                registry.register(alias, move |context| {
                    crate::queue::forward::run(context, forward.clone())
                });
            }
        }

        let managers = [
            SERVICE_MANAGER_ALIAS,
            TRANSACTION_MANAGER_ALIAS,
            QUEUE_MANAGER_ALIAS,
            GATEWAY_MANAGER_ALIAS,
            FORWARD_CACHE_ALIAS,
        ]
        .iter()
        .map(|alias| manager_alias(alias))
        .collect();

        let (manager, mut runlevel) =
            Manager::new(model.clone(), registry, managers, Arc::clone(&bus))?;
        let environment = manager.environment();
        let handle = manager.handle();

        // configuration travels to the managers through the environment
        environment.set(
            crate::service::CONFIGURED_SERVICES,
            serde_json::to_string(&model.services).unwrap_or_else(|_| "[]".into()),
        );
        environment.set(
            crate::transaction::CONFIGURATION,
            serde_json::to_string(&crate::transaction::Configuration {
                log: model.transaction.log.clone(),
                resources: model
                    .transaction
                    .resources
                    .iter()
                    .enumerate()
                    .map(|(index, resource)| {
                        (index as u64 + 1, resource.name.clone(), resource.instances)
                    })
                    .collect(),
            })
            .unwrap_or_default(),
        );
        environment.set(
            crate::queue::manager::CONFIGURATION,
            serde_json::to_string(&model.queue).unwrap_or_else(|_| "{}".into()),
        );
        environment.set(
            crate::gateway::CONFIGURATION,
            serde_json::to_string(&model.gateway).unwrap_or_else(|_| "{}".into()),
        );

        let task = tokio::spawn(manager.run());

        // wait for the boot outcome
        loop {
            match *runlevel.borrow() {
                Runlevel::Running => break,
                Runlevel::Shutdown => {
                    return Err(CasualError::InvalidSemantics {
                        reason: "domain boot failed".into(),
                    });
                }
                Runlevel::Startup => {}
            }
            if runlevel.changed().await.is_err() {
                return Err(CasualError::InvalidSemantics {
                    reason: "domain manager ended during boot".into(),
                });
            }
        }

        info!(domain = %model.name, "domain booted");
        Ok(Domain {
            bus,
            environment,
            manager: handle,
            runlevel,
            task,
        })
    }
}

fn manager_alias(name: &str) -> Alias {
    Alias::try_new(name).unwrap_or_else(|_| unreachable!("static alias is valid"))
}

/// A booted domain
pub struct Domain {
    bus: Arc<Bus>,
    environment: Arc<Environment>,
    manager: ProcessHandle,
    runlevel: watch::Receiver<Runlevel>,
    task: tokio::task::JoinHandle<()>,
}

impl Domain {
    /// The domain's bus, for embedding callers
    #[must_use]
    pub fn bus(&self) -> Arc<Bus> {
        Arc::clone(&self.bus)
    }

    /// The domain's environment
    #[must_use]
    pub fn environment(&self) -> Arc<Environment> {
        Arc::clone(&self.environment)
    }

    /// Connects a caller session
    ///
    /// # Errors
    ///
    /// Fails when the domain refuses the connect.
    pub async fn session(&self) -> Result<Session> {
        Session::connect(self.bus(), self.environment()).await
    }

    /// Completes when the domain has gone down (admin shutdown or boot
    /// failure)
    pub async fn terminated(&mut self) {
        while *self.runlevel.borrow() != Runlevel::Shutdown {
            if self.runlevel.changed().await.is_err() {
                break;
            }
        }
    }

    /// Initiates graceful shutdown and waits for the domain to be down
    pub async fn shutdown(mut self) {
        let shutdown = Envelope::new(Message::ShutdownRequest { reply: false });
        let mut sends = crate::transport::pending::Holder::new();
        let _ = sends.send(&self.bus, self.manager.ipc, &shutdown);
        sends.flush(&self.bus);

        // the runlevel flips to shutdown and the manager task ends
        while *self.runlevel.borrow() != Runlevel::Shutdown {
            if self.runlevel.changed().await.is_err() {
                break;
            }
        }
        let _ = (&mut self.task).await;
    }
}

impl Drop for Domain {
    fn drop(&mut self) {
        self.task.abort();
    }
}
