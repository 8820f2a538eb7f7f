//! Domain configuration model
//!
//! The input to a domain boot: groups with declared dependencies, servers
//! and their memberships, service properties and routes, transaction
//! resources, queue groups and forwards, gateway connections. The model is
//! plain data; file loading is a thin `serde_json` wrapper so a domain can
//! also be assembled programmatically (the unit-test path).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::domain_types::{
    Alias, DomainName, InstanceOrder, QueueName, RetryCount, RetryDelayMs, ServiceName,
};
use crate::error::{CasualError, Result};
use crate::message::service::{ExecutionTimeout, TimeoutContract};

/// A boot group; dependencies must form a DAG
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    /// Group name
    pub name: String,
    /// Groups that must be fully booted first
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// A configured server or executable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    /// Alias, resolved against the server registry at spawn time
    pub alias: Alias,
    /// Target number of instances
    #[serde(default = "default_instances")]
    pub instances: usize,
    /// Boot groups this server belongs to
    #[serde(default)]
    pub memberships: Vec<String>,
    /// Respawn on abnormal exit while the domain is running
    #[serde(default)]
    pub restart: bool,
}

fn default_instances() -> usize {
    1
}

/// Operator-configured service properties
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    /// Origin service name
    pub name: ServiceName,
    /// Execution timeout in milliseconds
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Reaction when the timeout fires
    #[serde(default)]
    pub contract: Contract,
    /// Aliases this service is also advertised under
    #[serde(default)]
    pub routes: Vec<ServiceName>,
}

/// Serializable mirror of [`TimeoutContract`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Contract {
    /// Report and let the instance continue
    #[default]
    Linger,
    /// Terminate the instance
    Kill,
}

impl Service {
    /// The execution timeout this configuration expresses, if any
    #[must_use]
    pub fn execution_timeout(&self) -> Option<ExecutionTimeout> {
        self.timeout_ms.map(|ms| ExecutionTimeout {
            duration: Duration::from_millis(ms),
            contract: match self.contract {
                Contract::Linger => TimeoutContract::Linger,
                Contract::Kill => TimeoutContract::Kill,
            },
        })
    }
}

/// An XA resource and its proxy pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    /// Resource name, for operators
    pub name: String,
    /// Number of proxy instances
    #[serde(default = "default_instances")]
    pub instances: usize,
}

/// Transaction manager configuration
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Transaction {
    /// Path of the persistent transaction log
    #[serde(default)]
    pub log: Option<PathBuf>,
    /// Configured XA resources
    #[serde(default)]
    pub resources: Vec<Resource>,
}

/// One queue of a group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Queue {
    /// Queue name
    pub name: QueueName,
    /// Redeliveries before the error queue takes the message
    #[serde(default)]
    pub retry_count: RetryCount,
    /// Rollback redelivery delay in milliseconds
    #[serde(default)]
    pub retry_delay: RetryDelayMs,
}

/// A queue group and its store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueGroup {
    /// Group name
    pub name: String,
    /// Store path; in-memory when absent
    #[serde(default)]
    pub store: Option<PathBuf>,
    /// Hosted queues
    pub queues: Vec<Queue>,
}

/// A service-forward worker: dequeue, call, enqueue reply, one transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Forward {
    /// Source queue
    pub source: QueueName,
    /// Service called with each message
    pub service: ServiceName,
    /// Optional reply queue
    #[serde(default)]
    pub reply: Option<QueueName>,
}

/// Queue manager configuration
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QueueManager {
    /// Queue groups of this domain
    #[serde(default)]
    pub groups: Vec<QueueGroup>,
    /// Service-forward workers
    #[serde(default)]
    pub forwards: Vec<Forward>,
}

/// One outbound connection of a group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundConnection {
    /// Peer address (`host:port`)
    pub address: String,
    /// Only these services are routed over this connection, when non-empty
    #[serde(default)]
    pub services: Vec<ServiceName>,
    /// Only these queues are routed over this connection, when non-empty
    #[serde(default)]
    pub queues: Vec<QueueName>,
}

/// A band of outbound connections with one priority order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundGroup {
    /// Priority of the band; lower is preferred
    #[serde(default)]
    pub order: InstanceOrder,
    /// Connections of the band
    pub connections: Vec<OutboundConnection>,
    /// Keep reconnecting on loss
    #[serde(default = "default_reconnect")]
    pub reconnect: bool,
    /// The peer initiates TCP; we listen and then use the socket outbound
    #[serde(default)]
    pub reverse: bool,
    /// Listen address for reverse outbound groups
    #[serde(default)]
    pub listener: Option<String>,
}

fn default_reconnect() -> bool {
    true
}

/// An inbound listener group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundGroup {
    /// Listen address (`host:port`); ephemeral port when 0
    #[serde(default)]
    pub listener: Option<String>,
    /// We initiate TCP towards these peers and then serve inbound over them
    #[serde(default)]
    pub connect: Vec<String>,
}

/// Gateway configuration
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Gateway {
    /// Inbound groups
    #[serde(default)]
    pub inbound: Vec<InboundGroup>,
    /// Outbound groups, in declaration order
    #[serde(default)]
    pub outbound: Vec<OutboundGroup>,
}

/// The whole domain model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Model {
    /// Domain name
    pub name: DomainName,
    /// Boot groups
    #[serde(default)]
    pub groups: Vec<Group>,
    /// Servers and executables
    #[serde(default)]
    pub servers: Vec<Server>,
    /// Service properties and routes
    #[serde(default)]
    pub services: Vec<Service>,
    /// Transaction configuration
    #[serde(default)]
    pub transaction: Transaction,
    /// Queue configuration
    #[serde(default)]
    pub queue: QueueManager,
    /// Gateway configuration
    #[serde(default)]
    pub gateway: Gateway,
}

impl Model {
    /// A minimal model hosting nothing but the core managers
    ///
    /// # Panics
    ///
    /// Never panics; the embedded name is statically valid.
    #[must_use]
    pub fn named(name: &str) -> Self {
        Self {
            name: DomainName::try_new(name).unwrap_or_else(|_| {
                DomainName::try_new("casual").expect("static domain name is valid")
            }),
            groups: Vec::new(),
            servers: Vec::new(),
            services: Vec::new(),
            transaction: Transaction::default(),
            queue: QueueManager::default(),
            gateway: Gateway::default(),
        }
    }

    /// Loads a model from a JSON file
    ///
    /// # Errors
    ///
    /// Fails on IO errors or a model that does not parse.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|error| CasualError::Configuration {
            field: path.display().to_string(),
            reason: error.to_string(),
        })
    }

    /// Validates cross-references: group dependencies and memberships must
    /// name declared groups
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming the first dangling reference.
    pub fn validate(&self) -> Result<()> {
        let known: std::collections::HashSet<&str> =
            self.groups.iter().map(|group| group.name.as_str()).collect();

        for group in &self.groups {
            for dependency in &group.dependencies {
                if !known.contains(dependency.as_str()) {
                    return Err(CasualError::Configuration {
                        field: format!("groups.{}.dependencies", group.name),
                        reason: format!("unknown group '{dependency}'"),
                    });
                }
            }
        }
        for server in &self.servers {
            for membership in &server.memberships {
                if !known.contains(membership.as_str()) {
                    return Err(CasualError::Configuration {
                        field: format!("servers.{}.memberships", server.alias),
                        reason: format!("unknown group '{membership}'"),
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_model_validates() {
        assert!(Model::named("a").validate().is_ok());
    }

    #[test]
    fn dangling_dependency_is_rejected() {
        let mut model = Model::named("a");
        model.groups.push(Group {
            name: "first".into(),
            dependencies: vec!["missing".into()],
        });
        assert!(model.validate().is_err());
    }

    #[test]
    fn dangling_membership_is_rejected() {
        let mut model = Model::named("a");
        model.servers.push(Server {
            alias: Alias::try_new("server-a").expect("valid alias"),
            instances: 1,
            memberships: vec!["missing".into()],
            restart: false,
        });
        assert!(model.validate().is_err());
    }

    #[test]
    fn model_round_trips_through_json() {
        let mut model = Model::named("round-trip");
        model.groups.push(Group {
            name: "base".into(),
            dependencies: vec![],
        });
        model.services.push(Service {
            name: ServiceName::try_new("casual/example/echo").expect("valid name"),
            timeout_ms: Some(2),
            contract: Contract::Kill,
            routes: vec![],
        });
        let json = serde_json::to_string(&model).expect("serializes");
        let parsed: Model = serde_json::from_str(&json).expect("parses");
        assert_eq!(parsed, model);
    }
}
