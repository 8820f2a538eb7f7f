//! # Casual - XATMI-style transaction-processing middleware
//!
//! The core coordination fabric of a casual domain: a domain manager
//! supervising a dependency-ordered boot graph, a service manager reserving
//! sequential instances and queueing pending lookups, a two-phase-commit
//! transaction manager with a persistent log, persistent transactional
//! queues, and TCP gateways bridging domains with discovery and
//! end-to-end-preserved XIDs.
//!
//! Each manager is single-threaded cooperative: one event loop over its
//! inbound device, handlers running to completion against the live state,
//! all waiting expressed as correlated pending records. Cross-manager
//! concurrency is message passing only.
//!
//! ```no_run
//! use casual::configuration::Model;
//! use casual::domain_types::ServiceName;
//! use casual::runtime::Builder;
//!
//! # async fn demo() -> casual::error::Result<()> {
//! let domain = Builder::new(Model::named("example"))
//!     .with_server("example-server", casual::example::echo_server())
//!     .boot()
//!     .await?;
//!
//! let mut session = domain.session().await?;
//! let echo = ServiceName::try_new("casual/example/echo").expect("valid name");
//! let reply = session.call(&echo, b"casual\n".to_vec()).await?;
//! assert_eq!(reply.expect("echo answers"), b"casual\n");
//!
//! domain.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod admin;
pub mod client;
pub mod configuration;
pub mod domain;
pub mod domain_types;
pub mod error;
pub mod example;
pub mod forward;
pub mod gateway;
pub mod message;
pub mod process;
pub mod queue;
pub mod runtime;
pub mod server;
pub mod service;
pub mod transaction;
pub mod transport;
pub mod xa;
