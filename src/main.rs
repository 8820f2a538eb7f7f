//! The `casual` driver
//!
//! Unified admin surface for a running domain, reached through its inbound
//! gateway. Output is JSON; exit code 0 means success, anything reported
//! exits non-zero.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use casual::admin::Remote;
use casual::domain_types::ServiceName;

#[derive(Parser)]
#[command(name = "casual", version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Administer a casual domain")]
struct Arguments {
    /// Address of the domain's inbound gateway (`host:port`)
    #[arg(long, short, default_value = "127.0.0.1:7771", global = true)]
    address: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Domain manager: state, scaling, shutdown
    Domain {
        /// Emit the domain state snapshot
        #[arg(long)]
        state: bool,
        /// Change the target instance count: `<alias> <instances>`
        #[arg(long, num_args = 2, value_names = ["ALIAS", "INSTANCES"])]
        scale_instances: Option<Vec<String>>,
        /// Initiate graceful domain shutdown
        #[arg(long)]
        shutdown: bool,
    },
    /// Service manager: registry snapshot, metric reset
    Service {
        /// Emit the service registry snapshot
        #[arg(long)]
        state: bool,
        /// Reset metrics; no names resets all
        #[arg(long, num_args = 0.., value_name = "SERVICE")]
        metric_reset: Option<Vec<String>>,
    },
    /// Transaction manager: coordinator snapshot
    Transaction {
        /// Emit the coordinator snapshot
        #[arg(long)]
        state: bool,
    },
    /// Queue manager: registry, maintenance
    Queue {
        /// List queues and their hosting groups
        #[arg(long)]
        list: bool,
        /// Move error-queue messages back to this queue
        #[arg(long, value_name = "QUEUE")]
        restore: Option<String>,
        /// Purge this queue
        #[arg(long, value_name = "QUEUE")]
        clear: Option<String>,
        /// List messages on this queue without consuming
        #[arg(long, value_name = "QUEUE")]
        messages: Option<String>,
    },
    /// Gateway manager: connection registry
    Gateway {
        /// Emit the connection registry
        #[arg(long)]
        state: bool,
        /// Re-run discovery on every outbound connection
        #[arg(long)]
        rediscover: bool,
    },
    /// Synchronous service call
    Call {
        /// Service to call
        #[arg(long)]
        service: String,
        /// Payload; read from stdin when absent
        #[arg(long)]
        payload: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("casual=warn".parse()?),
        )
        .init();

    let arguments = Arguments::parse();
    let mut remote = Remote::connect(&arguments.address)
        .await
        .with_context(|| format!("failed to reach domain at {}", arguments.address))?;

    match arguments.command {
        Command::Domain {
            state,
            scale_instances,
            shutdown,
        } => {
            if let Some(scale) = scale_instances {
                let instances: usize = scale[1].parse().context("instances must be a number")?;
                let payload = serde_json::to_vec(&serde_json::json!({
                    "alias": scale[0],
                    "instances": instances,
                }))?;
                admin_call(&mut remote, casual::domain::ADMIN_SCALE, payload).await?;
            } else if shutdown {
                admin_call(&mut remote, casual::domain::ADMIN_SHUTDOWN, Vec::new()).await?;
            } else if state {
                admin_call(&mut remote, casual::domain::ADMIN_STATE, Vec::new()).await?;
            } else {
                bail!("nothing to do: pass --state, --scale-instances or --shutdown");
            }
        }
        Command::Service { state, metric_reset } => {
            if let Some(names) = metric_reset {
                let payload = serde_json::to_vec(&names)?;
                admin_call(&mut remote, casual::service::ADMIN_METRIC_RESET, payload).await?;
            } else if state {
                admin_call(&mut remote, casual::service::ADMIN_STATE, Vec::new()).await?;
            } else {
                bail!("nothing to do: pass --state or --metric-reset");
            }
        }
        Command::Transaction { state } => {
            if state {
                admin_call(&mut remote, casual::transaction::ADMIN_STATE, Vec::new()).await?;
            } else {
                bail!("nothing to do: pass --state");
            }
        }
        Command::Queue {
            list,
            restore,
            clear,
            messages,
        } => {
            let queue_payload = |queue: String| {
                serde_json::to_vec(&serde_json::json!({ "queue": queue }))
                    .context("payload encoding")
            };
            if let Some(queue) = restore {
                admin_call(
                    &mut remote,
                    casual::queue::manager::ADMIN_RESTORE,
                    queue_payload(queue)?,
                )
                .await?;
            } else if let Some(queue) = clear {
                admin_call(
                    &mut remote,
                    casual::queue::manager::ADMIN_CLEAR,
                    queue_payload(queue)?,
                )
                .await?;
            } else if let Some(queue) = messages {
                admin_call(
                    &mut remote,
                    casual::queue::manager::ADMIN_LIST_MESSAGES,
                    queue_payload(queue)?,
                )
                .await?;
            } else if list {
                admin_call(&mut remote, casual::queue::manager::ADMIN_STATE, Vec::new()).await?;
            } else {
                bail!("nothing to do: pass --list, --restore, --clear or --messages");
            }
        }
        Command::Gateway { state, rediscover } => {
            if rediscover {
                admin_call(&mut remote, casual::gateway::ADMIN_REDISCOVER, Vec::new()).await?;
            } else if state {
                admin_call(&mut remote, casual::gateway::ADMIN_STATE, Vec::new()).await?;
            } else {
                bail!("nothing to do: pass --state or --rediscover");
            }
        }
        Command::Call { service, payload } => {
            let payload = match payload {
                Some(payload) => payload.into_bytes(),
                None => {
                    use std::io::Read;
                    let mut buffer = Vec::new();
                    std::io::stdin().read_to_end(&mut buffer)?;
                    buffer
                }
            };
            let service = ServiceName::try_new(service).context("invalid service name")?;
            match remote.call(&service, payload).await? {
                Ok(reply) => {
                    use std::io::Write;
                    std::io::stdout().write_all(&reply)?;
                }
                Err(kind) => bail!("call failed: {kind}"),
            }
        }
    }
    Ok(())
}

/// Calls an admin service and prints its JSON reply
async fn admin_call(remote: &mut Remote, service: &str, payload: Vec<u8>) -> Result<()> {
    let service = ServiceName::try_new(service).context("invalid admin service name")?;
    match remote.call(&service, payload).await? {
        Ok(reply) => {
            if reply.is_empty() {
                println!("{{}}");
            } else {
                // re-render for stable, readable output
                match serde_json::from_slice::<serde_json::Value>(&reply) {
                    Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                    Err(_) => println!("{}", String::from_utf8_lossy(&reply)),
                }
            }
            Ok(())
        }
        Err(kind) => bail!("{service} failed: {kind}"),
    }
}
