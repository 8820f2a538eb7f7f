//! The `casual-domain` daemon
//!
//! Boots a domain from a configuration file and runs it until an admin
//! shutdown or SIGINT. Without a configuration it hosts the example echo
//! server behind an inbound gateway on the default admin address, which is
//! enough for the `casual` driver to talk to.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use casual::configuration::{InboundGroup, Model};
use casual::runtime::Builder;

#[derive(Parser)]
#[command(name = "casual-domain", version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Boot and run a casual domain")]
struct Arguments {
    /// Domain configuration file (JSON); a default example domain when
    /// absent
    #[arg(long, short)]
    configuration: Option<PathBuf>,
}

fn default_model() -> Model {
    let mut model = Model::named("casual");
    model.gateway.inbound.push(InboundGroup {
        listener: Some("127.0.0.1:7771".into()),
        connect: Vec::new(),
    });
    model
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("casual=info".parse()?),
        )
        .init();

    let arguments = Arguments::parse();
    let (model, with_example) = match &arguments.configuration {
        Some(path) => (
            Model::load(path).with_context(|| format!("loading {}", path.display()))?,
            false,
        ),
        None => (default_model(), true),
    };

    let mut builder = Builder::new(model);
    if with_example {
        builder = builder.with_server("casual-example-server", casual::example::echo_server());
    }

    let mut domain = builder.boot().await.context("domain boot failed")?;
    info!("domain is on-line; ctrl-c or `casual domain --shutdown` to stop");

    let interrupted = tokio::select! {
        _ = tokio::signal::ctrl_c() => true,
        () = domain.terminated() => false,
    };
    if interrupted {
        info!("interrupt - action: graceful shutdown");
        domain.shutdown().await;
    }
    Ok(())
}
