//! Service-forward worker
//!
//! Dequeues from a source queue, calls the configured service, enqueues the
//! reply into an optional reply queue - all under one transaction. A failed
//! call rolls the transaction back, which returns the message with its
//! retry delay; the worker then picks it up again once it becomes
//! available.

use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::client::Session;
use crate::configuration;
use crate::domain::spawn::InstanceContext;
use crate::error::Result;
use crate::message::queue as queue_message;

/// Runs a forward worker as a domain instance
///
/// # Errors
///
/// Fails when the session cannot connect.
#[instrument(skip_all, fields(source = %forward.source, service = %forward.service))]
pub async fn run(context: InstanceContext, forward: configuration::Forward) -> Result<()> {
    let mut session = Session::connect_as(
        std::sync::Arc::clone(&context.bus),
        std::sync::Arc::clone(&context.environment),
        context.pid,
        &context.alias.to_string(),
    )
    .await?;
    info!("forward worker on-line");

    loop {
        if session.shutdown_requested() {
            break;
        }

        if let Err(failure) = forward_one(&mut session, &forward).await {
            if session.shutdown_requested() {
                break;
            }
            warn!(error = %failure, "forward iteration failed - action: retry");
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        }
    }

    info!("forward worker off-line");
    Ok(())
}

/// One full forward: dequeue, call, optional reply enqueue, commit
async fn forward_one(session: &mut Session, forward: &configuration::Forward) -> Result<()> {
    session.begin()?;

    let message = match session.dequeue(&forward.source, true).await {
        Ok(Ok(Some(message))) => message,
        Ok(Ok(None)) | Ok(Err(_)) => {
            // nothing to do, or the queue is not routable yet
            let _ = session.rollback().await;
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            return Ok(());
        }
        Err(failure) => {
            let _ = session.rollback().await;
            return Err(failure);
        }
    };

    let outcome = session.call(&forward.service, message.payload.clone()).await;
    match outcome {
        Ok(Ok(payload)) => {
            if let Some(reply_queue) = &forward.reply {
                let reply = queue_message::Message {
                    id: Uuid::nil(),
                    properties: message.properties.clone(),
                    reply: None,
                    r#type: message.r#type.clone(),
                    payload,
                    available: std::time::SystemTime::now(),
                    timestamp: std::time::SystemTime::now(),
                    redelivered: 0,
                };
                if let Ok(Err(kind)) = session.enqueue(reply_queue, reply).await {
                    warn!(queue = %reply_queue, %kind, "reply enqueue refused - action: rollback");
                    let _ = session.rollback().await;
                    return Ok(());
                }
            }
            let _ = session.commit().await;
        }
        Ok(Err(kind)) => {
            // the owning transaction rolls back: retry-with-delay applies
            warn!(%kind, "forwarded call failed - action: rollback");
            let _ = session.rollback().await;
        }
        Err(failure) => {
            let _ = session.rollback().await;
            return Err(failure);
        }
    }
    Ok(())
}
