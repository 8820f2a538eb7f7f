//! The fixed message set of the coordination fabric
//!
//! Every logical message is a tagged variant of [`Message`]; managers
//! dispatch by matching the discriminant. A message travels as an
//! [`Envelope`] carrying the correlation (pairing request and reply) and the
//! execution id (propagated across call chains for tracing).

use serde::{Deserialize, Serialize};

use crate::domain_types::{Correlation, Execution};

pub mod codec;
pub mod domain;
pub mod event;
pub mod gateway;
pub mod queue;
pub mod service;
pub mod transaction;
pub mod types;

pub use types::MessageType;

/// A logical message: one variant per registered type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum Message {
    // utility
    Poke,
    ShutdownRequest {
        /// Set when the requester wants a reply once shutdown is underway
        reply: bool,
    },
    ShutdownReply,

    // domain
    DomainScaleExecutable(domain::ScaleExecutable),
    DomainProcessConnectRequest(domain::ProcessConnectRequest),
    DomainProcessConnectReply(domain::ProcessConnectReply),
    DomainProcessLookupRequest(domain::ProcessLookupRequest),
    DomainProcessLookupReply(domain::ProcessLookupReply),
    DomainProcessPrepareShutdownRequest(domain::ProcessPrepareShutdownRequest),
    DomainProcessPrepareShutdownReply(domain::ProcessPrepareShutdownReply),

    // server
    ServerPingRequest(crate::process::ProcessHandle),
    ServerPingReply(crate::process::ProcessHandle),

    // service
    ServiceAdvertise(service::Advertise),
    ServiceLookupRequest(service::LookupRequest),
    ServiceLookupReply(service::LookupReply),
    ServiceLookupDiscardRequest(service::LookupDiscardRequest),
    ServiceLookupDiscardReply(service::LookupDiscardReply),
    ServiceCall(service::Call),
    ServiceReply(service::Reply),
    ServiceAck(service::Ack),
    ServiceConcurrentAdvertise(service::ConcurrentAdvertise),

    // event
    EventSubscriptionBegin(event::SubscriptionBegin),
    EventSubscriptionEnd(event::SubscriptionEnd),
    EventProcessSpawn(event::ProcessSpawn),
    EventProcessExit(event::ProcessExit),
    EventServiceCalls(event::ServiceCalls),
    EventAssassination(event::Assassination),

    // transaction
    TransactionResourceProxyConnect(transaction::ResourceProxyConnect),
    TransactionCommitRequest(transaction::CommitRequest),
    TransactionCommitReply(transaction::CommitReply),
    TransactionRollbackRequest(transaction::RollbackRequest),
    TransactionRollbackReply(transaction::RollbackReply),
    TransactionResourcePrepareRequest(transaction::ResourceRequest),
    TransactionResourcePrepareReply(transaction::ResourceReply),
    TransactionResourceCommitRequest(transaction::ResourceRequest),
    TransactionResourceCommitReply(transaction::ResourceReply),
    TransactionResourceRollbackRequest(transaction::ResourceRequest),
    TransactionResourceRollbackReply(transaction::ResourceReply),
    TransactionResourceInvolved(transaction::ResourceInvolved),
    TransactionExternalResourceInvolved(transaction::ExternalResourceInvolved),

    // queue
    QueueGroupConnectRequest(queue::GroupConnectRequest),
    QueueGroupConnectReply(queue::GroupConnectReply),
    QueueAdvertise(queue::QueueAdvertise),
    QueueEnqueueRequest(queue::EnqueueRequest),
    QueueEnqueueReply(queue::EnqueueReply),
    QueueDequeueRequest(queue::DequeueRequest),
    QueueDequeueReply(queue::DequeueReply),
    QueueDequeueForgetRequest(queue::DequeueForgetRequest),
    QueueDequeueForgetReply(queue::DequeueForgetReply),
    QueuePeekRequest(queue::PeekRequest),
    QueuePeekReply(queue::PeekReply),
    QueueInformationRequest(queue::InformationRequest),
    QueueInformationReply(queue::InformationReply),
    QueueLookupRequest(queue::LookupRequest),
    QueueLookupReply(queue::LookupReply),
    QueueLookupDiscardRequest(queue::LookupDiscardRequest),
    QueueLookupDiscardReply(queue::LookupDiscardReply),
    QueueRestoreRequest(queue::RestoreRequest),
    QueueRestoreReply(queue::RestoreReply),
    QueueClearRequest(queue::ClearRequest),
    QueueClearReply(queue::ClearReply),

    // gateway
    GatewayDomainConnectRequest(gateway::DomainConnectRequest),
    GatewayDomainConnectReply(gateway::DomainConnectReply),
    GatewayDomainDiscoverRequest(gateway::DiscoverRequest),
    GatewayDomainDiscoverReply(gateway::DiscoverReply),
    GatewayDomainDiscoverAccumulatedReply(gateway::DiscoverAccumulatedReply),
    GatewayDomainAdvertise(gateway::DomainAdvertise),
    GatewayRediscoverRequest(gateway::RediscoverRequest),
    GatewayRediscoverReply(gateway::RediscoverReply),

    // signals
    SignalTimeout,
}

impl Message {
    /// The registered type of this message
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        use MessageType as T;
        match self {
            Self::Poke => T::Poke,
            Self::ShutdownRequest { .. } => T::ShutdownRequest,
            Self::ShutdownReply => T::ShutdownReply,
            Self::DomainScaleExecutable(_) => T::DomainScaleExecutable,
            Self::DomainProcessConnectRequest(_) => T::DomainProcessConnectRequest,
            Self::DomainProcessConnectReply(_) => T::DomainProcessConnectReply,
            Self::DomainProcessLookupRequest(_) => T::DomainProcessLookupRequest,
            Self::DomainProcessLookupReply(_) => T::DomainProcessLookupReply,
            Self::DomainProcessPrepareShutdownRequest(_) => T::DomainProcessPrepareShutdownRequest,
            Self::DomainProcessPrepareShutdownReply(_) => T::DomainProcessPrepareShutdownReply,
            Self::ServerPingRequest(_) => T::ServerPingRequest,
            Self::ServerPingReply(_) => T::ServerPingReply,
            Self::ServiceAdvertise(_) => T::ServiceAdvertise,
            Self::ServiceLookupRequest(_) => T::ServiceLookupRequest,
            Self::ServiceLookupReply(_) => T::ServiceLookupReply,
            Self::ServiceLookupDiscardRequest(_) => T::ServiceLookupDiscardRequest,
            Self::ServiceLookupDiscardReply(_) => T::ServiceLookupDiscardReply,
            Self::ServiceCall(_) => T::ServiceCall,
            Self::ServiceReply(_) => T::ServiceReply,
            Self::ServiceAck(_) => T::ServiceAck,
            Self::ServiceConcurrentAdvertise(_) => T::ServiceConcurrentAdvertise,
            Self::EventSubscriptionBegin(_) => T::EventSubscriptionBegin,
            Self::EventSubscriptionEnd(_) => T::EventSubscriptionEnd,
            Self::EventProcessSpawn(_) => T::EventProcessSpawn,
            Self::EventProcessExit(_) => T::EventProcessExit,
            Self::EventServiceCalls(_) => T::EventServiceCalls,
            Self::EventAssassination(_) => T::EventAssassination,
            Self::TransactionResourceProxyConnect(_) => T::TransactionResourceProxyConnect,
            Self::TransactionCommitRequest(_) => T::TransactionCommitRequest,
            Self::TransactionCommitReply(_) => T::TransactionCommitReply,
            Self::TransactionRollbackRequest(_) => T::TransactionRollbackRequest,
            Self::TransactionRollbackReply(_) => T::TransactionRollbackReply,
            Self::TransactionResourcePrepareRequest(_) => T::TransactionResourcePrepareRequest,
            Self::TransactionResourcePrepareReply(_) => T::TransactionResourcePrepareReply,
            Self::TransactionResourceCommitRequest(_) => T::TransactionResourceCommitRequest,
            Self::TransactionResourceCommitReply(_) => T::TransactionResourceCommitReply,
            Self::TransactionResourceRollbackRequest(_) => T::TransactionResourceRollbackRequest,
            Self::TransactionResourceRollbackReply(_) => T::TransactionResourceRollbackReply,
            Self::TransactionResourceInvolved(_) => T::TransactionResourceInvolved,
            Self::TransactionExternalResourceInvolved(_) => T::TransactionExternalResourceInvolved,
            Self::QueueGroupConnectRequest(_) => T::QueueGroupConnectRequest,
            Self::QueueGroupConnectReply(_) => T::QueueGroupConnectReply,
            Self::QueueAdvertise(_) => T::QueueAdvertise,
            Self::QueueEnqueueRequest(_) => T::QueueEnqueueRequest,
            Self::QueueEnqueueReply(_) => T::QueueEnqueueReply,
            Self::QueueDequeueRequest(_) => T::QueueDequeueRequest,
            Self::QueueDequeueReply(_) => T::QueueDequeueReply,
            Self::QueueDequeueForgetRequest(_) => T::QueueDequeueForgetRequest,
            Self::QueueDequeueForgetReply(_) => T::QueueDequeueForgetReply,
            Self::QueuePeekRequest(_) => T::QueuePeekRequest,
            Self::QueuePeekReply(_) => T::QueuePeekReply,
            Self::QueueInformationRequest(_) => T::QueueInformationRequest,
            Self::QueueInformationReply(_) => T::QueueInformationReply,
            Self::QueueLookupRequest(_) => T::QueueLookupRequest,
            Self::QueueLookupReply(_) => T::QueueLookupReply,
            Self::QueueLookupDiscardRequest(_) => T::QueueLookupDiscardRequest,
            Self::QueueLookupDiscardReply(_) => T::QueueLookupDiscardReply,
            Self::QueueRestoreRequest(_) => T::QueueRestoreRequest,
            Self::QueueRestoreReply(_) => T::QueueRestoreReply,
            Self::QueueClearRequest(_) => T::QueueClearRequest,
            Self::QueueClearReply(_) => T::QueueClearReply,
            Self::GatewayDomainConnectRequest(_) => T::GatewayDomainConnectRequest,
            Self::GatewayDomainConnectReply(_) => T::GatewayDomainConnectReply,
            Self::GatewayDomainDiscoverRequest(_) => T::GatewayDomainDiscoverRequest,
            Self::GatewayDomainDiscoverReply(_) => T::GatewayDomainDiscoverReply,
            Self::GatewayDomainDiscoverAccumulatedReply(_) => {
                T::GatewayDomainDiscoverAccumulatedReply
            }
            Self::GatewayDomainAdvertise(_) => T::GatewayDomainAdvertise,
            Self::GatewayRediscoverRequest(_) => T::GatewayRediscoverRequest,
            Self::GatewayRediscoverReply(_) => T::GatewayRediscoverReply,
            Self::SignalTimeout => T::SignalTimeout,
        }
    }
}

/// A logical message with its correlation and execution ids
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Pairs the reply with its request
    pub correlation: Correlation,
    /// Propagated across call chains for tracing
    pub execution: Execution,
    /// The payload
    pub message: Message,
}

impl Envelope {
    /// Wraps a message with a fresh correlation and execution
    #[must_use]
    pub fn new(message: Message) -> Self {
        Self {
            correlation: Correlation::generate(),
            execution: Execution::generate(),
            message,
        }
    }

    /// Wraps a reply, deriving correlation and execution from the request
    #[must_use]
    pub fn reverse(&self, message: Message) -> Self {
        Self {
            correlation: self.correlation,
            execution: self.execution,
            message,
        }
    }

    /// Wraps a message that continues this execution under a new correlation
    #[must_use]
    pub fn forward(&self, message: Message) -> Self {
        Self {
            correlation: Correlation::generate(),
            execution: self.execution,
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reverse_preserves_correlation_and_execution() {
        let request = Envelope::new(Message::Poke);
        let reply = request.reverse(Message::ShutdownReply);
        assert_eq!(reply.correlation, request.correlation);
        assert_eq!(reply.execution, request.execution);
    }

    #[test]
    fn forward_preserves_execution_only() {
        let request = Envelope::new(Message::ShutdownReply);
        let forwarded = request.forward(Message::Poke);
        assert_ne!(forwarded.correlation, request.correlation);
        assert_eq!(forwarded.execution, request.execution);
    }
}
