//! Stable message type registry
//!
//! Message types are stable integers partitioned by component. Values in the
//! gateway and transaction-resource ranges are pinned: changing them breaks
//! the inter-domain protocol.

use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// Type tag of a logical message.
///
/// The discriminant values are the wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u64)]
#[allow(missing_docs)]
pub enum MessageType {
    // utility - 500s
    Poke = 502,
    ShutdownRequest = 503,
    ShutdownReply = 504,

    // domain - 1000s
    DomainScaleExecutable = 1001,
    DomainProcessConnectRequest = 1002,
    DomainProcessConnectReply = 1003,
    DomainProcessLookupRequest = 1004,
    DomainProcessLookupReply = 1005,
    DomainProcessPrepareShutdownRequest = 1006,
    DomainProcessPrepareShutdownReply = 1007,

    // server - 2000s
    ServerPingRequest = 2004,
    ServerPingReply = 2005,

    // service - 3000s
    ServiceAdvertise = 3001,
    ServiceLookupRequest = 3002,
    ServiceLookupReply = 3003,
    ServiceLookupDiscardRequest = 3004,
    ServiceLookupDiscardReply = 3005,
    ServiceCall = 3100,
    ServiceReply = 3101,
    ServiceAck = 3102,
    ServiceConcurrentAdvertise = 3103,

    // event - 4000s
    EventSubscriptionBegin = 4001,
    EventSubscriptionEnd = 4002,
    EventProcessSpawn = 4107,
    EventProcessExit = 4108,
    EventServiceCalls = 4201,
    EventAssassination = 4300,

    // transaction - 5000s
    TransactionResourceProxyConnect = 5022,
    TransactionCommitRequest = 5103,
    TransactionCommitReply = 5104,
    TransactionRollbackRequest = 5105,
    TransactionRollbackReply = 5106,

    // pinned: inter-domain resource protocol
    TransactionResourcePrepareRequest = 5201,
    TransactionResourcePrepareReply = 5202,
    TransactionResourceCommitRequest = 5203,
    TransactionResourceCommitReply = 5204,
    TransactionResourceRollbackRequest = 5205,
    TransactionResourceRollbackReply = 5206,

    TransactionResourceInvolved = 5401,
    TransactionExternalResourceInvolved = 5403,

    // queue - 6000s
    QueueGroupConnectRequest = 6001,
    QueueGroupConnectReply = 6002,
    QueueAdvertise = 6003,
    QueueEnqueueRequest = 6100,
    QueueEnqueueReply = 6101,
    QueueDequeueRequest = 6200,
    QueueDequeueReply = 6201,
    QueueDequeueForgetRequest = 6202,
    QueueDequeueForgetReply = 6203,
    QueuePeekRequest = 6301,
    QueuePeekReply = 6302,
    QueueInformationRequest = 6401,
    QueueInformationReply = 6402,
    QueueLookupRequest = 6501,
    QueueLookupReply = 6502,
    QueueLookupDiscardRequest = 6503,
    QueueLookupDiscardReply = 6504,
    QueueRestoreRequest = 6601,
    QueueRestoreReply = 6602,
    QueueClearRequest = 6603,
    QueueClearReply = 6604,

    // gateway - 7000s; connect/discover values are pinned
    GatewayDomainConnectRequest = 7200,
    GatewayDomainConnectReply = 7201,
    GatewayDomainDiscoverRequest = 7300,
    GatewayDomainDiscoverReply = 7301,
    GatewayDomainDiscoverAccumulatedReply = 7302,
    GatewayDomainAdvertise = 7303,
    GatewayRediscoverRequest = 7401,
    GatewayRediscoverReply = 7402,

    // signals normalized into messages - 8000s
    SignalTimeout = 8000,
}

impl MessageType {
    /// Wire value of the tag
    #[must_use]
    pub fn value(self) -> u64 {
        self as u64
    }

    /// Decodes a wire value
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnknownMessageType`] for values outside the
    /// registry.
    pub fn from_value(value: u64) -> Result<Self, CodecError> {
        use MessageType as T;
        let tag = match value {
            502 => T::Poke,
            503 => T::ShutdownRequest,
            504 => T::ShutdownReply,
            1001 => T::DomainScaleExecutable,
            1002 => T::DomainProcessConnectRequest,
            1003 => T::DomainProcessConnectReply,
            1004 => T::DomainProcessLookupRequest,
            1005 => T::DomainProcessLookupReply,
            1006 => T::DomainProcessPrepareShutdownRequest,
            1007 => T::DomainProcessPrepareShutdownReply,
            2004 => T::ServerPingRequest,
            2005 => T::ServerPingReply,
            3001 => T::ServiceAdvertise,
            3002 => T::ServiceLookupRequest,
            3003 => T::ServiceLookupReply,
            3004 => T::ServiceLookupDiscardRequest,
            3005 => T::ServiceLookupDiscardReply,
            3100 => T::ServiceCall,
            3101 => T::ServiceReply,
            3102 => T::ServiceAck,
            3103 => T::ServiceConcurrentAdvertise,
            4001 => T::EventSubscriptionBegin,
            4002 => T::EventSubscriptionEnd,
            4107 => T::EventProcessSpawn,
            4108 => T::EventProcessExit,
            4201 => T::EventServiceCalls,
            4300 => T::EventAssassination,
            5022 => T::TransactionResourceProxyConnect,
            5103 => T::TransactionCommitRequest,
            5104 => T::TransactionCommitReply,
            5105 => T::TransactionRollbackRequest,
            5106 => T::TransactionRollbackReply,
            5201 => T::TransactionResourcePrepareRequest,
            5202 => T::TransactionResourcePrepareReply,
            5203 => T::TransactionResourceCommitRequest,
            5204 => T::TransactionResourceCommitReply,
            5205 => T::TransactionResourceRollbackRequest,
            5206 => T::TransactionResourceRollbackReply,
            5401 => T::TransactionResourceInvolved,
            5403 => T::TransactionExternalResourceInvolved,
            6001 => T::QueueGroupConnectRequest,
            6002 => T::QueueGroupConnectReply,
            6003 => T::QueueAdvertise,
            6100 => T::QueueEnqueueRequest,
            6101 => T::QueueEnqueueReply,
            6200 => T::QueueDequeueRequest,
            6201 => T::QueueDequeueReply,
            6202 => T::QueueDequeueForgetRequest,
            6203 => T::QueueDequeueForgetReply,
            6301 => T::QueuePeekRequest,
            6302 => T::QueuePeekReply,
            6401 => T::QueueInformationRequest,
            6402 => T::QueueInformationReply,
            6501 => T::QueueLookupRequest,
            6502 => T::QueueLookupReply,
            6503 => T::QueueLookupDiscardRequest,
            6504 => T::QueueLookupDiscardReply,
            6601 => T::QueueRestoreRequest,
            6602 => T::QueueRestoreReply,
            6603 => T::QueueClearRequest,
            6604 => T::QueueClearReply,
            7200 => T::GatewayDomainConnectRequest,
            7201 => T::GatewayDomainConnectReply,
            7300 => T::GatewayDomainDiscoverRequest,
            7301 => T::GatewayDomainDiscoverReply,
            7302 => T::GatewayDomainDiscoverAccumulatedReply,
            7303 => T::GatewayDomainAdvertise,
            7401 => T::GatewayRediscoverRequest,
            7402 => T::GatewayRediscoverReply,
            8000 => T::SignalTimeout,
            other => return Err(CodecError::UnknownMessageType { value: other }),
        };
        Ok(tag)
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}({})", self, self.value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pinned_resource_protocol_values() {
        assert_eq!(MessageType::TransactionResourcePrepareRequest.value(), 5201);
        assert_eq!(MessageType::TransactionResourcePrepareReply.value(), 5202);
        assert_eq!(MessageType::TransactionResourceCommitRequest.value(), 5203);
        assert_eq!(MessageType::TransactionResourceCommitReply.value(), 5204);
        assert_eq!(
            MessageType::TransactionResourceRollbackRequest.value(),
            5205
        );
        assert_eq!(MessageType::TransactionResourceRollbackReply.value(), 5206);
    }

    #[test]
    fn pinned_gateway_values() {
        assert_eq!(MessageType::GatewayDomainConnectRequest.value(), 7200);
        assert_eq!(MessageType::GatewayDomainConnectReply.value(), 7201);
        assert_eq!(MessageType::GatewayDomainDiscoverRequest.value(), 7300);
        assert_eq!(MessageType::GatewayDomainDiscoverReply.value(), 7301);
    }

    #[test]
    fn unknown_value_is_rejected() {
        assert!(MessageType::from_value(0).is_err());
        assert!(MessageType::from_value(999_999).is_err());
    }
}
