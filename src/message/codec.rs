//! Payload layouts
//!
//! A payload is serialized twice-over: a compact host layout for
//! intra-domain devices, and a big-endian fixed-width network layout for
//! traffic crossing a gateway. Which layout applies is a property of the
//! destination device, not of the message type.
//!
//! The network layout encodes structures field-by-field per message schema:
//! integers big-endian fixed-width, strings and sequences length-prefixed
//! with `u64`, optional fields as `(present: u8, value?)`. Only messages
//! that are part of the inter-domain protocol have a network schema.

use bytes::{Buf, BufMut, BytesMut};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::domain_types::{
    Correlation, DomainId, DomainName, Execution, Hops, InstanceOrder, IpcId, Pid, QueueName,
    ResourceId, ServiceName, Xid,
};
use crate::error::{CodecError, ErrorKind};
use crate::message::{Envelope, Message, MessageType, gateway, queue, service, transaction};
use crate::process::ProcessHandle;
use crate::xa::XaCode;

/// Encodes an envelope in the compact intra-domain layout
///
/// # Errors
///
/// Returns [`CodecError::Ipc`] when serialization fails.
pub fn encode_ipc(envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
    Ok(bincode::serialize(envelope)?)
}

/// Decodes an envelope from the compact intra-domain layout
///
/// # Errors
///
/// Returns [`CodecError::Ipc`] when the payload does not match the layout.
pub fn decode_ipc(payload: &[u8]) -> Result<Envelope, CodecError> {
    Ok(bincode::deserialize(payload)?)
}

/// Encodes an envelope in the network layout
///
/// # Errors
///
/// Fails when the message is not part of the inter-domain protocol.
pub fn encode_network(envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
    let mut buf = BytesMut::new();
    buf.put_u64(envelope.message.message_type().value());
    Uuid::from(envelope.correlation).encode(&mut buf);
    Uuid::from(envelope.execution).encode(&mut buf);
    encode_body(&envelope.message, &mut buf)?;
    Ok(buf.to_vec())
}

/// Decodes an envelope from the network layout
///
/// # Errors
///
/// Fails on truncated payloads, unknown type tags, or messages without a
/// network schema.
pub fn decode_network(payload: &[u8]) -> Result<Envelope, CodecError> {
    let mut buf = payload;
    let tag = u64::decode(&mut buf)?;
    let message_type = MessageType::from_value(tag)?;
    let correlation = Correlation::new(Uuid::decode(&mut buf)?);
    let execution = Execution::new(Uuid::decode(&mut buf)?);
    let message = decode_body(message_type, &mut buf)?;
    Ok(Envelope {
        correlation,
        execution,
        message,
    })
}

fn not_interdomain(message_type: MessageType) -> CodecError {
    CodecError::InvalidValue {
        field: "message_type",
        reason: format!("{message_type} is not part of the inter-domain protocol"),
    }
}

fn encode_body(message: &Message, buf: &mut BytesMut) -> Result<(), CodecError> {
    match message {
        Message::ServiceCall(call) => call.encode(buf),
        Message::ServiceReply(reply) => reply.encode(buf),
        Message::TransactionResourcePrepareRequest(request)
        | Message::TransactionResourceCommitRequest(request)
        | Message::TransactionResourceRollbackRequest(request) => request.encode(buf),
        Message::TransactionResourcePrepareReply(reply)
        | Message::TransactionResourceCommitReply(reply)
        | Message::TransactionResourceRollbackReply(reply) => reply.encode(buf),
        Message::QueueEnqueueRequest(request) => request.encode(buf),
        Message::QueueEnqueueReply(reply) => reply.encode(buf),
        Message::QueueDequeueRequest(request) => request.encode(buf),
        Message::QueueDequeueReply(reply) => reply.encode(buf),
        Message::GatewayDomainConnectRequest(request) => request.encode(buf),
        Message::GatewayDomainConnectReply(reply) => reply.encode(buf),
        Message::GatewayDomainDiscoverRequest(request) => request.encode(buf),
        Message::GatewayDomainDiscoverReply(reply) => reply.encode(buf),
        Message::GatewayDomainAdvertise(advertise) => advertise.encode(buf),
        other => return Err(not_interdomain(other.message_type())),
    }
    Ok(())
}

fn decode_body(message_type: MessageType, buf: &mut impl Buf) -> Result<Message, CodecError> {
    use MessageType as T;
    let message = match message_type {
        T::ServiceCall => Message::ServiceCall(service::Call::decode(buf)?),
        T::ServiceReply => Message::ServiceReply(service::Reply::decode(buf)?),
        T::TransactionResourcePrepareRequest => {
            Message::TransactionResourcePrepareRequest(transaction::ResourceRequest::decode(buf)?)
        }
        T::TransactionResourceCommitRequest => {
            Message::TransactionResourceCommitRequest(transaction::ResourceRequest::decode(buf)?)
        }
        T::TransactionResourceRollbackRequest => {
            Message::TransactionResourceRollbackRequest(transaction::ResourceRequest::decode(buf)?)
        }
        T::TransactionResourcePrepareReply => {
            Message::TransactionResourcePrepareReply(transaction::ResourceReply::decode(buf)?)
        }
        T::TransactionResourceCommitReply => {
            Message::TransactionResourceCommitReply(transaction::ResourceReply::decode(buf)?)
        }
        T::TransactionResourceRollbackReply => {
            Message::TransactionResourceRollbackReply(transaction::ResourceReply::decode(buf)?)
        }
        T::QueueEnqueueRequest => Message::QueueEnqueueRequest(queue::EnqueueRequest::decode(buf)?),
        T::QueueEnqueueReply => Message::QueueEnqueueReply(queue::EnqueueReply::decode(buf)?),
        T::QueueDequeueRequest => Message::QueueDequeueRequest(queue::DequeueRequest::decode(buf)?),
        T::QueueDequeueReply => Message::QueueDequeueReply(queue::DequeueReply::decode(buf)?),
        T::GatewayDomainConnectRequest => {
            Message::GatewayDomainConnectRequest(gateway::DomainConnectRequest::decode(buf)?)
        }
        T::GatewayDomainConnectReply => {
            Message::GatewayDomainConnectReply(gateway::DomainConnectReply::decode(buf)?)
        }
        T::GatewayDomainDiscoverRequest => {
            Message::GatewayDomainDiscoverRequest(gateway::DiscoverRequest::decode(buf)?)
        }
        T::GatewayDomainDiscoverReply => {
            Message::GatewayDomainDiscoverReply(gateway::DiscoverReply::decode(buf)?)
        }
        T::GatewayDomainAdvertise => {
            Message::GatewayDomainAdvertise(gateway::DomainAdvertise::decode(buf)?)
        }
        other => return Err(not_interdomain(other)),
    };
    Ok(message)
}

fn ensure(buf: &impl Buf, needed: usize) -> Result<(), CodecError> {
    if buf.remaining() < needed {
        return Err(CodecError::UnexpectedEnd {
            needed: needed - buf.remaining(),
        });
    }
    Ok(())
}

/// Field-by-field network encoding
pub(crate) trait Wire: Sized {
    /// Appends the big-endian encoding of `self`
    fn encode(&self, buf: &mut BytesMut);
    /// Reads a value, consuming from the buffer
    fn decode(buf: &mut impl Buf) -> Result<Self, CodecError>;
}

impl Wire for u8 {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(*self);
    }
    fn decode(buf: &mut impl Buf) -> Result<Self, CodecError> {
        ensure(buf, 1)?;
        Ok(buf.get_u8())
    }
}

impl Wire for u64 {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64(*self);
    }
    fn decode(buf: &mut impl Buf) -> Result<Self, CodecError> {
        ensure(buf, 8)?;
        Ok(buf.get_u64())
    }
}

impl Wire for i32 {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32(*self);
    }
    fn decode(buf: &mut impl Buf) -> Result<Self, CodecError> {
        ensure(buf, 4)?;
        Ok(buf.get_i32())
    }
}

impl Wire for bool {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(u8::from(*self));
    }
    fn decode(buf: &mut impl Buf) -> Result<Self, CodecError> {
        ensure(buf, 1)?;
        Ok(buf.get_u8() != 0)
    }
}

impl Wire for usize {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64(*self as u64);
    }
    fn decode(buf: &mut impl Buf) -> Result<Self, CodecError> {
        let value = u64::decode(buf)?;
        usize::try_from(value).map_err(|_| CodecError::InvalidValue {
            field: "size",
            reason: format!("{value} does not fit this platform"),
        })
    }
}

impl Wire for Uuid {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(self.as_bytes());
    }
    fn decode(buf: &mut impl Buf) -> Result<Self, CodecError> {
        ensure(buf, 16)?;
        let mut bytes = [0u8; 16];
        buf.copy_to_slice(&mut bytes);
        Ok(Uuid::from_bytes(bytes))
    }
}

impl Wire for String {
    fn encode(&self, buf: &mut BytesMut) {
        self.len().encode(buf);
        buf.put_slice(self.as_bytes());
    }
    fn decode(buf: &mut impl Buf) -> Result<Self, CodecError> {
        let len = usize::decode(buf)?;
        ensure(buf, len)?;
        let mut bytes = vec![0u8; len];
        buf.copy_to_slice(&mut bytes);
        String::from_utf8(bytes).map_err(|error| CodecError::InvalidValue {
            field: "string",
            reason: error.to_string(),
        })
    }
}

impl<T: Wire> Wire for Vec<T> {
    fn encode(&self, buf: &mut BytesMut) {
        self.len().encode(buf);
        for item in self {
            item.encode(buf);
        }
    }
    fn decode(buf: &mut impl Buf) -> Result<Self, CodecError> {
        let count = usize::decode(buf)?;
        // sanity bound so a corrupt count cannot force a huge allocation
        let mut items = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            items.push(T::decode(buf)?);
        }
        Ok(items)
    }
}

impl<T: Wire> Wire for Option<T> {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            Some(value) => {
                buf.put_u8(1);
                value.encode(buf);
            }
            None => buf.put_u8(0),
        }
    }
    fn decode(buf: &mut impl Buf) -> Result<Self, CodecError> {
        match u8::decode(buf)? {
            0 => Ok(None),
            1 => Ok(Some(T::decode(buf)?)),
            other => Err(CodecError::InvalidValue {
                field: "optional",
                reason: format!("presence byte must be 0 or 1, got {other}"),
            }),
        }
    }
}

impl Wire for SystemTime {
    fn encode(&self, buf: &mut BytesMut) {
        let nanos = self
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_nanos())
            .unwrap_or_default();
        buf.put_u64(u64::try_from(nanos).unwrap_or(u64::MAX));
    }
    fn decode(buf: &mut impl Buf) -> Result<Self, CodecError> {
        let nanos = u64::decode(buf)?;
        Ok(UNIX_EPOCH + Duration::from_nanos(nanos))
    }
}

impl Wire for Duration {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64(u64::try_from(self.as_nanos()).unwrap_or(u64::MAX));
    }
    fn decode(buf: &mut impl Buf) -> Result<Self, CodecError> {
        Ok(Duration::from_nanos(u64::decode(buf)?))
    }
}

macro_rules! wire_uuid_newtype {
    ($name:ident) => {
        impl Wire for $name {
            fn encode(&self, buf: &mut BytesMut) {
                Uuid::from(*self).encode(buf);
            }
            fn decode(buf: &mut impl Buf) -> Result<Self, CodecError> {
                Ok($name::new(Uuid::decode(buf)?))
            }
        }
    };
}

wire_uuid_newtype!(IpcId);
wire_uuid_newtype!(DomainId);

macro_rules! wire_u64_newtype {
    ($name:ident) => {
        impl Wire for $name {
            fn encode(&self, buf: &mut BytesMut) {
                u64::from(*self).encode(buf);
            }
            fn decode(buf: &mut impl Buf) -> Result<Self, CodecError> {
                Ok($name::new(u64::decode(buf)?))
            }
        }
    };
}

wire_u64_newtype!(Pid);
wire_u64_newtype!(Hops);
wire_u64_newtype!(ResourceId);
wire_u64_newtype!(InstanceOrder);

macro_rules! wire_name_newtype {
    ($name:ident, $field:literal) => {
        impl Wire for $name {
            fn encode(&self, buf: &mut BytesMut) {
                self.clone().into_inner().encode(buf);
            }
            fn decode(buf: &mut impl Buf) -> Result<Self, CodecError> {
                let raw = String::decode(buf)?;
                $name::try_new(raw).map_err(|error| CodecError::InvalidValue {
                    field: $field,
                    reason: error.to_string(),
                })
            }
        }
    };
}

wire_name_newtype!(ServiceName, "service name");
wire_name_newtype!(QueueName, "queue name");
wire_name_newtype!(DomainName, "domain name");

impl Wire for Xid {
    fn encode(&self, buf: &mut BytesMut) {
        self.gtrid.encode(buf);
        self.bqual.encode(buf);
    }
    fn decode(buf: &mut impl Buf) -> Result<Self, CodecError> {
        Ok(Self {
            gtrid: Uuid::decode(buf)?,
            bqual: Uuid::decode(buf)?,
        })
    }
}

impl Wire for ProcessHandle {
    fn encode(&self, buf: &mut BytesMut) {
        self.pid.encode(buf);
        self.ipc.encode(buf);
    }
    fn decode(buf: &mut impl Buf) -> Result<Self, CodecError> {
        Ok(Self {
            pid: Pid::decode(buf)?,
            ipc: IpcId::decode(buf)?,
        })
    }
}

impl Wire for XaCode {
    fn encode(&self, buf: &mut BytesMut) {
        self.value().encode(buf);
    }
    fn decode(buf: &mut impl Buf) -> Result<Self, CodecError> {
        Ok(Self::from_value(i32::decode(buf)?))
    }
}

impl Wire for ErrorKind {
    fn encode(&self, buf: &mut BytesMut) {
        let tag: u8 = match self {
            Self::Absent => 0,
            Self::NoEntry => 1,
            Self::Timeout => 2,
            Self::ServiceError => 3,
            Self::CommunicationUnavailable => 4,
            Self::ProtocolVersion => 5,
            Self::InvalidSemantics => 6,
            Self::Xa(_) => 7,
        };
        buf.put_u8(tag);
        if let Self::Xa(code) = self {
            code.encode(buf);
        }
    }
    fn decode(buf: &mut impl Buf) -> Result<Self, CodecError> {
        match u8::decode(buf)? {
            0 => Ok(Self::Absent),
            1 => Ok(Self::NoEntry),
            2 => Ok(Self::Timeout),
            3 => Ok(Self::ServiceError),
            4 => Ok(Self::CommunicationUnavailable),
            5 => Ok(Self::ProtocolVersion),
            6 => Ok(Self::InvalidSemantics),
            7 => Ok(Self::Xa(XaCode::decode(buf)?)),
            other => Err(CodecError::InvalidValue {
                field: "error kind",
                reason: format!("unknown tag {other}"),
            }),
        }
    }
}

impl Wire for service::TransactionMode {
    fn encode(&self, buf: &mut BytesMut) {
        let tag: u8 = match self {
            Self::Automatic => 0,
            Self::Join => 1,
            Self::Atomic => 2,
            Self::None => 3,
        };
        buf.put_u8(tag);
    }
    fn decode(buf: &mut impl Buf) -> Result<Self, CodecError> {
        match u8::decode(buf)? {
            0 => Ok(Self::Automatic),
            1 => Ok(Self::Join),
            2 => Ok(Self::Atomic),
            3 => Ok(Self::None),
            other => Err(CodecError::InvalidValue {
                field: "transaction mode",
                reason: format!("unknown tag {other}"),
            }),
        }
    }
}

impl Wire for service::TimeoutContract {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(match self {
            Self::Linger => 0,
            Self::Kill => 1,
        });
    }
    fn decode(buf: &mut impl Buf) -> Result<Self, CodecError> {
        match u8::decode(buf)? {
            0 => Ok(Self::Linger),
            1 => Ok(Self::Kill),
            other => Err(CodecError::InvalidValue {
                field: "timeout contract",
                reason: format!("unknown tag {other}"),
            }),
        }
    }
}

impl Wire for service::ExecutionTimeout {
    fn encode(&self, buf: &mut BytesMut) {
        self.duration.encode(buf);
        self.contract.encode(buf);
    }
    fn decode(buf: &mut impl Buf) -> Result<Self, CodecError> {
        Ok(Self {
            duration: Duration::decode(buf)?,
            contract: service::TimeoutContract::decode(buf)?,
        })
    }
}

impl Wire for service::Service {
    fn encode(&self, buf: &mut BytesMut) {
        self.name.encode(buf);
        self.category.encode(buf);
        self.transaction.encode(buf);
        self.timeout.encode(buf);
    }
    fn decode(buf: &mut impl Buf) -> Result<Self, CodecError> {
        Ok(Self {
            name: ServiceName::decode(buf)?,
            category: String::decode(buf)?,
            transaction: service::TransactionMode::decode(buf)?,
            timeout: Option::decode(buf)?,
        })
    }
}

impl Wire for service::Call {
    fn encode(&self, buf: &mut BytesMut) {
        self.process.encode(buf);
        self.service.encode(buf);
        self.trid.encode(buf);
        self.no_reply.encode(buf);
        self.deadline.encode(buf);
        self.payload.encode(buf);
    }
    fn decode(buf: &mut impl Buf) -> Result<Self, CodecError> {
        Ok(Self {
            process: ProcessHandle::decode(buf)?,
            service: ServiceName::decode(buf)?,
            trid: Option::decode(buf)?,
            no_reply: bool::decode(buf)?,
            deadline: Option::decode(buf)?,
            payload: Vec::decode(buf)?,
        })
    }
}

impl Wire for service::Reply {
    fn encode(&self, buf: &mut BytesMut) {
        self.code.encode(buf);
        self.trid.encode(buf);
        self.payload.encode(buf);
    }
    fn decode(buf: &mut impl Buf) -> Result<Self, CodecError> {
        Ok(Self {
            code: Option::decode(buf)?,
            trid: Option::decode(buf)?,
            payload: Vec::decode(buf)?,
        })
    }
}

impl Wire for transaction::ResourceRequest {
    fn encode(&self, buf: &mut BytesMut) {
        self.process.encode(buf);
        self.trid.encode(buf);
        self.resource.encode(buf);
        self.flags.encode(buf);
    }
    fn decode(buf: &mut impl Buf) -> Result<Self, CodecError> {
        Ok(Self {
            process: ProcessHandle::decode(buf)?,
            trid: Xid::decode(buf)?,
            resource: ResourceId::decode(buf)?,
            flags: u64::decode(buf)?,
        })
    }
}

impl Wire for transaction::ResourceReply {
    fn encode(&self, buf: &mut BytesMut) {
        self.process.encode(buf);
        self.trid.encode(buf);
        self.resource.encode(buf);
        self.state.encode(buf);
    }
    fn decode(buf: &mut impl Buf) -> Result<Self, CodecError> {
        Ok(Self {
            process: ProcessHandle::decode(buf)?,
            trid: Xid::decode(buf)?,
            resource: ResourceId::decode(buf)?,
            state: XaCode::decode(buf)?,
        })
    }
}

impl Wire for queue::Message {
    fn encode(&self, buf: &mut BytesMut) {
        self.id.encode(buf);
        self.properties.encode(buf);
        self.reply.encode(buf);
        self.r#type.encode(buf);
        self.payload.encode(buf);
        self.available.encode(buf);
        self.timestamp.encode(buf);
        self.redelivered.encode(buf);
    }
    fn decode(buf: &mut impl Buf) -> Result<Self, CodecError> {
        Ok(Self {
            id: Uuid::decode(buf)?,
            properties: String::decode(buf)?,
            reply: Option::decode(buf)?,
            r#type: String::decode(buf)?,
            payload: Vec::decode(buf)?,
            available: SystemTime::decode(buf)?,
            timestamp: SystemTime::decode(buf)?,
            redelivered: u64::decode(buf)?,
        })
    }
}

impl Wire for queue::EnqueueRequest {
    fn encode(&self, buf: &mut BytesMut) {
        self.process.encode(buf);
        self.name.encode(buf);
        self.trid.encode(buf);
        self.message.encode(buf);
    }
    fn decode(buf: &mut impl Buf) -> Result<Self, CodecError> {
        Ok(Self {
            process: ProcessHandle::decode(buf)?,
            name: QueueName::decode(buf)?,
            trid: Option::decode(buf)?,
            message: queue::Message::decode(buf)?,
        })
    }
}

impl Wire for queue::EnqueueReply {
    fn encode(&self, buf: &mut BytesMut) {
        self.id.encode(buf);
        self.code.encode(buf);
    }
    fn decode(buf: &mut impl Buf) -> Result<Self, CodecError> {
        Ok(Self {
            id: Option::decode(buf)?,
            code: Option::decode(buf)?,
        })
    }
}

impl Wire for queue::DequeueRequest {
    fn encode(&self, buf: &mut BytesMut) {
        self.process.encode(buf);
        self.name.encode(buf);
        self.trid.encode(buf);
        self.properties.encode(buf);
        self.block.encode(buf);
    }
    fn decode(buf: &mut impl Buf) -> Result<Self, CodecError> {
        Ok(Self {
            process: ProcessHandle::decode(buf)?,
            name: QueueName::decode(buf)?,
            trid: Option::decode(buf)?,
            properties: Option::decode(buf)?,
            block: bool::decode(buf)?,
        })
    }
}

impl Wire for queue::DequeueReply {
    fn encode(&self, buf: &mut BytesMut) {
        self.message.encode(buf);
        self.code.encode(buf);
    }
    fn decode(buf: &mut impl Buf) -> Result<Self, CodecError> {
        Ok(Self {
            message: Option::decode(buf)?,
            code: Option::decode(buf)?,
        })
    }
}

impl Wire for gateway::Identity {
    fn encode(&self, buf: &mut BytesMut) {
        self.id.encode(buf);
        self.name.encode(buf);
    }
    fn decode(buf: &mut impl Buf) -> Result<Self, CodecError> {
        Ok(Self {
            id: DomainId::decode(buf)?,
            name: DomainName::decode(buf)?,
        })
    }
}

impl Wire for gateway::DomainConnectRequest {
    fn encode(&self, buf: &mut BytesMut) {
        self.domain.encode(buf);
        self.versions.encode(buf);
    }
    fn decode(buf: &mut impl Buf) -> Result<Self, CodecError> {
        Ok(Self {
            domain: gateway::Identity::decode(buf)?,
            versions: Vec::decode(buf)?,
        })
    }
}

impl Wire for gateway::DomainConnectReply {
    fn encode(&self, buf: &mut BytesMut) {
        self.domain.encode(buf);
        self.version.encode(buf);
    }
    fn decode(buf: &mut impl Buf) -> Result<Self, CodecError> {
        Ok(Self {
            domain: gateway::Identity::decode(buf)?,
            version: u64::decode(buf)?,
        })
    }
}

impl Wire for gateway::DiscoverRequest {
    fn encode(&self, buf: &mut BytesMut) {
        self.process.encode(buf);
        self.domain.encode(buf);
        self.services.encode(buf);
        self.queues.encode(buf);
    }
    fn decode(buf: &mut impl Buf) -> Result<Self, CodecError> {
        Ok(Self {
            process: Option::decode(buf)?,
            domain: gateway::Identity::decode(buf)?,
            services: Vec::decode(buf)?,
            queues: Vec::decode(buf)?,
        })
    }
}

impl Wire for gateway::DiscoveredService {
    fn encode(&self, buf: &mut BytesMut) {
        self.service.encode(buf);
        self.hops.encode(buf);
    }
    fn decode(buf: &mut impl Buf) -> Result<Self, CodecError> {
        Ok(Self {
            service: service::Service::decode(buf)?,
            hops: Hops::decode(buf)?,
        })
    }
}

impl Wire for gateway::DiscoverReply {
    fn encode(&self, buf: &mut BytesMut) {
        self.domain.encode(buf);
        self.services.encode(buf);
        self.queues.encode(buf);
    }
    fn decode(buf: &mut impl Buf) -> Result<Self, CodecError> {
        Ok(Self {
            domain: gateway::Identity::decode(buf)?,
            services: Vec::decode(buf)?,
            queues: Vec::decode(buf)?,
        })
    }
}

impl Wire for gateway::DomainAdvertise {
    fn encode(&self, buf: &mut BytesMut) {
        self.domain.encode(buf);
        self.services.encode(buf);
        self.queues.encode(buf);
    }
    fn decode(buf: &mut impl Buf) -> Result<Self, CodecError> {
        Ok(Self {
            domain: gateway::Identity::decode(buf)?,
            services: Vec::decode(buf)?,
            queues: Vec::decode(buf)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain_types::Xid;

    fn call_envelope() -> Envelope {
        Envelope::new(Message::ServiceCall(service::Call {
            process: ProcessHandle::new(Pid::new(42), IpcId::generate()),
            service: ServiceName::try_new("casual/example/echo").expect("valid name"),
            trid: Some(Xid::generate()),
            no_reply: false,
            deadline: None,
            payload: b"casual\n".to_vec(),
        }))
    }

    #[test]
    fn network_round_trip_service_call() {
        let envelope = call_envelope();
        let encoded = encode_network(&envelope).expect("encodes");
        let decoded = decode_network(&encoded).expect("decodes");
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn network_round_trip_is_byte_stable() {
        let envelope = call_envelope();
        let first = encode_network(&envelope).expect("encodes");
        let decoded = decode_network(&first).expect("decodes");
        let second = encode_network(&decoded).expect("re-encodes");
        assert_eq!(first, second);
    }

    #[test]
    fn ipc_round_trip() {
        let envelope = call_envelope();
        let encoded = encode_ipc(&envelope).expect("encodes");
        let decoded = decode_ipc(&encoded).expect("decodes");
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn non_interdomain_message_has_no_network_schema() {
        let envelope = Envelope::new(Message::Poke);
        assert!(encode_network(&envelope).is_err());
    }

    #[test]
    fn truncated_network_payload_is_rejected() {
        let envelope = call_envelope();
        let encoded = encode_network(&envelope).expect("encodes");
        let truncated = &encoded[..encoded.len() - 3];
        assert!(decode_network(truncated).is_err());
    }

    #[test]
    fn connect_round_trip_preserves_versions() {
        let envelope = Envelope::new(Message::GatewayDomainConnectRequest(
            gateway::DomainConnectRequest {
                domain: gateway::Identity {
                    id: DomainId::generate(),
                    name: DomainName::try_new("domain-a").expect("valid name"),
                },
                versions: gateway::PROTOCOL_VERSIONS.to_vec(),
            },
        ));
        let decoded = decode_network(&encode_network(&envelope).expect("encodes")).expect("decodes");
        assert_eq!(decoded, envelope);
    }
}
