//! Property tests for the wire layer: network-codec round-trips are
//! byte-exact, fragmentation reassembles under any arrival order, and
//! conflicting fragment sizes are rejected.

use proptest::prelude::*;

use casual::domain_types::{
    Correlation, DomainId, DomainName, Hops, IpcId, Pid, ServiceName, Xid,
};
use casual::error::ErrorKind;
use casual::message::gateway::{DiscoverReply, DiscoveredService, Identity};
use casual::message::service::{Call, Reply, Service};
use casual::message::{Envelope, Message, MessageType, codec};
use casual::process::ProcessHandle;
use casual::transport::{Assembler, MAX_PAYLOAD, fragment};
use casual::xa::XaCode;

fn arbitrary_service_name() -> impl Strategy<Value = ServiceName> {
    "[a-z][a-z0-9/._-]{0,80}"
        .prop_filter_map("valid service name", |raw| ServiceName::try_new(raw).ok())
}

fn arbitrary_handle() -> impl Strategy<Value = ProcessHandle> {
    (1u64..=u64::MAX).prop_map(|pid| ProcessHandle::new(Pid::new(pid), IpcId::generate()))
}

fn arbitrary_error_kind() -> impl Strategy<Value = ErrorKind> {
    prop_oneof![
        Just(ErrorKind::Absent),
        Just(ErrorKind::NoEntry),
        Just(ErrorKind::Timeout),
        Just(ErrorKind::ServiceError),
        Just(ErrorKind::CommunicationUnavailable),
        Just(ErrorKind::ProtocolVersion),
        Just(ErrorKind::InvalidSemantics),
        Just(ErrorKind::Xa(XaCode::Ok)),
        Just(ErrorKind::Xa(XaCode::HeuristicMixed)),
        Just(ErrorKind::Xa(XaCode::RollbackTimeout)),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn service_call_round_trips_byte_exact(
        name in arbitrary_service_name(),
        handle in arbitrary_handle(),
        payload in proptest::collection::vec(any::<u8>(), 0..4096),
        transactional in any::<bool>(),
        no_reply in any::<bool>(),
    ) {
        let envelope = Envelope::new(Message::ServiceCall(Call {
            process: handle,
            service: name,
            trid: transactional.then(Xid::generate),
            no_reply,
            deadline: None,
            payload,
        }));

        let encoded = codec::encode_network(&envelope).expect("encodes");
        let decoded = codec::decode_network(&encoded).expect("decodes");
        prop_assert_eq!(&decoded, &envelope);

        // serialize-then-deserialize yields a byte-equal payload
        let re_encoded = codec::encode_network(&decoded).expect("re-encodes");
        prop_assert_eq!(re_encoded, encoded);
    }

    #[test]
    fn service_reply_round_trips(
        payload in proptest::collection::vec(any::<u8>(), 0..4096),
        kind in proptest::option::of(arbitrary_error_kind()),
    ) {
        let envelope = Envelope::new(Message::ServiceReply(Reply {
            code: kind,
            trid: None,
            payload,
        }));
        let decoded = codec::decode_network(&codec::encode_network(&envelope).expect("encodes"))
            .expect("decodes");
        prop_assert_eq!(decoded, envelope);
    }

    #[test]
    fn discover_reply_round_trips(
        names in proptest::collection::vec(arbitrary_service_name(), 0..8),
        hops in 0u64..16,
    ) {
        let envelope = Envelope::new(Message::GatewayDomainDiscoverReply(DiscoverReply {
            domain: Identity {
                id: DomainId::generate(),
                name: DomainName::try_new("property-domain").expect("valid name"),
            },
            services: names
                .into_iter()
                .map(|name| DiscoveredService {
                    service: Service::named(name),
                    hops: Hops::new(hops),
                })
                .collect(),
            queues: Vec::new(),
        }));
        let decoded = codec::decode_network(&codec::encode_network(&envelope).expect("encodes"))
            .expect("decodes");
        prop_assert_eq!(decoded, envelope);
    }

    #[test]
    fn fragmentation_reassembles_any_payload(
        payload in proptest::collection::vec(any::<u8>(), 0..(MAX_PAYLOAD * 3 + 100)),
    ) {
        let correlation = Correlation::generate();
        let frames = fragment(MessageType::ServiceCall, correlation, &payload);

        let mut assembler = Assembler::new();
        let mut complete = None;
        for frame in frames {
            if let Some(done) = assembler.insert(frame).expect("valid frames") {
                complete = Some(done);
            }
        }
        let complete = complete.expect("reassembly completes");
        prop_assert_eq!(complete.payload, payload);
        prop_assert_eq!(complete.correlation, correlation);
    }

    #[test]
    fn fragmentation_survives_shuffled_arrival(
        payload in proptest::collection::vec(any::<u8>(), 1..(MAX_PAYLOAD * 4)),
        seed in any::<u64>(),
    ) {
        let correlation = Correlation::generate();
        let mut frames = fragment(MessageType::ServiceCall, correlation, &payload);

        // deterministic shuffle from the seed
        let mut state = seed | 1;
        for index in (1..frames.len()).rev() {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let other = (state as usize) % (index + 1);
            frames.swap(index, other);
        }

        let mut assembler = Assembler::new();
        let mut complete = None;
        for frame in frames {
            if let Some(done) = assembler.insert(frame).expect("valid frames") {
                complete = Some(done);
            }
        }
        prop_assert_eq!(complete.expect("reassembly completes").payload, payload);
    }

    #[test]
    fn conflicting_total_size_is_rejected(
        payload in proptest::collection::vec(any::<u8>(), (MAX_PAYLOAD + 1)..(MAX_PAYLOAD * 2)),
        bump in 1u64..1000,
    ) {
        let frames = fragment(MessageType::ServiceCall, Correlation::generate(), &payload);
        prop_assume!(frames.len() >= 2);

        let mut assembler = Assembler::new();
        prop_assert!(assembler.insert(frames[0].clone()).expect("first frame").is_none());

        let mut conflicting = frames[1].clone();
        conflicting.total_size += bump;
        prop_assert!(assembler.insert(conflicting).is_err());
    }
}
