//! Message transport
//!
//! Carries variable-size logical messages over fixed-capacity frames while
//! preserving per-pair ordering and per-message atomicity. A sender
//! fragments an encoded payload into contiguous offset-tagged [`Transport`]
//! frames; a receiver reassembles by correlation. The same framing runs over
//! the intra-domain bus and, with a length prefix, over gateway TCP
//! connections.

use crate::domain_types::Correlation;
use crate::error::CasualError;
use crate::message::MessageType;

pub mod bus;
pub mod pending;
pub mod tcp;

/// Maximum payload bytes carried by one frame
pub const MAX_PAYLOAD: usize = 8 * 1024;

/// One fixed-capacity frame of a logical message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transport {
    /// Type of the logical message
    pub message_type: MessageType,
    /// Correlation the frame belongs to
    pub correlation: Correlation,
    /// Byte offset of this frame's data within the payload
    pub offset: u64,
    /// Total payload size; identical across all frames of a correlation
    pub total_size: u64,
    /// The carried bytes, at most [`MAX_PAYLOAD`]
    pub data: Vec<u8>,
}

/// Splits an encoded payload into contiguous frames.
///
/// A zero-size payload still yields one frame so the receiver observes the
/// message.
#[must_use]
pub fn fragment(
    message_type: MessageType,
    correlation: Correlation,
    payload: &[u8],
) -> Vec<Transport> {
    if payload.is_empty() {
        return vec![Transport {
            message_type,
            correlation,
            offset: 0,
            total_size: 0,
            data: Vec::new(),
        }];
    }

    payload
        .chunks(MAX_PAYLOAD)
        .enumerate()
        .map(|(index, chunk)| Transport {
            message_type,
            correlation,
            offset: (index * MAX_PAYLOAD) as u64,
            total_size: payload.len() as u64,
            data: chunk.to_vec(),
        })
        .collect()
}

/// A fully reassembled logical message, payload still encoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Complete {
    /// Type of the logical message
    pub message_type: MessageType,
    /// Correlation of the message
    pub correlation: Correlation,
    /// The encoded payload
    pub payload: Vec<u8>,
}

#[derive(Debug)]
struct Buffer {
    message_type: MessageType,
    total_size: u64,
    received: u64,
    data: Vec<u8>,
}

/// Reassembles frames into complete messages, keyed by correlation.
///
/// Fragments may arrive in any order; a fragment of an unknown correlation
/// allocates a buffer. Reassembly completes when the received counts sum to
/// `total_size`.
#[derive(Debug, Default)]
pub struct Assembler {
    buffers: std::collections::HashMap<Correlation, Buffer>,
}

impl Assembler {
    /// Creates an empty assembler
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one frame; returns the complete message when reassembly is done
    ///
    /// # Errors
    ///
    /// Returns [`CasualError::TransportProtocol`] on a `total_size` mismatch
    /// or a frame extending past the announced size. The owning connection
    /// must be dropped on such an error.
    pub fn insert(&mut self, frame: Transport) -> Result<Option<Complete>, CasualError> {
        let end = frame.offset + frame.data.len() as u64;
        if end > frame.total_size {
            return Err(CasualError::TransportProtocol {
                reason: format!(
                    "frame [{}, {end}) extends past total size {}",
                    frame.offset, frame.total_size
                ),
            });
        }

        let buffer = self.buffers.entry(frame.correlation).or_insert_with(|| {
            let total = usize::try_from(frame.total_size).unwrap_or(usize::MAX);
            Buffer {
                message_type: frame.message_type,
                total_size: frame.total_size,
                received: 0,
                data: vec![0u8; total],
            }
        });

        if buffer.total_size != frame.total_size {
            let existing_total_size = buffer.total_size;
            self.buffers.remove(&frame.correlation);
            return Err(CasualError::TransportProtocol {
                reason: format!(
                    "fragment size mismatch for {}: {} != {}",
                    frame.correlation, frame.total_size, existing_total_size
                ),
            });
        }

        let offset = usize::try_from(frame.offset).unwrap_or(usize::MAX);
        buffer.data[offset..offset + frame.data.len()].copy_from_slice(&frame.data);
        buffer.received += frame.data.len() as u64;

        if buffer.received >= buffer.total_size {
            let buffer = self
                .buffers
                .remove(&frame.correlation)
                .unwrap_or_else(|| unreachable!("buffer present for this correlation"));
            return Ok(Some(Complete {
                message_type: buffer.message_type,
                correlation: frame.correlation,
                payload: buffer.data,
            }));
        }

        Ok(None)
    }

    /// Drops every partial reassembly; used when the peer goes away
    pub fn clear(&mut self) {
        self.buffers.clear();
    }

    /// Number of partial reassemblies in flight
    #[must_use]
    pub fn partial(&self) -> usize {
        self.buffers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn correlation() -> Correlation {
        Correlation::generate()
    }

    #[test]
    fn small_payload_is_a_single_frame() {
        let frames = fragment(MessageType::Poke, correlation(), b"abc");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].offset, 0);
        assert_eq!(frames[0].total_size, 3);
    }

    #[test]
    fn empty_payload_still_travels() {
        let frames = fragment(MessageType::Poke, correlation(), b"");
        assert_eq!(frames.len(), 1);

        let mut assembler = Assembler::new();
        let complete = assembler
            .insert(frames[0].clone())
            .expect("valid frame")
            .expect("complete");
        assert!(complete.payload.is_empty());
    }

    #[test]
    fn large_payload_reassembles() {
        let payload: Vec<u8> = (0..MAX_PAYLOAD * 3 + 17).map(|i| (i % 251) as u8).collect();
        let frames = fragment(MessageType::ServiceCall, correlation(), &payload);
        assert_eq!(frames.len(), 4);

        let mut assembler = Assembler::new();
        let mut complete = None;
        for frame in frames {
            if let Some(done) = assembler.insert(frame).expect("valid frame") {
                complete = Some(done);
            }
        }
        assert_eq!(complete.expect("complete").payload, payload);
        assert_eq!(assembler.partial(), 0);
    }

    #[test]
    fn out_of_order_arrival_reassembles() {
        let payload: Vec<u8> = (0..MAX_PAYLOAD * 2 + 5).map(|i| (i % 253) as u8).collect();
        let mut frames = fragment(MessageType::ServiceCall, correlation(), &payload);
        frames.reverse();

        let mut assembler = Assembler::new();
        let mut complete = None;
        for frame in frames {
            if let Some(done) = assembler.insert(frame).expect("valid frame") {
                complete = Some(done);
            }
        }
        assert_eq!(complete.expect("complete").payload, payload);
    }

    #[test]
    fn total_size_mismatch_is_a_protocol_error() {
        let id = correlation();
        let frames = fragment(MessageType::ServiceCall, id, &vec![1u8; MAX_PAYLOAD * 2]);

        let mut assembler = Assembler::new();
        assert!(assembler.insert(frames[0].clone()).expect("first frame").is_none());

        let mut bad = frames[1].clone();
        bad.total_size += 1;
        assert!(assembler.insert(bad).is_err());
    }

    #[test]
    fn frame_past_total_size_is_rejected() {
        let mut assembler = Assembler::new();
        let frame = Transport {
            message_type: MessageType::Poke,
            correlation: correlation(),
            offset: 10,
            total_size: 5,
            data: vec![0u8; 4],
        };
        assert!(assembler.insert(frame).is_err());
    }

    #[test]
    fn interleaved_correlations_do_not_mix() {
        let a = correlation();
        let b = correlation();
        let payload_a = vec![1u8; MAX_PAYLOAD + 1];
        let payload_b = vec![2u8; MAX_PAYLOAD + 1];

        let frames_a = fragment(MessageType::ServiceCall, a, &payload_a);
        let frames_b = fragment(MessageType::ServiceCall, b, &payload_b);

        let mut assembler = Assembler::new();
        assert!(assembler.insert(frames_a[0].clone()).expect("ok").is_none());
        assert!(assembler.insert(frames_b[0].clone()).expect("ok").is_none());

        let done_a = assembler
            .insert(frames_a[1].clone())
            .expect("ok")
            .expect("complete");
        assert_eq!(done_a.payload, payload_a);

        let done_b = assembler
            .insert(frames_b[1].clone())
            .expect("ok")
            .expect("complete");
        assert_eq!(done_b.payload, payload_b);
    }
}
