//! The intra-domain message bus
//!
//! Stands in for the OS queue namespace: a routing table from device id to
//! the owning manager's channel. Senders fragment; receivers reassemble.
//! Per-pair FIFO follows from channel ordering, and a send never blocks a
//! handler: a full channel surfaces as [`SendOutcome::Busy`] and the caller
//! parks the frames on its pending-send queue.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::warn;

use crate::domain_types::IpcId;
use crate::error::CasualError;
use crate::message::{Envelope, codec};
use crate::transport::{Assembler, Transport, fragment};

/// Channel capacity of one inbound device, in frames
const DEVICE_CAPACITY: usize = 1024;

/// Result of a non-blocking send
#[derive(Debug)]
pub enum SendOutcome {
    /// All frames were delivered
    Sent,
    /// The destination exists but its device is full; the returned frames
    /// must be parked and retried
    Busy(Vec<Transport>),
    /// The destination device is not registered
    Unavailable,
}

/// Routing table shared by every manager of a domain
#[derive(Debug, Default)]
pub struct Bus {
    routes: DashMap<IpcId, mpsc::Sender<Transport>>,
}

impl Bus {
    /// Creates an empty bus
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a fresh inbound device
    #[must_use]
    pub fn register(self: &Arc<Self>, ipc: IpcId) -> Inbound {
        let (tx, rx) = mpsc::channel(DEVICE_CAPACITY);
        self.routes.insert(ipc, tx);
        Inbound {
            ipc,
            rx,
            assembler: Assembler::new(),
        }
    }

    /// Removes a device; subsequent sends to it are [`SendOutcome::Unavailable`]
    pub fn remove(&self, ipc: IpcId) {
        self.routes.remove(&ipc);
    }

    /// Whether a device is registered
    #[must_use]
    pub fn exists(&self, ipc: IpcId) -> bool {
        self.routes.contains_key(&ipc)
    }

    /// Non-blocking send of a logical message in the compact layout.
    ///
    /// # Errors
    ///
    /// Returns a codec error when the envelope cannot be serialized; routing
    /// outcomes are reported through [`SendOutcome`], not as errors.
    pub fn send(&self, to: IpcId, envelope: &Envelope) -> Result<SendOutcome, CasualError> {
        let payload = codec::encode_ipc(envelope)?;
        let frames = fragment(
            envelope.message.message_type(),
            envelope.correlation,
            &payload,
        );
        Ok(self.send_frames(to, frames))
    }

    /// Non-blocking send of already-fragmented frames (pending retries)
    #[must_use]
    pub fn send_frames(&self, to: IpcId, frames: Vec<Transport>) -> SendOutcome {
        let Some(route) = self.routes.get(&to) else {
            return SendOutcome::Unavailable;
        };

        let mut remaining = frames.into_iter();
        while let Some(frame) = remaining.next() {
            match route.try_send(frame) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(frame)) => {
                    let mut parked = vec![frame];
                    parked.extend(remaining);
                    return SendOutcome::Busy(parked);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    return SendOutcome::Unavailable;
                }
            }
        }
        SendOutcome::Sent
    }
}

/// A manager's inbound device: receives frames, yields logical messages
#[derive(Debug)]
pub struct Inbound {
    ipc: IpcId,
    rx: mpsc::Receiver<Transport>,
    assembler: Assembler,
}

impl Inbound {
    /// The id other processes address this device by
    #[must_use]
    pub fn ipc(&self) -> IpcId {
        self.ipc
    }

    /// Awaits the next complete logical message.
    ///
    /// Frames that fail reassembly or decoding are logged and skipped; a
    /// protocol error on the shared bus indicates a local bug, not a
    /// hostile peer, so the device keeps running. Returns `None` when every
    /// sender is gone and the device is drained.
    pub async fn next(&mut self) -> Option<Envelope> {
        loop {
            let frame = self.rx.recv().await?;
            match self.assembler.insert(frame) {
                Ok(Some(complete)) => match codec::decode_ipc(&complete.payload) {
                    Ok(envelope) => return Some(envelope),
                    Err(error) => {
                        warn!(%error, correlation = %complete.correlation, "undecodable message - action: discard");
                    }
                },
                Ok(None) => {}
                Err(error) => {
                    warn!(%error, "transport protocol violation on inbound device - action: discard");
                }
            }
        }
    }

    /// Non-awaiting variant: yields a message only if one is already queued
    pub fn try_next(&mut self) -> Option<Envelope> {
        loop {
            let frame = self.rx.try_recv().ok()?;
            match self.assembler.insert(frame) {
                Ok(Some(complete)) => match codec::decode_ipc(&complete.payload) {
                    Ok(envelope) => return Some(envelope),
                    Err(error) => {
                        warn!(%error, correlation = %complete.correlation, "undecodable message - action: discard");
                    }
                },
                Ok(None) => {}
                Err(error) => {
                    warn!(%error, "transport protocol violation on inbound device - action: discard");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    #[tokio::test]
    async fn send_and_receive_round_trip() {
        let bus = Bus::new();
        let ipc = IpcId::generate();
        let mut inbound = bus.register(ipc);

        let envelope = Envelope::new(Message::ShutdownReply);
        match bus.send(ipc, &envelope).expect("encodes") {
            SendOutcome::Sent => {}
            other => panic!("expected Sent, got {other:?}"),
        }

        let received = inbound.next().await.expect("message arrives");
        assert_eq!(received, envelope);
    }

    #[tokio::test]
    async fn unknown_destination_is_unavailable() {
        let bus = Bus::new();
        let envelope = Envelope::new(Message::Poke);
        match bus.send(IpcId::generate(), &envelope).expect("encodes") {
            SendOutcome::Unavailable => {}
            other => panic!("expected Unavailable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn removed_device_becomes_unavailable() {
        let bus = Bus::new();
        let ipc = IpcId::generate();
        let _inbound = bus.register(ipc);
        bus.remove(ipc);

        let envelope = Envelope::new(Message::Poke);
        match bus.send(ipc, &envelope).expect("encodes") {
            SendOutcome::Unavailable => {}
            other => panic!("expected Unavailable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn per_pair_order_is_preserved() {
        let bus = Bus::new();
        let ipc = IpcId::generate();
        let mut inbound = bus.register(ipc);

        let first = Envelope::new(Message::ShutdownReply);
        let second = Envelope::new(Message::Poke);
        assert!(matches!(
            bus.send(ipc, &first).expect("encodes"),
            SendOutcome::Sent
        ));
        assert!(matches!(
            bus.send(ipc, &second).expect("encodes"),
            SendOutcome::Sent
        ));

        assert_eq!(inbound.next().await.expect("first"), first);
        assert_eq!(inbound.next().await.expect("second"), second);
    }
}
