//! Pending-send queue
//!
//! A handler never blocks on a full peer device. Frames that could not be
//! delivered are parked here and retried when the owning event loop goes
//! idle. Frames addressed to a device that has disappeared are dropped with
//! a warning; exit handling deals with the consequences.

use std::collections::VecDeque;

use tracing::warn;

use crate::domain_types::IpcId;
use crate::error::CasualError;
use crate::message::Envelope;
use crate::transport::Transport;
use crate::transport::bus::{Bus, SendOutcome};

#[derive(Debug)]
struct Parked {
    to: IpcId,
    frames: Vec<Transport>,
}

/// Per-manager holder of undeliverable sends
#[derive(Debug, Default)]
pub struct Holder {
    parked: VecDeque<Parked>,
}

impl Holder {
    /// Creates an empty holder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sends, parking the remainder when the destination is busy.
    ///
    /// A send to an already-parked destination is parked directly so
    /// per-pair ordering is not broken by the retry path.
    ///
    /// # Errors
    ///
    /// Propagates codec failures; routing outcomes are absorbed.
    pub fn send(&mut self, bus: &Bus, to: IpcId, envelope: &Envelope) -> Result<(), CasualError> {
        if self.parked.iter().any(|entry| entry.to == to) {
            let payload = crate::message::codec::encode_ipc(envelope)?;
            let frames = crate::transport::fragment(
                envelope.message.message_type(),
                envelope.correlation,
                &payload,
            );
            self.parked.push_back(Parked { to, frames });
            return Ok(());
        }

        match bus.send(to, envelope)? {
            SendOutcome::Sent => {}
            SendOutcome::Busy(frames) => {
                self.parked.push_back(Parked { to, frames });
            }
            SendOutcome::Unavailable => {
                warn!(%to, message_type = %envelope.message.message_type(),
                    "destination device gone - action: drop message");
            }
        }
        Ok(())
    }

    /// Retries parked sends in arrival order; called at loop idle
    pub fn flush(&mut self, bus: &Bus) {
        let mut keep = VecDeque::new();
        while let Some(entry) = self.parked.pop_front() {
            // preserve order per destination: if an earlier send to the same
            // destination is still parked, do not overtake it
            if keep.iter().any(|kept: &Parked| kept.to == entry.to) {
                keep.push_back(entry);
                continue;
            }
            match bus.send_frames(entry.to, entry.frames) {
                SendOutcome::Sent => {}
                SendOutcome::Busy(frames) => {
                    keep.push_back(Parked {
                        to: entry.to,
                        frames,
                    });
                }
                SendOutcome::Unavailable => {
                    warn!(to = %entry.to, "destination device gone - action: drop parked frames");
                }
            }
        }
        self.parked = keep;
    }

    /// Drops parked frames addressed to a dead process's device
    pub fn discard(&mut self, to: IpcId) {
        self.parked.retain(|entry| entry.to != to);
    }

    /// Number of parked sends
    #[must_use]
    pub fn len(&self) -> usize {
        self.parked.len()
    }

    /// Whether nothing is parked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.parked.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    #[tokio::test]
    async fn parked_sends_flush_in_order() {
        let bus = Bus::new();
        let ipc = IpcId::generate();
        let mut inbound = bus.register(ipc);
        let mut holder = Holder::new();

        // fill the device so the next send parks: capacity is in frames, one
        // frame per small message
        let filler = Envelope::new(Message::Poke);
        let mut sent = 0usize;
        loop {
            match bus.send(ipc, &filler).expect("encodes") {
                SendOutcome::Sent => sent += 1,
                SendOutcome::Busy(frames) => {
                    holder.send(&bus, ipc, &filler).expect("parks");
                    drop(frames);
                    break;
                }
                SendOutcome::Unavailable => panic!("device is registered"),
            }
        }
        assert!(!holder.is_empty());

        // drain a few messages, then flush
        for _ in 0..4 {
            let _ = inbound.next().await.expect("queued message");
        }
        holder.flush(&bus);
        assert!(holder.is_empty());

        // everything sent before plus the parked one arrives
        for _ in 0..sent - 4 + 1 {
            let _ = inbound.next().await.expect("remaining message");
        }
    }

    #[tokio::test]
    async fn discard_drops_parked_frames() {
        let bus = Bus::new();
        let ipc = IpcId::generate();
        let _inbound = bus.register(ipc);
        let mut holder = Holder::new();

        let filler = Envelope::new(Message::Poke);
        loop {
            if let SendOutcome::Busy(_) = bus.send(ipc, &filler).expect("encodes") {
                holder.send(&bus, ipc, &filler).expect("parks");
                break;
            }
        }
        assert_eq!(holder.len(), 1);
        holder.discard(ipc);
        assert!(holder.is_empty());
    }
}
