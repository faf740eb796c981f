use crate::error::TransportError;
use crate::protocol::FrontendEnvelope;
use crate::session::Transport;
use std::sync::mpsc::{SyncSender, TrySendError};
use tracing::warn;

/// Hands requests to the stdout writer thread through a bounded queue. Never
/// blocks the UI thread; a full queue fails the round instead.
pub struct ChannelTransport {
    tx: SyncSender<FrontendEnvelope>,
    capacity: usize,
    dropped: u64,
}

impl ChannelTransport {
    pub fn new(tx: SyncSender<FrontendEnvelope>, capacity: usize) -> Self {
        Self {
            tx,
            capacity,
            dropped: 0,
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl Transport for ChannelTransport {
    fn send(&mut self, envelope: FrontendEnvelope) -> Result<(), TransportError> {
        match self.tx.try_send(envelope) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_envelope)) => {
                self.dropped += 1;
                if self.dropped == 1 || self.dropped.is_power_of_two() {
                    warn!(
                        cap = self.capacity,
                        dropped = self.dropped,
                        "outbound queue full; dropping request"
                    );
                }
                Err(TransportError::QueueFull(self.capacity))
            }
            Err(TrySendError::Disconnected(_envelope)) => Err(TransportError::Closed),
        }
    }
}
