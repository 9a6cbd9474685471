//! Peer coordination: one broadcast channel per file path, shared by every
//! peer attached to the same database.
//!
//! Delivery is best-effort and unordered. That is fine because each peer
//! re-reads the durable pending log at reserved-lock escalation, so a lost or
//! lagged broadcast is eventually observed anyway; the channel only makes
//! propagation prompt.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

use crate::tx::Tx;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PeerMessage {
    /// A freshly committed transaction record.
    Commit(Tx),
    /// Ask peers that are not currently transacting to drop their shared
    /// read lock so the sender can take it exclusively.
    AccessRequest { exclusive: bool },
}

#[derive(Debug, Clone)]
struct Envelope {
    from: Uuid,
    message: PeerMessage,
}

/// Hands out per-path [PeerChannel]s; owned by the VFS instance so peers
/// share it by cloning the VFS.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: Mutex<HashMap<String, broadcast::Sender<Envelope>>>,
}

impl ChannelRegistry {
    pub fn subscribe(&self, path: &str) -> PeerChannel {
        let mut channels = self.channels.lock().unwrap();
        let sender = channels
            .entry(path.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        PeerChannel {
            id: Uuid::new_v4(),
            receiver: sender.subscribe(),
            sender: sender.clone(),
        }
    }
}

pub struct PeerChannel {
    id: Uuid,
    sender: broadcast::Sender<Envelope>,
    receiver: broadcast::Receiver<Envelope>,
}

impl PeerChannel {
    pub fn peer_id(&self) -> Uuid {
        self.id
    }

    pub fn broadcast(&self, message: PeerMessage) {
        // A send with no peers listening is not an error; a lone writer
        // commits just fine.
        let _ = self.sender.send(Envelope {
            from: self.id,
            message,
        });
    }

    /// Drain the next foreign message without waiting.
    pub fn try_recv(&mut self) -> Option<PeerMessage> {
        loop {
            match self.receiver.try_recv() {
                Ok(envelope) if envelope.from == self.id => continue,
                Ok(envelope) => return Some(envelope.message),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "peer channel lagged; relying on the durable pending log");
                    continue;
                }
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peers_see_each_other_but_not_themselves() {
        let registry = ChannelRegistry::default();
        let mut alice = registry.subscribe("/db");
        let mut bob = registry.subscribe("/db");

        alice.broadcast(PeerMessage::Commit(Tx::new(1, 4096)));
        assert!(alice.try_recv().is_none(), "own messages are filtered");
        match bob.try_recv() {
            Some(PeerMessage::Commit(tx)) => assert_eq!(tx.tx_id, 1),
            other => panic!("expected commit, got {other:?}"),
        }
        assert!(bob.try_recv().is_none());
    }

    #[test]
    fn channels_are_per_path() {
        let registry = ChannelRegistry::default();
        let alice = registry.subscribe("/db");
        let mut other = registry.subscribe("/elsewhere");

        alice.broadcast(PeerMessage::AccessRequest { exclusive: true });
        assert!(other.try_recv().is_none());
    }

    #[test]
    fn late_subscribers_miss_older_messages() {
        let registry = ChannelRegistry::default();
        let alice = registry.subscribe("/db");
        alice.broadcast(PeerMessage::Commit(Tx::new(1, 0)));

        // The durable pending log, not the channel, covers the gap.
        let mut late = registry.subscribe("/db");
        assert!(late.try_recv().is_none());
    }
}
