use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Reservation;

const CHANNEL_CAPACITY: usize = 256;

/// A notification-worthy event, addressed to one holder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Confirmed(Reservation),
    Modified { before: Reservation, after: Reservation },
    Cancelled(Reservation),
    /// Every reservation of one holder cancelled by a single maintenance
    /// window.
    AutoCancelled {
        holder_id: String,
        resource_id: Ulid,
        reason: String,
        reservations: Vec<Reservation>,
    },
    NoShow(Reservation),
}

impl Notice {
    pub fn holder_id(&self) -> &str {
        match self {
            Notice::Confirmed(r) | Notice::Cancelled(r) | Notice::NoShow(r) => &r.holder_id,
            Notice::Modified { after, .. } => &after.holder_id,
            Notice::AutoCancelled { holder_id, .. } => holder_id,
        }
    }
}

/// Fire-and-forget delivery. Implementations must not block and must not
/// fail the caller; the state change is already committed.
pub trait Notifier: Send + Sync {
    fn notify(&self, notice: Notice);
}

/// Broadcast hub with one channel per holder.
pub struct NotifyHub {
    channels: DashMap<String, broadcast::Sender<Notice>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a holder's notices. Creates the channel if needed.
    pub fn subscribe(&self, holder_id: &str) -> broadcast::Receiver<Notice> {
        let sender = self
            .channels
            .entry(holder_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Drop a holder's channel; outstanding receivers see it close.
    pub fn remove(&self, holder_id: &str) {
        self.channels.remove(holder_id);
    }
}

impl Notifier for NotifyHub {
    /// No-op if nobody is listening.
    fn notify(&self, notice: Notice) {
        if let Some(sender) = self.channels.get(notice.holder_id()) {
            let _ = sender.send(notice);
        }
    }
}
