use crate::models::status::{ErrorReport, MinerStatus, StatusMessage};
use chrono::Utc;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use uuid::Uuid;

/// Identifies one subscription; pass it back to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(Uuid);

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Receiving end of a status subscription.
///
/// The first message is always the current snapshot. If the buffer fills up
/// the broadcaster drops the subscription and `recv` returns `None`.
pub struct StatusSubscription {
    handle: SubscriptionHandle,
    receiver: mpsc::Receiver<StatusMessage>,
}

impl StatusSubscription {
    pub fn handle(&self) -> SubscriptionHandle {
        self.handle
    }

    pub async fn recv(&mut self) -> Option<StatusMessage> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Result<StatusMessage, TryRecvError> {
        self.receiver.try_recv()
    }
}

struct BroadcastState {
    current: Arc<MinerStatus>,
    subscribers: HashMap<Uuid, mpsc::Sender<StatusMessage>>,
}

/// Fans status snapshots out to any number of observers.
///
/// Publishing never waits on a subscriber: each one has its own bounded
/// queue, and a subscriber whose queue is full is removed.
#[derive(Clone)]
pub struct StatusBroadcaster {
    state: Arc<Mutex<BroadcastState>>,
    buffer: usize,
}

impl StatusBroadcaster {
    pub fn new(buffer: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(BroadcastState {
                current: Arc::new(MinerStatus::default()),
                subscribers: HashMap::new(),
            })),
            buffer: buffer.max(1),
        }
    }

    pub fn subscribe(&self) -> StatusSubscription {
        let (tx, receiver) = mpsc::channel(self.buffer);
        let id = Uuid::new_v4();

        let mut state = self.lock();
        // Queued under the lock so no later snapshot can overtake it.
        if tx.try_send(StatusMessage::Status(state.current.clone())).is_ok() {
            state.subscribers.insert(id, tx);
        }
        log::debug!(
            "Status subscriber {} added ({} total)",
            id,
            state.subscribers.len()
        );

        StatusSubscription {
            handle: SubscriptionHandle(id),
            receiver,
        }
    }

    /// Returns false if the handle was unknown or already dropped.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let removed = self.lock().subscribers.remove(&handle.0).is_some();
        if removed {
            log::debug!("Status subscriber {} removed", handle);
        }
        removed
    }

    /// Replace the current snapshot and deliver it to every subscriber.
    pub fn publish_status(&self, status: MinerStatus) -> Arc<MinerStatus> {
        let snapshot = Arc::new(status);
        let mut state = self.lock();
        state.current = snapshot.clone();
        Self::deliver(&mut state, StatusMessage::Status(snapshot.clone()));
        snapshot
    }

    pub fn publish_error(&self, message: impl Into<String>) {
        let report = ErrorReport {
            message: message.into(),
            timestamp: Utc::now(),
        };
        Self::deliver(&mut self.lock(), StatusMessage::Error(report));
    }

    pub fn current(&self) -> Arc<MinerStatus> {
        self.lock().current.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    fn deliver(state: &mut BroadcastState, message: StatusMessage) {
        state.subscribers.retain(|id, tx| match tx.try_send(message.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                log::warn!("⚠️ Status subscriber {} fell behind, dropping it", id);
                false
            }
            Err(TrySendError::Closed(_)) => {
                log::debug!("Status subscriber {} went away", id);
                false
            }
        });
    }

    fn lock(&self) -> MutexGuard<'_, BroadcastState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
