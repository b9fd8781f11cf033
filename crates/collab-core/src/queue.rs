//! The global dispatch queue.
//!
//! Many producers (one per connection) append packets; the single dispatch
//! loop removes them in arrival order. A semaphore counts available packets
//! and a separate mutex guards the sequence itself: a consumer holding a
//! permit always finds the sequence non-empty. Closing the semaphore wakes a
//! parked consumer at shutdown.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{trace, warn};

use crate::packet::Packet;

/// Queue errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    /// The queue was closed for shutdown.
    #[error("Dispatch queue is closed")]
    Closed,
}

struct QueueState {
    packets: VecDeque<Packet>,
    next_update_id: u64,
}

/// Unbounded multi-producer, single-consumer FIFO of packets.
pub struct DispatchQueue {
    state: Mutex<QueueState>,
    available: Semaphore,
    warn_depth: usize,
}

impl DispatchQueue {
    /// Create a queue that numbers updates from `initial_update_id` and logs
    /// a warning whenever its depth reaches `warn_depth`.
    #[must_use]
    pub fn new(initial_update_id: u64, warn_depth: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                packets: VecDeque::new(),
                next_update_id: initial_update_id,
            }),
            available: Semaphore::new(0),
            warn_depth,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a packet that already carries its update id.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Closed`] after [`close`](Self::close).
    pub fn enqueue(&self, packet: Packet) -> Result<(), QueueError> {
        self.push(|_| (packet.update_id, packet)).map(|_| ())
    }

    /// Assign the next update id and append the packet built from it.
    ///
    /// Ids are handed out under the same lock that orders the queue, so they
    /// increase strictly in dispatch order.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Closed`] after [`close`](Self::close).
    pub fn enqueue_with(&self, build: impl FnOnce(u64) -> Packet) -> Result<u64, QueueError> {
        self.push(|state| {
            let update_id = state.next_update_id;
            state.next_update_id += 1;
            (update_id, build(update_id))
        })
    }

    fn push(
        &self,
        make: impl FnOnce(&mut QueueState) -> (u64, Packet),
    ) -> Result<u64, QueueError> {
        if self.available.is_closed() {
            return Err(QueueError::Closed);
        }

        let (update_id, depth) = {
            let mut state = self.lock();
            let (update_id, packet) = make(&mut *state);
            state.packets.push_back(packet);
            (update_id, state.packets.len())
        };
        self.available.add_permits(1);

        trace!(update_id = update_id, depth = depth, "Packet enqueued");
        if depth == self.warn_depth {
            warn!(depth = depth, "Dispatch queue is backing up");
        }
        Ok(update_id)
    }

    /// Wait for the oldest packet.
    ///
    /// Returns `None` once the queue has been closed. Only one task may
    /// consume from the queue.
    pub async fn dequeue(&self) -> Option<Packet> {
        let permit = self.available.acquire().await.ok()?;
        permit.forget();
        self.lock().packets.pop_front()
    }

    /// Take the oldest packet without waiting.
    pub fn try_dequeue(&self) -> Option<Packet> {
        let permit = self.available.try_acquire().ok()?;
        permit.forget();
        self.lock().packets.pop_front()
    }

    /// Close the queue, waking any parked consumer.
    pub fn close(&self) {
        self.available.close();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.available.is_closed()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().packets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The id the next numbered packet will receive.
    #[must_use]
    pub fn peek_update_id(&self) -> u64 {
        self.lock().next_update_id
    }
}
