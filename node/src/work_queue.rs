//! Bounded hand-off queue between a submitter and one worker task.
//!
//! `push` waits for space (backpressure). The depth counts items from the
//! moment they are queued until the worker reports them done, so a depth of
//! zero means the worker is idle. `clear` discards everything queued so far
//! and drops it from the depth at once: the worker still receives those items
//! but [`WorkQueue::accept`] turns them away.

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::NodeError;

/// An item together with the clear-epoch it was queued in.
pub struct Queued<T> {
    epoch: u64,
    pub item: T,
}

#[derive(Default)]
struct Counts {
    epoch: u64,
    /// Sent in the current epoch, not yet accepted by the worker.
    waiting: usize,
    /// `waiting` plus items accepted but not yet done.
    depth: usize,
}

pub struct WorkQueue<T> {
    sender: mpsc::Sender<Queued<T>>,
    counts: Mutex<Counts>,
}

impl<T> WorkQueue<T> {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Queued<T>>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (
            Self {
                sender,
                counts: Mutex::new(Counts::default()),
            },
            receiver,
        )
    }

    /// Queue an item, waiting while the queue is full.
    pub async fn push(&self, item: T) -> Result<(), NodeError> {
        let permit = self.sender.reserve().await.map_err(|_| NodeError::Stopped)?;
        let mut counts = self.counts.lock();
        counts.waiting += 1;
        counts.depth += 1;
        permit.send(Queued {
            epoch: counts.epoch,
            item,
        });
        Ok(())
    }

    /// Items queued or being worked on.
    pub fn depth(&self) -> usize {
        self.counts.lock().depth
    }

    pub fn capacity(&self) -> usize {
        self.sender.max_capacity()
    }

    /// Discard everything queued so far. Items already accepted by the
    /// worker still count until they are done.
    pub fn clear(&self) {
        let mut counts = self.counts.lock();
        counts.epoch += 1;
        counts.depth -= counts.waiting;
        counts.waiting = 0;
    }

    /// Take a received item for handling, or `None` if it was cleared. Every
    /// accepted item must be followed by [`WorkQueue::done`].
    pub fn accept(&self, queued: Queued<T>) -> Option<T> {
        let mut counts = self.counts.lock();
        if queued.epoch != counts.epoch {
            return None;
        }
        counts.waiting -= 1;
        Some(queued.item)
    }

    /// Report one accepted item as handled.
    pub fn done(&self) {
        let mut counts = self.counts.lock();
        counts.depth = counts.depth.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn depth_counts_until_done() {
        let (queue, mut rx) = WorkQueue::new(4);
        queue.push(1u32).await.unwrap();
        queue.push(2).await.unwrap();
        assert_eq!(queue.depth(), 2);

        let first = queue.accept(rx.recv().await.unwrap());
        assert_eq!(first, Some(1));
        assert_eq!(queue.depth(), 2);
        queue.done();
        assert_eq!(queue.depth(), 1);
    }

    #[tokio::test]
    async fn full_queue_blocks_the_submitter() {
        let (queue, mut rx) = WorkQueue::new(1);
        queue.push(1u32).await.unwrap();
        let blocked = tokio::time::timeout(Duration::from_millis(50), queue.push(2)).await;
        assert!(blocked.is_err());

        queue.accept(rx.recv().await.unwrap());
        queue.done();
        queue.push(3).await.unwrap();
        assert_eq!(queue.accept(rx.recv().await.unwrap()), Some(3));
    }

    #[tokio::test]
    async fn cleared_items_are_turned_away() {
        let (queue, mut rx) = WorkQueue::new(4);
        queue.push("old").await.unwrap();
        queue.clear();
        queue.push("new").await.unwrap();

        assert_eq!(queue.accept(rx.recv().await.unwrap()), None);
        assert_eq!(queue.accept(rx.recv().await.unwrap()), Some("new"));
    }

    #[tokio::test]
    async fn clear_drops_waiting_items_from_depth_at_once() {
        let (queue, mut rx) = WorkQueue::new(4);
        queue.push(1u32).await.unwrap();
        queue.push(2).await.unwrap();
        queue.push(3).await.unwrap();
        let in_flight = queue.accept(rx.recv().await.unwrap());
        assert_eq!(in_flight, Some(1));

        queue.clear();
        assert_eq!(queue.depth(), 1);
        queue.done();
        assert_eq!(queue.depth(), 0);

        // the worker later drains the cleared items without touching depth
        assert_eq!(queue.accept(rx.recv().await.unwrap()), None);
        assert_eq!(queue.accept(rx.recv().await.unwrap()), None);
        assert_eq!(queue.depth(), 0);

        queue.push(4).await.unwrap();
        assert_eq!(queue.depth(), 1);
    }

    #[tokio::test]
    async fn push_after_receiver_dropped_fails() {
        let (queue, rx) = WorkQueue::new(1);
        drop(rx);
        assert!(matches!(queue.push(1u8).await, Err(NodeError::Stopped)));
        assert_eq!(queue.depth(), 0);
    }
}
