//! Pool of self-submitted transactions waiting for a self-created event.
//!
//! Two FIFO lanes: priority transactions are drained before ordinary ones.
//! Unlike the handler queues, the pool rejects instead of blocking, so a
//! caller submitting from an RPC thread learns immediately that it must back
//! off.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::warn;

use strata_types::Transaction;

/// Result of submitting a transaction to the pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmitResult {
    Accepted,
    /// The payload exceeds the per-transaction limit.
    TooLarge { size: usize, max: usize },
    /// The pool is at capacity.
    Full,
    /// A freeze is in progress; only system transactions are admitted.
    Frozen,
}

#[derive(Default)]
struct Lanes {
    priority: VecDeque<Transaction>,
    ordinary: VecDeque<Transaction>,
}

impl Lanes {
    fn len(&self) -> usize {
        self.priority.len() + self.ordinary.len()
    }

    fn front(&self) -> Option<&Transaction> {
        self.priority.front().or_else(|| self.ordinary.front())
    }

    fn pop(&mut self) -> Option<Transaction> {
        self.priority
            .pop_front()
            .or_else(|| self.ordinary.pop_front())
    }
}

/// Bounded, thread-safe pool of self transactions.
pub struct TransactionPool {
    lanes: Mutex<Lanes>,
    capacity: usize,
    transaction_max_bytes: usize,
    max_bytes_per_event: usize,
    frozen: AtomicBool,
}

impl TransactionPool {
    /// A `transaction_max_bytes` above `max_bytes_per_event` is lowered to it,
    /// since such a transaction could never fit in an event.
    pub fn new(capacity: usize, transaction_max_bytes: usize, max_bytes_per_event: usize) -> Self {
        let transaction_max_bytes = if transaction_max_bytes > max_bytes_per_event {
            warn!(
                transaction_max_bytes,
                max_bytes_per_event,
                "transaction_max_bytes exceeds the per-event budget, lowering it"
            );
            max_bytes_per_event
        } else {
            transaction_max_bytes
        };
        Self {
            lanes: Mutex::new(Lanes::default()),
            capacity,
            transaction_max_bytes,
            max_bytes_per_event,
            frozen: AtomicBool::new(false),
        }
    }

    pub fn transaction_max_bytes(&self) -> usize {
        self.transaction_max_bytes
    }

    /// Offer a transaction. Priority transactions jump ahead of ordinary
    /// ones but stay FIFO among themselves.
    pub fn submit(&self, transaction: Transaction, priority: bool) -> SubmitResult {
        if self.is_frozen() && !transaction.is_system() {
            return SubmitResult::Frozen;
        }
        let size = transaction.size();
        if size > self.transaction_max_bytes {
            return SubmitResult::TooLarge {
                size,
                max: self.transaction_max_bytes,
            };
        }
        let mut lanes = self.lanes.lock();
        if lanes.len() >= self.capacity {
            return SubmitResult::Full;
        }
        if priority {
            lanes.priority.push_back(transaction);
        } else {
            lanes.ordinary.push_back(transaction);
        }
        SubmitResult::Accepted
    }

    /// Take the transactions for the next self-created event, in lane order,
    /// stopping before the total payload would exceed the per-event budget.
    pub fn drain_for_event(&self) -> Vec<Transaction> {
        let mut lanes = self.lanes.lock();
        let mut batch = Vec::new();
        let mut bytes = 0usize;
        while let Some(next) = lanes.front() {
            if bytes + next.size() > self.max_bytes_per_event {
                break;
            }
            bytes += next.size();
            if let Some(tx) = lanes.pop() {
                batch.push(tx);
            }
        }
        batch
    }

    pub fn set_frozen(&self, frozen: bool) {
        self.frozen.store(frozen, Ordering::Release);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.lanes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every waiting transaction.
    pub fn clear(&self) {
        let mut lanes = self.lanes.lock();
        lanes.priority.clear();
        lanes.ordinary.clear();
    }
}
