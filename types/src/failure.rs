//! Accumulating failure records.
//!
//! Invariant violations detected mid-pipeline are recorded here instead of
//! being raised, so in-flight queue and round state is never left half
//! updated. One log belongs to one pipeline instance; the owner (or a test
//! harness) polls it and fails the run if it is not empty.

use parking_lot::Mutex;
use std::fmt;

/// Category of a recorded failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// The same transaction instance reached the same stage twice.
    DuplicateDelivery,
    /// A consensus event lacked its order or timestamp.
    MissingConsensusData,
    /// A round arrived out of sequence.
    OutOfOrderRound,
    /// A write was attempted against an immutable state generation.
    IllegalMutation,
    /// An application or system handler returned an error or panicked.
    Application,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::DuplicateDelivery => "duplicate_delivery",
            Self::MissingConsensusData => "missing_consensus_data",
            Self::OutOfOrderRound => "out_of_order_round",
            Self::IllegalMutation => "illegal_mutation",
            Self::Application => "application",
        };
        f.write_str(name)
    }
}

/// One recorded failure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Failure {
    pub component: &'static str,
    pub kind: FailureKind,
    pub message: String,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.component, self.kind, self.message)
    }
}

type FailureListener = Box<dyn Fn(&Failure) + Send + Sync>;

/// Thread-safe, append-only (until drained) list of failures.
#[derive(Default)]
pub struct FailureLog {
    entries: Mutex<Vec<Failure>>,
    listener: Option<FailureListener>,
}

impl FailureLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// A log that also calls `listener` for every failure as it is recorded.
    /// The listener must not record into the same log.
    pub fn with_listener(listener: impl Fn(&Failure) + Send + Sync + 'static) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            listener: Some(Box::new(listener)),
        }
    }

    pub fn record(&self, component: &'static str, kind: FailureKind, message: impl Into<String>) {
        let failure = Failure {
            component,
            kind,
            message: message.into(),
        };
        if let Some(listener) = &self.listener {
            listener(&failure);
        }
        self.entries.lock().push(failure);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Number of recorded failures of one kind.
    pub fn count(&self, kind: FailureKind) -> usize {
        self.entries.lock().iter().filter(|f| f.kind == kind).count()
    }

    /// Copy of every failure recorded so far.
    pub fn snapshot(&self) -> Vec<Failure> {
        self.entries.lock().clone()
    }

    /// Remove and return every failure recorded so far.
    pub fn drain(&self) -> Vec<Failure> {
        std::mem::take(&mut *self.entries.lock())
    }
}

impl fmt::Debug for FailureLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailureLog")
            .field("entries", &*self.entries.lock())
            .field("listener", &self.listener.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_accumulate_until_drained() {
        let log = FailureLog::new();
        assert!(log.is_empty());

        log.record("pre-consensus", FailureKind::DuplicateDelivery, "tx 1");
        log.record("consensus", FailureKind::MissingConsensusData, "event 2");
        log.record("consensus", FailureKind::DuplicateDelivery, "tx 3");

        assert_eq!(log.len(), 3);
        assert_eq!(log.count(FailureKind::DuplicateDelivery), 2);
        assert_eq!(log.snapshot().len(), 3);

        let drained = log.drain();
        assert_eq!(drained.len(), 3);
        assert!(log.is_empty());
    }

    #[test]
    fn listener_sees_every_failure() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let log = FailureLog::with_listener(move |failure| {
            assert_eq!(failure.kind, FailureKind::OutOfOrderRound);
            counter.fetch_add(1, Ordering::SeqCst);
        });
        log.record("consensus", FailureKind::OutOfOrderRound, "round 4 after 2");
        log.record("consensus", FailureKind::OutOfOrderRound, "round 4 after 2");
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn display_names_component_and_kind() {
        let failure = Failure {
            component: "router",
            kind: FailureKind::Application,
            message: "handler panicked".into(),
        };
        assert_eq!(failure.to_string(), "[router] application: handler panicked");
    }
}
