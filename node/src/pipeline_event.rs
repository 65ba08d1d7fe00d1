//! Events emitted by the pipeline for subscribers.

use strata_state::GenerationId;
use strata_types::{FailureKind, Timestamp};

/// Pipeline-level events that observers can subscribe to via the [`EventBus`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PipelineEvent {
    /// A signed state was handed to the persistence collaborator.
    SignedStateCreated {
        round: u64,
        generation: GenerationId,
        freeze: bool,
    },
    /// A round reached the freeze time. The owner should stop feeding rounds
    /// once the matching signed state has been persisted.
    FreezeReached { round: u64, freeze_time: Timestamp },
    /// The single-state strategy promoted a new current generation.
    Shuffled { generation: GenerationId },
    /// Something was recorded in the failure log.
    FailureRecorded {
        component: &'static str,
        kind: FailureKind,
    },
}

type Listener = Box<dyn Fn(&PipelineEvent) + Send + Sync>;

/// Synchronous fan-out event bus for pipeline events.
///
/// Listeners are invoked inline on the emitting worker; keep them fast to
/// avoid stalling round handling.
#[derive(Default)]
pub struct EventBus {
    listeners: Vec<Listener>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, listener: impl Fn(&PipelineEvent) + Send + Sync + 'static) {
        self.listeners.push(Box::new(listener));
    }

    pub fn emit(&self, event: &PipelineEvent) {
        for listener in &self.listeners {
            listener(event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn emit_reaches_every_listener_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut bus = EventBus::new();
        for tag in ["first", "second"] {
            let seen = Arc::clone(&seen);
            bus.subscribe(move |event| seen.lock().unwrap().push((tag, event.clone())));
        }

        let event = PipelineEvent::Shuffled {
            generation: GenerationId(4),
        };
        bus.emit(&event);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], ("first", event.clone()));
        assert_eq!(seen[1], ("second", event));
    }

    #[test]
    fn emit_without_listeners_is_a_no_op() {
        let bus = EventBus::default();
        bus.emit(&PipelineEvent::FreezeReached {
            round: 7,
            freeze_time: Timestamp::from_secs(70),
        });
        assert_eq!(bus.listener_count(), 0);
    }
}
