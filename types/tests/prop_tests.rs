use proptest::prelude::*;
use std::sync::Arc;

use strata_types::{
    ConsensusData, DeliveryStage, Event, EventId, NodeId, Timestamp, Transaction,
};

fn event_with(n: usize, created: u64) -> Event {
    Event::new(
        EventId::new(NodeId(2), 1),
        Timestamp::from_nanos(created),
        (0..n).map(|i| Transaction::application(vec![i as u8])).collect(),
    )
}

proptest! {
    /// Timestamp ordering: from_nanos(a) <= from_nanos(b) iff a <= b.
    #[test]
    fn timestamp_ordering(a in 0u64..u64::MAX, b in 0u64..u64::MAX) {
        let ta = Timestamp::from_nanos(a);
        let tb = Timestamp::from_nanos(b);
        prop_assert_eq!(ta <= tb, a <= b);
        prop_assert_eq!(ta == tb, a == b);
    }

    /// Timestamp elapsed_since: elapsed_since(now) = now - self.
    #[test]
    fn timestamp_elapsed_since(base in 0u64..1_000_000, offset in 0u64..1_000_000) {
        let t = Timestamp::from_nanos(base);
        let now = Timestamp::from_nanos(base + offset);
        prop_assert_eq!(t.elapsed_since(now), offset);
    }

    /// Consensus times inside one event are strictly increasing.
    #[test]
    fn consensus_times_strictly_increase(n in 1usize..64, base in 0u64..1_000_000_000) {
        let ev = event_with(n, 0);
        ev.assign_consensus(ConsensusData {
            round_received: 1,
            consensus_order: 0,
            consensus_timestamp: Timestamp::from_nanos(base),
        }).unwrap();
        let times: Vec<Timestamp> = (0..n).map(|i| ev.consensus_time(i).unwrap()).collect();
        prop_assert!(times.windows(2).all(|w| w[0] < w[1]));
        prop_assert_eq!(ev.last_transaction_time(), times.last().copied());
    }

    /// Estimated times fall back to the creation time until consensus is known.
    #[test]
    fn estimated_time_uses_creation_time(n in 1usize..32, created in 0u64..1_000_000) {
        let ev = event_with(n, created);
        for i in 0..n {
            prop_assert_eq!(ev.estimated_time(i), Timestamp::from_nanos(created + i as u64));
        }
    }
}

#[test]
fn concurrent_deliveries_accept_exactly_one() {
    let tx = Arc::new(Transaction::application(vec![7]));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let tx = Arc::clone(&tx);
            std::thread::spawn(move || tx.mark_delivered(DeliveryStage::Consensus))
        })
        .collect();
    let accepted = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|first| *first)
        .count();
    assert_eq!(accepted, 1);
}
