//! The in-flight probe table: sequence number -> sent-probe bookkeeping.
//!
//! One table per worker. Entries are added when a probe is sent and removed
//! either by the receive loop (on a matching reply) or by the timeout sweeper
//! (after the target's timeout elapses). Removal is atomic: at most one of the
//! two callers ever observes a given entry.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::RwLock;

use crate::target::TargetId;

/// Bookkeeping kept for a probe between send and reply-or-timeout.
///
/// `measurement_length_ms` is copied from the target at send time so the
/// sweeper's "3 x measurement length" bound survives a reconfiguration that
/// changes or removes the target before the probe is accounted for.
#[derive(Debug, Clone)]
pub struct TransitRecord {
    pub target: TargetId,
    pub send_ts_ns: i64,
    pub sent_at: Instant,
    pub measurement_length_ms: u64,
}

/// Sequence-number-keyed table of probes currently awaiting a reply.
#[derive(Default)]
pub struct TransitTable {
    inner: RwLock<HashMap<u64, TransitRecord>>,
}

impl TransitTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, sequence: u64, record: TransitRecord) {
        self.inner.write().insert(sequence, record);
    }

    /// Removes and returns the record for `sequence`, or `None` if it is not
    /// present — this is the normal "reply for an already-timed-out or unknown
    /// probe" case, not an error.
    pub fn remove(&self, sequence: u64) -> Option<TransitRecord> {
        self.inner.write().remove(&sequence)
    }

    /// Removes and returns every record whose `sent_at` is older than `cutoff`,
    /// used by the timeout sweeper to find probes that will never get a reply.
    pub fn remove_older_than(&self, cutoff: Instant) -> Vec<(u64, TransitRecord)> {
        let mut guard = self.inner.write();
        let expired: Vec<u64> = guard
            .iter()
            .filter(|(_, record)| record.sent_at < cutoff)
            .map(|(seq, _)| *seq)
            .collect();

        expired
            .into_iter()
            .filter_map(|seq| guard.remove(&seq).map(|record| (seq, record)))
            .collect()
    }

    /// Removes and returns every record whose own `measurement_length_ms`
    /// bound (three measurement intervals) has elapsed as of `now`. Each
    /// record carries its own interval so a target that was reconfigured or
    /// removed after the probe was sent still expires correctly.
    pub fn sweep_expired(&self, now: Instant) -> Vec<(u64, TransitRecord)> {
        let mut guard = self.inner.write();
        let expired: Vec<u64> = guard
            .iter()
            .filter(|(_, record)| {
                let bound = std::time::Duration::from_millis(record.measurement_length_ms * 3);
                now.saturating_duration_since(record.sent_at) >= bound
            })
            .map(|(seq, _)| *seq)
            .collect();

        expired
            .into_iter()
            .filter_map(|seq| guard.remove(&seq).map(|record| (seq, record)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::Tos;
    use std::time::Duration;

    fn target_id() -> TargetId {
        TargetId {
            path: "core1-core2".to_string(),
            tos: Tos {
                name: "be".to_string(),
                value: 0,
            },
        }
    }

    #[test]
    fn insert_then_remove_returns_the_record() {
        let table = TransitTable::new();
        table.insert(
            1,
            TransitRecord {
                target: target_id(),
                send_ts_ns: 42,
                sent_at: Instant::now(),
                measurement_length_ms: 1000,
            },
        );

        let record = table.remove(1).expect("record should be present");
        assert_eq!(record.send_ts_ns, 42);
        assert!(table.remove(1).is_none());
    }

    #[test]
    fn remove_of_unknown_sequence_is_none_not_error() {
        let table = TransitTable::new();
        assert!(table.remove(999).is_none());
    }

    #[test]
    fn remove_older_than_only_sweeps_expired_entries() {
        let table = TransitTable::new();
        let now = Instant::now();

        table.insert(
            1,
            TransitRecord {
                target: target_id(),
                send_ts_ns: 1,
                sent_at: now - Duration::from_secs(10),
                measurement_length_ms: 1000,
            },
        );
        table.insert(
            2,
            TransitRecord {
                target: target_id(),
                send_ts_ns: 2,
                sent_at: now,
                measurement_length_ms: 1000,
            },
        );

        let expired = table.remove_older_than(now - Duration::from_secs(1));

        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, 1);
        assert_eq!(table.len(), 1);
        assert!(table.remove(2).is_some());
    }

    #[test]
    fn sweep_expired_uses_each_records_own_three_interval_bound() {
        let table = TransitTable::new();
        let now = Instant::now();

        // 1000ms measurement length => expires past 3000ms.
        table.insert(
            1,
            TransitRecord {
                target: target_id(),
                send_ts_ns: 1,
                sent_at: now - Duration::from_millis(3100),
                measurement_length_ms: 1000,
            },
        );
        // 2000ms measurement length => 3100ms old is still within the 6000ms bound.
        table.insert(
            2,
            TransitRecord {
                target: target_id(),
                send_ts_ns: 2,
                sent_at: now - Duration::from_millis(3100),
                measurement_length_ms: 2000,
            },
        );

        let expired = table.sweep_expired(now);

        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, 1);
        assert_eq!(table.len(), 1);
        assert!(table.remove(2).is_some());
    }
}
