//! Time-bucketed round-trip statistics, keyed by `(bucket start, target)`.
//!
//! Every sent probe, reply, and timeout is recorded against the bucket its send
//! time falls into. Buckets are aligned to `measurement_length_ms` so that two
//! probes sent within the same window land in the same bucket regardless of
//! which worker sent them.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::target::TargetId;

/// Aligns `ts_ns` down to the start of its `bucket_len_ms`-wide window.
pub fn align(ts_ns: i64, bucket_len_ms: u64) -> i64 {
    let bucket_len_ns = bucket_len_ms as i64 * 1_000_000;
    if bucket_len_ns <= 0 {
        return ts_ns;
    }
    ts_ns - ts_ns.rem_euclid(bucket_len_ns)
}

/// The most recent bucket every probe it could possibly contain has had its
/// full timeout to arrive for, per §4.7: `align(now - timeout_ms - measurement_length_ms)`.
///
/// Shared by the bucket cleaner (which evicts anything older) and the metrics
/// snapshot (which reads exactly this bucket, never the one still filling in).
pub fn last_finished_bucket(now_ns: i64, timeout_ms: u64, measurement_length_ms: u64) -> i64 {
    align(
        now_ns - timeout_ms as i64 * 1_000_000 - measurement_length_ms as i64 * 1_000_000,
        measurement_length_ms,
    )
}

/// Accumulated counters for one target within one time bucket.
///
/// `rtt_min_ns`/`rtt_max_ns` are `0` until the first reply lands in this
/// bucket; `0` is never a valid RTT so it doubles as "no samples yet". `rtts`
/// retains every individual sample, per the bucket's data model.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stats {
    pub sent: u64,
    pub received: u64,
    pub timed_out: u64,
    pub late: u64,
    pub rtt_min_ns: i64,
    pub rtt_max_ns: i64,
    pub rtt_sum_ns: i64,
    pub rtts: Vec<i64>,
}

impl Stats {
    pub fn record_sent(&mut self) {
        self.sent += 1;
    }

    pub fn record_recv(&mut self, rtt_ns: i64) {
        self.received += 1;
        self.rtt_sum_ns += rtt_ns;
        self.rtts.push(rtt_ns);

        if self.rtt_min_ns == 0 || rtt_ns < self.rtt_min_ns {
            self.rtt_min_ns = rtt_ns;
        }
        if rtt_ns > self.rtt_max_ns {
            self.rtt_max_ns = rtt_ns;
        }
    }

    pub fn record_timeout(&mut self) {
        self.timed_out += 1;
    }

    pub fn record_late(&mut self) {
        self.late += 1;
    }

    pub fn rtt_avg_ns(&self) -> Option<i64> {
        if self.received == 0 {
            None
        } else {
            Some(self.rtt_sum_ns / self.received as i64)
        }
    }

    pub fn loss(&self) -> u64 {
        self.sent.saturating_sub(self.received)
    }
}

/// `bucket_ts -> target -> stats`, shared by every worker in a target's pool.
#[derive(Default)]
pub struct MeasurementStore {
    inner: RwLock<HashMap<i64, HashMap<TargetId, Stats>>>,
}

impl MeasurementStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self, target: &TargetId, bucket_len_ms: u64, send_ts_ns: i64) {
        let bucket = align(send_ts_ns, bucket_len_ms);
        let mut guard = self.inner.write();
        guard
            .entry(bucket)
            .or_default()
            .entry(target.clone())
            .or_default()
            .record_sent();
    }

    /// No-op if the bucket has already been evicted by [`MeasurementStore::remove_older_than`] —
    /// a late reply for a long-gone window is silently dropped, not an error.
    pub fn record_recv(&self, target: &TargetId, bucket_len_ms: u64, send_ts_ns: i64, rtt_ns: i64) {
        let bucket = align(send_ts_ns, bucket_len_ms);
        let mut guard = self.inner.write();
        if let Some(targets) = guard.get_mut(&bucket) {
            targets.entry(target.clone()).or_default().record_recv(rtt_ns);
        }
    }

    pub fn record_timeout(&self, target: &TargetId, bucket_len_ms: u64, send_ts_ns: i64) {
        let bucket = align(send_ts_ns, bucket_len_ms);
        let mut guard = self.inner.write();
        if let Some(targets) = guard.get_mut(&bucket) {
            targets.entry(target.clone()).or_default().record_timeout();
        }
    }

    pub fn record_late(&self, target: &TargetId, bucket_len_ms: u64, send_ts_ns: i64) {
        let bucket = align(send_ts_ns, bucket_len_ms);
        let mut guard = self.inner.write();
        if let Some(targets) = guard.get_mut(&bucket) {
            targets.entry(target.clone()).or_default().record_late();
        }
    }

    pub fn get(&self, bucket_ts: i64, target: &TargetId) -> Option<Stats> {
        self.inner
            .read()
            .get(&bucket_ts)
            .and_then(|targets| targets.get(target))
            .cloned()
    }

    /// A snapshot of every bucket currently held, for metrics export.
    pub fn snapshot(&self) -> HashMap<i64, HashMap<TargetId, Stats>> {
        self.inner.read().clone()
    }

    /// Evicts every bucket whose start is older than `cutoff_ts_ns`, returning
    /// how many were dropped.
    pub fn remove_older_than(&self, cutoff_ts_ns: i64) -> usize {
        let mut guard = self.inner.write();
        let before = guard.len();
        guard.retain(|bucket_ts, _| *bucket_ts >= cutoff_ts_ns);
        before - guard.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::Tos;

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
    fn align_rounds_down_to_bucket_boundary() {
        assert_eq!(align(0, 1000), 0);
        assert_eq!(align(999_999_999, 1000), 0);
        assert_eq!(align(1_000_000_000, 1000), 1_000_000_000);
        assert_eq!(align(1_500_000_000, 1000), 1_000_000_000);
    }

    #[test]
    fn last_finished_bucket_subtracts_timeout_and_measurement_length() {
        // now = 10_000ms, timeout = 500ms, measurement_length = 1000ms
        // => cutoff = 8_500ms, aligned down to the 1000ms boundary => 8_000ms.
        let now_ns = 10_000_000_000;
        assert_eq!(last_finished_bucket(now_ns, 500, 1000), 8_000_000_000);
    }

    #[test]
    fn last_finished_bucket_never_names_the_still_accumulating_bucket() {
        // A probe sent at the very start of the current bucket can still be
        // in flight; the finished bucket must be strictly older than "now".
        let now_ns = 5_000_000_000;
        let finished = last_finished_bucket(now_ns, 500, 1000);
        assert!(finished < align(now_ns, 1000));
    }

    #[test]
    fn sent_and_received_accumulate_in_the_same_bucket() {
        let store = MeasurementStore::new();
        let id = target_id();

        store.record_sent(&id, 1000, 500_000_000);
        store.record_sent(&id, 1000, 600_000_000);
        store.record_recv(&id, 1000, 500_000_000, 20_000_000);

        let stats = store.get(0, &id).unwrap();
        assert_eq!(stats.sent, 2);
        assert_eq!(stats.received, 1);
        assert_eq!(stats.loss(), 1);
        assert_eq!(stats.rtt_avg_ns(), Some(20_000_000));
    }

    #[test]
    fn recv_for_evicted_bucket_is_silently_dropped() {
        let store = MeasurementStore::new();
        let id = target_id();

        store.record_recv(&id, 1000, 500_000_000, 1);

        assert!(store.get(0, &id).is_none());
    }

    #[test]
    fn rtt_min_tracks_smallest_observed_sample() {
        let store = MeasurementStore::new();
        let id = target_id();

        store.record_recv(&id, 1000, 0, 50_000_000);
        store.record_recv(&id, 1000, 0, 10_000_000);
        store.record_recv(&id, 1000, 0, 30_000_000);

        let stats = store.get(0, &id).unwrap();
        assert_eq!(stats.rtt_min_ns, 10_000_000);
        assert_eq!(stats.rtt_max_ns, 50_000_000);
    }

    #[test]
    fn remove_older_than_evicts_expired_buckets_only() {
        let store = MeasurementStore::new();
        let id = target_id();

        store.record_sent(&id, 1000, 0);
        store.record_sent(&id, 1000, 5_000_000_000);

        let dropped = store.remove_older_than(1_000_000_000);

        assert_eq!(dropped, 1);
        assert!(store.get(0, &id).is_none());
        assert!(store.get(5_000_000_000, &id).is_some());
    }
}
