//! A point-in-time snapshot of per-target measurement counters.
//!
//! There is no HTTP exposition surface here: a caller (the binary's own
//! periodic log line, or an embedder) pulls a [`Snapshot`] and does whatever it
//! wants with it. See the design notes for why the scrape endpoint is out of scope.

use std::collections::HashMap;

use crate::manager::Manager;
use crate::measurement::{last_finished_bucket, Stats};
use crate::target::TargetId;

/// One target's accumulated counters as of the moment the snapshot was taken.
#[derive(Debug, Clone)]
pub struct TargetMetrics {
    pub target: TargetId,
    pub bucket_ts: i64,
    pub stats: Stats,
}

/// One target's most recently *finished* bucket, per §4.7's
/// `last_finished_bucket = align(now - timeout_ms - measurement_length_ms)`.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub targets: Vec<TargetMetrics>,
}

impl Snapshot {
    /// Collects, for every currently running target, the stats of its last
    /// finished bucket as of `now_ns` — never the bucket still accumulating.
    ///
    /// A target with no stats recorded yet for that bucket (e.g. a path that
    /// was only just added) is simply absent from the result.
    pub fn collect(manager: &Manager, now_ns: i64) -> Self {
        let store = manager.store();
        let mut targets = Vec::new();

        for target in manager.targets() {
            let finished_bucket =
                last_finished_bucket(now_ns, target.timeout_ms, target.measurement_length_ms);

            if let Some(stats) = store.get(finished_bucket, &target.id()) {
                targets.push(TargetMetrics {
                    target: target.id(),
                    bucket_ts: finished_bucket,
                    stats,
                });
            }
        }

        Self { targets }
    }

    /// Convenience grouping by target id; [`Snapshot::collect`] already
    /// contains at most one bucket per target, so this is a plain lookup.
    pub fn latest_per_target(&self) -> HashMap<TargetId, &TargetMetrics> {
        let mut latest: HashMap<TargetId, &TargetMetrics> = HashMap::new();

        for entry in &self.targets {
            latest
                .entry(entry.target.clone())
                .and_modify(|current| {
                    if entry.bucket_ts > current.bucket_ts {
                        *current = entry;
                    }
                })
                .or_insert(entry);
        }

        latest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::Tos;

    fn target_id(path: &str) -> TargetId {
        TargetId {
            path: path.to_string(),
            tos: Tos {
                name: "be".to_string(),
                value: 0,
            },
        }
    }

    #[test]
    fn latest_per_target_keeps_the_newest_bucket() {
        let snapshot = Snapshot {
            targets: vec![
                TargetMetrics {
                    target: target_id("a"),
                    bucket_ts: 1000,
                    stats: Stats::default(),
                },
                TargetMetrics {
                    target: target_id("a"),
                    bucket_ts: 2000,
                    stats: Stats {
                        sent: 5,
                        ..Stats::default()
                    },
                },
            ],
        };

        let latest = snapshot.latest_per_target();
        assert_eq!(latest[&target_id("a")].bucket_ts, 2000);
        assert_eq!(latest[&target_id("a")].stats.sent, 5);
    }
}
