//! Groups targets into worker pools by probe rate and reconciles them against
//! a freshly compiled configuration.
//!
//! One pool exists per distinct `pps` value present in the configuration; each
//! pool holds `num_cpus::get()` workers, and targets sharing a pps value are
//! distributed round-robin across that pool's workers. Reconfiguration is
//! idempotent: an unchanged target set leaves its workers and sockets alone.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::config::CompiledTarget;
use crate::error::SocketError;
use crate::measurement::MeasurementStore;
use crate::target::Target;
use crate::worker::ProberWorker;

struct Pool {
    workers: Vec<ProberWorker>,
    targets: Vec<Arc<Target>>,
}

/// Owns every running worker pool and the measurement store they share.
pub struct Manager {
    pools: RwLock<HashMap<u32, Pool>>,
    udp_base_port: u16,
    store: Arc<MeasurementStore>,
}

impl Manager {
    pub fn new(udp_base_port: u16) -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
            udp_base_port,
            store: Arc::new(MeasurementStore::new()),
        }
    }

    pub fn store(&self) -> Arc<MeasurementStore> {
        self.store.clone()
    }

    /// Every target currently assigned to a running pool, across all pps groups.
    pub fn targets(&self) -> Vec<Arc<Target>> {
        self.pools
            .read()
            .values()
            .flat_map(|pool| pool.targets.iter().cloned())
            .collect()
    }

    /// Brings the running pools in line with `compiled`.
    ///
    /// Groups are diffed by pps: new groups spawn fresh pools, vanished groups
    /// are stopped, and unchanged groups are left running untouched.
    pub fn reconcile(&self, compiled: Vec<CompiledTarget>) -> Result<(), SocketError> {
        let mut by_pps: HashMap<u32, Vec<Arc<Target>>> = HashMap::new();
        for entry in compiled {
            by_pps.entry(entry.pps).or_default().push(Arc::new(entry.target));
        }

        let mut pools = self.pools.write();

        let stale_pps: Vec<u32> = pools
            .keys()
            .copied()
            .filter(|pps| !by_pps.contains_key(pps))
            .collect();
        for pps in stale_pps {
            if let Some(pool) = pools.remove(&pps) {
                info!(pps, "stopping worker pool with no remaining targets");
                for worker in pool.workers {
                    worker.stop();
                }
            }
        }

        for (pps, targets) in by_pps {
            match pools.get_mut(&pps) {
                Some(pool) if targets_unchanged(&pool.targets, &targets) => {
                    continue;
                }
                Some(pool) => {
                    // Same pps group, different target set: rebalance onto the
                    // existing worker instances rather than restarting them —
                    // `configure` replaces a worker's target map in place.
                    redistribute(pool, &targets);
                }
                None => {
                    let pool = self.spawn_pool(pps, targets)?;
                    pools.insert(pps, pool);
                }
            }
        }

        Ok(())
    }

    fn spawn_pool(&self, pps: u32, targets: Vec<Arc<Target>>) -> Result<Pool, SocketError> {
        let worker_count = num_cpus::get().max(1);
        info!(pps, worker_count, targets = targets.len(), "starting worker pool");

        let mut buckets: Vec<Vec<Arc<Target>>> = vec![Vec::new(); worker_count];
        for (i, target) in targets.iter().enumerate() {
            buckets[i % worker_count].push(target.clone());
        }

        let mut workers = Vec::with_capacity(worker_count);
        for bucket in buckets {
            workers.push(ProberWorker::start(
                bucket,
                pps,
                self.udp_base_port,
                self.store.clone(),
            )?);
        }

        Ok(Pool { workers, targets })
    }

    pub fn total_in_flight(&self) -> usize {
        self.pools
            .read()
            .values()
            .flat_map(|pool| pool.workers.iter())
            .map(|worker| worker.in_flight())
            .sum()
    }

    pub fn total_targets(&self) -> usize {
        self.pools
            .read()
            .values()
            .flat_map(|pool| pool.workers.iter())
            .map(|worker| worker.target_count())
            .sum()
    }
}

/// Partitions `targets` round-robin across `pool`'s existing workers and hands
/// each worker its new slice via `set_targets`, leaving worker instances (and
/// their open sockets) untouched.
fn redistribute(pool: &mut Pool, targets: &[Arc<Target>]) {
    let worker_count = pool.workers.len().max(1);
    let mut buckets: Vec<Vec<Arc<Target>>> = vec![Vec::new(); worker_count];
    for (i, target) in targets.iter().enumerate() {
        buckets[i % worker_count].push(target.clone());
    }

    for (worker, bucket) in pool.workers.iter().zip(buckets) {
        worker.set_targets(bucket);
    }
    pool.targets = targets.to_vec();
}

/// Whether `new` is a drop-in replacement for `current`: same count, same ids,
/// same compiled configuration for each — order-independent.
fn targets_unchanged(current: &[Arc<Target>], new: &[Arc<Target>]) -> bool {
    if current.len() != new.len() {
        return false;
    }

    current.iter().all(|existing| {
        new.iter()
            .any(|candidate| candidate.id() == existing.id() && candidate.configuration_eq(existing))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::{Hop, Tos};

    fn sample_target(name: &str) -> Arc<Target> {
        Arc::new(Target::new(
            name.to_string(),
            Tos {
                name: "be".to_string(),
                value: 0,
            },
            vec![Hop {
                src_range: vec!["192.0.2.0".parse().unwrap()],
                dst_range: vec!["169.254.0.0".parse().unwrap()],
            }],
            vec!["192.0.2.0".parse().unwrap()],
            vec![],
            1000,
            500,
            "128.0.0.1".parse().unwrap(),
        ))
    }

    #[test]
    fn identical_target_sets_are_unchanged_regardless_of_order() {
        let a = sample_target("x");
        let b = sample_target("y");

        assert!(targets_unchanged(&[a.clone(), b.clone()], &[b, a]));
    }

    #[test]
    fn differing_counts_are_changed() {
        let a = sample_target("x");
        assert!(!targets_unchanged(&[a], &[]));
    }
}
