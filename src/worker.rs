//! A prober worker: the long-lived threads that actually send and receive probes
//! for a fixed group of targets at a fixed rate.
//!
//! Each worker owns one raw sender per address family, one UDP return socket per
//! family, a transit table, and a reference to the shared measurement store. It
//! runs independent threads rather than an async runtime: a send loop, one
//! receive loop per bound family, a timeout sweeper, and a bucket cleaner.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use socket2::Domain;
use tracing::{debug, warn};

use crate::error::SendError;
use crate::measurement::MeasurementStore;
use crate::packet;
use crate::probe::Probe;
use crate::socket::{RawSender, UdpReceiver};
use crate::target::Target;
use crate::transit::{TransitRecord, TransitTable};

/// Fallback sweeper/cleaner tick used while a worker has no targets yet.
const DEFAULT_TICK: Duration = Duration::from_secs(1);
const CLEANER_TICK: Duration = Duration::from_secs(1);

/// The set of targets one worker is responsible for, and the threads driving it.
pub struct ProberWorker {
    targets: Arc<RwLock<Vec<Arc<Target>>>>,
    transit: Arc<TransitTable>,
    store: Arc<MeasurementStore>,
    stop: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl ProberWorker {
    /// Starts every thread for this worker. `udp_base_port` is where the return
    /// socket(s) begin their scan; each family gets an independent receiver.
    pub fn start(
        targets: Vec<Arc<Target>>,
        pps: u32,
        udp_base_port: u16,
        store: Arc<MeasurementStore>,
    ) -> Result<Self, crate::error::SocketError> {
        let transit = Arc::new(TransitTable::new());
        let targets = Arc::new(RwLock::new(targets));
        let stop = Arc::new(AtomicBool::new(false));

        let sender_v4 = Arc::new(RawSender::new_v4()?);
        let sender_v6 = Arc::new(RawSender::new_v6()?);

        let receiver_v4 = Arc::new(UdpReceiver::bind_in_range(Domain::IPV4, udp_base_port)?);
        let receiver_v6 = Arc::new(UdpReceiver::bind_in_range(Domain::IPV6, udp_base_port)?);

        let mut threads = Vec::with_capacity(5);

        threads.push(spawn_send_loop(
            targets.clone(),
            transit.clone(),
            store.clone(),
            sender_v4,
            sender_v6,
            receiver_v4.port,
            pps,
            stop.clone(),
        ));
        threads.push(spawn_receive_loop(
            receiver_v4,
            targets.clone(),
            transit.clone(),
            store.clone(),
            stop.clone(),
        ));
        threads.push(spawn_receive_loop(
            receiver_v6,
            targets.clone(),
            transit.clone(),
            store.clone(),
            stop.clone(),
        ));
        threads.push(spawn_timeout_sweeper(
            targets.clone(),
            transit.clone(),
            store.clone(),
            stop.clone(),
        ));
        threads.push(spawn_bucket_cleaner(targets.clone(), store.clone(), stop.clone()));

        Ok(Self {
            targets,
            transit,
            store,
            stop,
            threads,
        })
    }

    /// Replaces this worker's target set in place, without restarting its threads.
    pub fn set_targets(&self, targets: Vec<Arc<Target>>) {
        *self.targets.write() = targets;
    }

    pub fn target_count(&self) -> usize {
        self.targets.read().len()
    }

    pub fn in_flight(&self) -> usize {
        self.transit.len()
    }

    pub fn stop(self) {
        self.stop.store(true, Ordering::SeqCst);
        for handle in self.threads {
            let _ = handle.join();
        }
    }
}

fn wall_clock_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

#[allow(clippy::too_many_arguments)]
fn spawn_send_loop(
    targets: Arc<RwLock<Vec<Arc<Target>>>>,
    transit: Arc<TransitTable>,
    store: Arc<MeasurementStore>,
    sender_v4: Arc<RawSender>,
    sender_v6: Arc<RawSender>,
    udp_port: u16,
    pps: u32,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let mut sequence: u64 = 0;
        let interval = Duration::from_secs_f64(1.0 / pps.max(1) as f64);

        while !stop.load(Ordering::Relaxed) {
            let snapshot: Vec<Arc<Target>> = targets.read().clone();

            for target in &snapshot {
                if stop.load(Ordering::Relaxed) {
                    return;
                }

                let send_ts_ns = wall_clock_ns();
                let probe = Probe {
                    sequence,
                    send_ts_ns,
                };

                match packet::craft(target, probe, udp_port) {
                    Ok(bytes) => {
                        // Bookkeeping first: a reply must never be able to race
                        // the write it belongs to (§5 ordering guarantee), so
                        // the transit record and the sent counter are credited
                        // before the packet can possibly leave the host.
                        transit.insert(
                            sequence,
                            TransitRecord {
                                target: target.id(),
                                send_ts_ns,
                                sent_at: Instant::now(),
                                measurement_length_ms: target.measurement_length_ms,
                            },
                        );
                        store.record_sent(&target.id(), target.measurement_length_ms, send_ts_ns);

                        match write_packet(&bytes, target, sequence, &sender_v4, &sender_v6) {
                            Ok(()) => {
                                sequence = sequence.wrapping_add(1);
                            }
                            Err(err) => {
                                transit.remove(sequence);
                                warn!(target = %target.name, error = %err, "failed to send probe");
                            }
                        }
                    }
                    Err(err) => {
                        debug!(target = %target.name, error = %err, "failed to craft probe");
                    }
                }

                std::thread::sleep(interval);
            }

            if snapshot.is_empty() {
                std::thread::sleep(interval);
            }
        }
    })
}

fn write_packet(
    bytes: &[u8],
    target: &Target,
    sequence: u64,
    sender_v4: &RawSender,
    sender_v6: &RawSender,
) -> Result<(), SendError> {
    let first_hop = target.hops.first().ok_or(crate::error::CraftError::NoHops)?;
    let dst = first_hop.dst_addr(sequence);
    let src = target.src_addr(sequence);

    let sender = match dst {
        IpAddr::V4(_) => sender_v4,
        IpAddr::V6(_) => sender_v6,
    };

    sender.send(bytes, dst, src, target.tos.value)?;
    Ok(())
}

fn spawn_receive_loop(
    receiver: Arc<UdpReceiver>,
    targets: Arc<RwLock<Vec<Arc<Target>>>>,
    transit: Arc<TransitTable>,
    store: Arc<MeasurementStore>,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        while !stop.load(Ordering::Relaxed) {
            let received = match receiver.recv() {
                Ok(received) => received,
                Err(err) => {
                    warn!(error = %err, "udp receive failed");
                    continue;
                }
            };

            let probe = match Probe::unmarshal(&received.bytes) {
                Ok(probe) => probe,
                Err(err) => {
                    debug!(error = %err, "discarding malformed probe reply");
                    continue;
                }
            };

            let Some(record) = transit.remove(probe.sequence) else {
                debug!(sequence = probe.sequence, "reply for unknown or already-expired probe");
                continue;
            };

            let rtt_ns = received.recv_ts_ns - record.send_ts_ns;
            let target = targets
                .read()
                .iter()
                .find(|t| t.id() == record.target)
                .cloned();

            credit_reply(&store, target.as_deref(), &record, rtt_ns);
        }
    })
}

/// Credits a reply against the measurement store: late if the owning target
/// says the RTT exceeded its timeout, received otherwise. Exactly one of the
/// two is ever credited for a given reply.
fn credit_reply(
    store: &MeasurementStore,
    target: Option<&Target>,
    record: &TransitRecord,
    rtt_ns: i64,
) {
    let measurement_length_ms = target
        .map(|t| t.measurement_length_ms)
        .unwrap_or(record.measurement_length_ms);

    match target {
        Some(target) if target.timed_out(rtt_ns) => {
            target.late_packet();
            store.record_late(&record.target, measurement_length_ms, record.send_ts_ns);
        }
        _ => {
            store.record_recv(&record.target, measurement_length_ms, record.send_ts_ns, rtt_ns);
        }
    }
}

/// Ticks at the shortest `measurement_length_ms` currently configured (falling
/// back to [`DEFAULT_TICK`] while the worker has no targets) and sweeps every
/// transit record whose own three-interval bound has elapsed.
fn spawn_timeout_sweeper(
    targets: Arc<RwLock<Vec<Arc<Target>>>>,
    transit: Arc<TransitTable>,
    store: Arc<MeasurementStore>,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        while !stop.load(Ordering::Relaxed) {
            let tick = targets
                .read()
                .iter()
                .map(|t| Duration::from_millis(t.measurement_length_ms))
                .min()
                .unwrap_or(DEFAULT_TICK);
            std::thread::sleep(tick);

            for (_, record) in transit.sweep_expired(Instant::now()) {
                store.record_timeout(&record.target, record.measurement_length_ms, record.send_ts_ns);
            }
        }
    })
}

/// Ticks once a second; for every currently configured target, reaps
/// measurement buckets strictly older than that target's own
/// `last_finished_bucket`.
fn spawn_bucket_cleaner(
    targets: Arc<RwLock<Vec<Arc<Target>>>>,
    store: Arc<MeasurementStore>,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        while !stop.load(Ordering::Relaxed) {
            std::thread::sleep(CLEANER_TICK);

            let now_ns = wall_clock_ns();
            let mut dropped = 0;
            for target in targets.read().iter() {
                let cutoff = crate::measurement::last_finished_bucket(
                    now_ns,
                    target.timeout_ms,
                    target.measurement_length_ms,
                );
                dropped += store.remove_older_than(cutoff);
            }
            if dropped > 0 {
                debug!(dropped, "evicted expired measurement buckets");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::{Hop, Tos};

    fn target(measurement_length_ms: u64, timeout_ms: u64) -> Target {
        Target::new(
            "core1-core2".to_string(),
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
            measurement_length_ms,
            timeout_ms,
            "128.0.0.1".parse().unwrap(),
        )
    }

    fn record(target: &Target) -> TransitRecord {
        TransitRecord {
            target: target.id(),
            send_ts_ns: 0,
            sent_at: Instant::now(),
            measurement_length_ms: target.measurement_length_ms,
        }
    }

    #[test]
    fn s4_reply_past_timeout_is_credited_as_late_not_received() {
        let target = target(1000, 500);
        let store = MeasurementStore::new();
        // A reply against a bucket the send loop never opened is silently
        // dropped (§4.5), so credit_reply only has anything to observe once
        // the matching add_sent has run.
        store.record_sent(&target.id(), target.measurement_length_ms, 0);

        credit_reply(&store, Some(&target), &record(&target), 600_000_000);

        assert_eq!(target.get_late_packets(), 1);
        let stats = store.get(0, &target.id()).expect("bucket created by record_sent above");
        assert_eq!(stats.received, 0);
        assert_eq!(stats.late, 1);
    }

    #[test]
    fn reply_within_timeout_is_credited_as_received_not_late() {
        let target = target(1000, 500);
        let store = MeasurementStore::new();
        store.record_sent(&target.id(), target.measurement_length_ms, 0);

        credit_reply(&store, Some(&target), &record(&target), 20_000_000);

        assert_eq!(target.get_late_packets(), 0);
        let stats = store.get(0, &target.id()).expect("bucket created by record_sent above");
        assert_eq!(stats.received, 1);
        assert_eq!(stats.late, 0);
    }

    #[test]
    fn reply_for_a_target_removed_mid_flight_still_lands_somewhere() {
        // Target was removed from the map between send and reply; fall back
        // to the record's own measurement length rather than panicking. The
        // bucket itself was opened back when the probe was actually sent,
        // while the target still existed.
        let target = target(1000, 500);
        let store = MeasurementStore::new();
        store.record_sent(&target.id(), target.measurement_length_ms, 0);

        credit_reply(&store, None, &record(&target), 20_000_000);

        let stats = store.get(0, &target.id()).expect("bucket created by record_sent above");
        assert_eq!(stats.received, 1);
    }
}
