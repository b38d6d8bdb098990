//! Compiled per-(path, traffic-class) probe target.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};

/// A logical forwarding point: the source range a packet may leave from at this
/// layer, and the destination range the next layer is addressed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hop {
    pub src_range: Vec<IpAddr>,
    pub dst_range: Vec<IpAddr>,
}

impl Hop {
    pub fn src_addr(&self, seq: u64) -> IpAddr {
        self.src_range[(seq % self.src_range.len() as u64) as usize]
    }

    pub fn dst_addr(&self, seq: u64) -> IpAddr {
        self.dst_range[(seq % self.dst_range.len() as u64) as usize]
    }
}

/// Type-of-service / traffic-class value applied on every IP layer of a probe.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tos {
    pub name: String,
    pub value: u8,
}

/// Identifies a target uniquely: one instance per (path, traffic-class).
///
/// No separate IP-version field: the version is implied by the hops (see
/// the open question this resolves in the design notes).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetId {
    pub path: String,
    pub tos: Tos,
}

/// A static `(key, value)` label pair attached to a path's configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Label {
    pub key: String,
    pub value: String,
}

/// Compiled per-(path, traffic-class) configuration for one probed route.
///
/// Created when a path is added to the running configuration; mutated only for
/// the atomic late-packet count; destroyed when the path is removed.
#[derive(Debug)]
pub struct Target {
    pub name: String,
    pub tos: Tos,
    pub hops: Vec<Hop>,
    pub src_addrs: Vec<IpAddr>,
    pub static_labels: Vec<Label>,
    pub measurement_length_ms: u64,
    pub timeout_ms: u64,
    pub local_addr: IpAddr,
    late_packets: AtomicU64,
}

impl Target {
    pub fn new(
        name: String,
        tos: Tos,
        hops: Vec<Hop>,
        src_addrs: Vec<IpAddr>,
        static_labels: Vec<Label>,
        measurement_length_ms: u64,
        timeout_ms: u64,
        local_addr: IpAddr,
    ) -> Self {
        Self {
            name,
            tos,
            hops,
            src_addrs,
            static_labels,
            measurement_length_ms,
            timeout_ms,
            local_addr,
            late_packets: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> TargetId {
        TargetId {
            path: self.name.clone(),
            tos: self.tos.clone(),
        }
    }

    /// `src_addrs[seq mod |src_addrs|]`, the address the first hop's packet leaves from.
    pub fn src_addr(&self, seq: u64) -> IpAddr {
        self.src_addrs[(seq % self.src_addrs.len() as u64) as usize]
    }

    /// Ordered label keys; the two tail positions are always `"tos"` and `"path"`.
    pub fn labels(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.static_labels.iter().map(|l| l.key.as_str()).collect();
        keys.push("tos");
        keys.push("path");
        keys
    }

    /// Ordered label values, matching the order of [`Target::labels`].
    pub fn label_values(&self) -> Vec<&str> {
        let mut values: Vec<&str> = self
            .static_labels
            .iter()
            .map(|l| l.value.as_str())
            .collect();
        values.push(self.tos.name.as_str());
        values.push(self.name.as_str());
        values
    }

    pub fn timed_out(&self, rtt_ns: i64) -> bool {
        rtt_ns > self.timeout_ms as i64 * 1_000_000
    }

    pub fn late_packet(&self) {
        self.late_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_late_packets(&self) -> u64 {
        self.late_packets.load(Ordering::Relaxed)
    }

    /// Whether `other` is a drop-in replacement for `self` for pool-membership purposes.
    ///
    /// Considers measurement length, timeout, the hop list, and static labels —
    /// deliberately excludes the (per-instance) late-packet counter.
    pub fn configuration_eq(&self, other: &Target) -> bool {
        self.measurement_length_ms == other.measurement_length_ms
            && self.timeout_ms == other.timeout_ms
            && self.hops == other.hops
            && self.static_labels == other.static_labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_target() -> Target {
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
            vec![Label {
                key: "region".to_string(),
                value: "eu".to_string(),
            }],
            1000,
            500,
            "128.0.0.1".parse().unwrap(),
        )
    }

    #[test]
    fn labels_tail_with_tos_and_path() {
        let target = sample_target();

        assert_eq!(target.labels(), vec!["region", "tos", "path"]);
        assert_eq!(target.label_values(), vec!["eu", "be", "core1-core2"]);
    }

    #[test]
    fn timed_out_uses_millisecond_budget() {
        let target = sample_target();

        assert!(!target.timed_out(500_000_000));
        assert!(target.timed_out(600_000_000));
    }

    #[test]
    fn late_packets_counter_is_monotonic() {
        let target = sample_target();

        assert_eq!(target.get_late_packets(), 0);
        target.late_packet();
        target.late_packet();
        assert_eq!(target.get_late_packets(), 2);
    }

    #[test]
    fn src_addr_indexes_modulo_pool_size() {
        let target = sample_target();

        assert_eq!(target.src_addr(0), "192.0.2.0".parse::<IpAddr>().unwrap());
        assert_eq!(target.src_addr(1), "192.0.2.0".parse::<IpAddr>().unwrap());
    }
}
