//! On-disk configuration model and its compilation into runtime [`Target`]s.
//!
//! The raw, serde-deserialized shape mirrors what an operator writes in TOML;
//! [`RawConfig::compile`] turns it into the validated, immutable targets the
//! manager actually runs, rejecting a bad configuration wholesale rather than
//! partially applying it.

use std::collections::HashMap;
use std::net::IpAddr;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::target::{Hop, Label, Target, Tos};

/// A named traffic class and the IP ToS / traffic-class byte it maps to.
#[derive(Debug, Clone, Deserialize)]
pub struct ClassConfig {
    pub value: u8,
}

/// One forwarding layer of a path: where a probe may leave from, and where the
/// next layer's packet is addressed to.
#[derive(Debug, Clone, Deserialize)]
pub struct HopConfig {
    pub src_range: Vec<IpAddr>,
    pub dst_range: Vec<IpAddr>,
}

/// One probed path: an ordered hop list plus the probing parameters applied to
/// every traffic class listed in `classes`.
#[derive(Debug, Clone, Deserialize)]
pub struct PathConfig {
    pub name: String,
    pub classes: Vec<String>,
    pub hops: Vec<HopConfig>,
    #[serde(default)]
    pub src_addrs: Vec<IpAddr>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub measurement_length_ms: u64,
    pub timeout_ms: u64,
    pub pps: u32,
}

/// Top-level on-disk configuration: the class table, the path list, and where
/// probes are expected to return to.
#[derive(Debug, Clone, Deserialize)]
pub struct RawConfig {
    pub classes: HashMap<String, ClassConfig>,
    pub paths: Vec<PathConfig>,
    pub local_addr: IpAddr,
    #[serde(default = "default_udp_base_port")]
    pub udp_base_port: u16,
}

fn default_udp_base_port() -> u16 {
    33434
}

/// One compiled target together with the pps group it belongs to.
pub struct CompiledTarget {
    pub target: Target,
    pub pps: u32,
}

impl RawConfig {
    /// Validates and lowers every path/class combination into a [`Target`].
    ///
    /// All-or-nothing: the first violation aborts compilation so a bad edit
    /// never partially replaces the running configuration.
    pub fn compile(&self) -> Result<Vec<CompiledTarget>, ConfigError> {
        let mut out = Vec::new();

        for path in &self.paths {
            if path.hops.is_empty() {
                return Err(ConfigError::NoHops {
                    path: path.name.clone(),
                });
            }

            for (i, hop) in path.hops.iter().enumerate() {
                if hop.src_range.is_empty() {
                    return Err(ConfigError::EmptyRange {
                        path: path.name.clone(),
                        hop: i,
                        which: "src_range",
                    });
                }
                if hop.dst_range.is_empty() {
                    return Err(ConfigError::EmptyRange {
                        path: path.name.clone(),
                        hop: i,
                        which: "dst_range",
                    });
                }
            }

            let first_family = path.hops[0].src_range[0];
            for (i, hop) in path.hops.iter().enumerate() {
                for addr in hop.src_range.iter().chain(hop.dst_range.iter()) {
                    if !same_family(first_family, *addr) {
                        return Err(ConfigError::MixedAddressFamily {
                            path: path.name.clone(),
                            hop: i,
                            first: first_family,
                            other: *addr,
                        });
                    }
                }
            }

            if path.src_addrs.is_empty() {
                return Err(ConfigError::EmptySrcRange);
            }

            for class_name in &path.classes {
                let class = self
                    .classes
                    .get(class_name)
                    .ok_or_else(|| ConfigError::UnknownClass {
                        path: path.name.clone(),
                        class: class_name.clone(),
                    })?;

                let hops = path
                    .hops
                    .iter()
                    .map(|h| Hop {
                        src_range: h.src_range.clone(),
                        dst_range: h.dst_range.clone(),
                    })
                    .collect();

                let labels = path
                    .labels
                    .iter()
                    .map(|(k, v)| Label {
                        key: k.clone(),
                        value: v.clone(),
                    })
                    .collect();

                let target = Target::new(
                    path.name.clone(),
                    Tos {
                        name: class_name.clone(),
                        value: class.value,
                    },
                    hops,
                    path.src_addrs.clone(),
                    labels,
                    path.measurement_length_ms,
                    path.timeout_ms,
                    self.local_addr,
                );

                out.push(CompiledTarget {
                    target,
                    pps: path.pps,
                });
            }
        }

        Ok(out)
    }
}

fn same_family(a: IpAddr, b: IpAddr) -> bool {
    matches!(
        (a, b),
        (IpAddr::V4(_), IpAddr::V4(_)) | (IpAddr::V6(_), IpAddr::V6(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> RawConfig {
        let mut classes = HashMap::new();
        classes.insert("be".to_string(), ClassConfig { value: 0 });

        RawConfig {
            classes,
            paths: vec![PathConfig {
                name: "core1-core2".to_string(),
                classes: vec!["be".to_string()],
                hops: vec![HopConfig {
                    src_range: vec!["192.0.2.0".parse().unwrap()],
                    dst_range: vec!["169.254.0.0".parse().unwrap()],
                }],
                src_addrs: vec!["192.0.2.0".parse().unwrap()],
                labels: HashMap::new(),
                measurement_length_ms: 1000,
                timeout_ms: 500,
                pps: 10,
            }],
            local_addr: "128.0.0.1".parse().unwrap(),
            udp_base_port: 33434,
        }
    }

    #[test]
    fn compiles_a_minimal_valid_config() {
        let compiled = minimal_config().compile().unwrap();
        assert_eq!(compiled.len(), 1);
        assert_eq!(compiled[0].pps, 10);
        assert_eq!(compiled[0].target.name, "core1-core2");
    }

    #[test]
    fn rejects_unknown_class() {
        let mut cfg = minimal_config();
        cfg.paths[0].classes = vec!["ef".to_string()];

        let err = cfg.compile().unwrap_err();
        assert!(matches!(err, ConfigError::UnknownClass { .. }));
    }

    #[test]
    fn rejects_empty_hop_list() {
        let mut cfg = minimal_config();
        cfg.paths[0].hops.clear();

        let err = cfg.compile().unwrap_err();
        assert!(matches!(err, ConfigError::NoHops { .. }));
    }

    #[test]
    fn rejects_mixed_address_families() {
        let mut cfg = minimal_config();
        cfg.paths[0].hops[0].dst_range = vec!["2001:db8::1".parse().unwrap()];

        let err = cfg.compile().unwrap_err();
        assert!(matches!(err, ConfigError::MixedAddressFamily { .. }));
    }

    #[test]
    fn rejects_empty_global_src_range() {
        let mut cfg = minimal_config();
        cfg.paths[0].src_addrs.clear();

        let err = cfg.compile().unwrap_err();
        assert!(matches!(err, ConfigError::EmptySrcRange));
    }
}
