//! Error kinds emitted by the prober core, per the error handling design.
//!
//! `NotFound` from the design doc is deliberately not a variant here: it is not
//! an error condition from the caller's point of view (see [`crate::transit::TransitTable::remove`]).

use std::net::IpAddr;

/// Fails configuration compilation; reconfiguration is rejected without touching running workers.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("path {path:?} has an empty {which} range on hop {hop}")]
    EmptyRange {
        path: String,
        hop: usize,
        which: &'static str,
    },
    #[error("path {path:?} mixes address families across hops (first hop is {first:?}, hop {hop} is {other:?})")]
    MixedAddressFamily {
        path: String,
        hop: usize,
        first: IpAddr,
        other: IpAddr,
    },
    #[error("path {path:?} has no hops")]
    NoHops { path: String },
    #[error("path {path:?} references unknown class {class:?}")]
    UnknownClass { path: String, class: String },
    #[error("global source range is empty")]
    EmptySrcRange,
    #[error("{field} is required but missing")]
    MissingField { field: &'static str },
}

/// Raw or UDP socket creation/bind failure. Fatal for the owning worker's `start`.
#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    #[error("failed to create {family} raw socket: {source}")]
    Create {
        family: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("no free UDP port found in range {base}..={base}+65534")]
    NoFreePort { base: u16 },
    #[error("failed to set socket option {option}: {source}")]
    SetOption {
        option: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Per-packet send failure. Logged; the transit record is rolled back; the loop continues.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("failed to craft packet: {0}")]
    Craft(#[from] CraftError),
    #[error("failed to write packet to socket: {0}")]
    Io(#[from] std::io::Error),
}

/// Truncated or malformed received payload. Logged; datagram discarded.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FormatError {
    #[error("probe payload too short: got {got} bytes, need at least {need}")]
    Truncated { got: usize, need: usize },
}

/// Structural problem building a packet. Logged; probe dropped; transit record not created.
#[derive(Debug, thiserror::Error)]
pub enum CraftError {
    #[error("target has no hops")]
    NoHops,
    #[error("failed to compute UDP checksum: {0}")]
    Checksum(&'static str),
}
