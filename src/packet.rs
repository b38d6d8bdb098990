//! Deterministic, byte-exact construction of stacked-GRE-over-IP probe packets.
//!
//! A probe packet is one outer GRE header, followed by one `IP + GRE` pair per
//! intermediate hop, followed by a final `IP + UDP + Probe` destined back at the
//! prober. See the scenarios in the design notes for literal byte vectors.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::CraftError;
use crate::probe::Probe;
use crate::target::Target;

const TTL: u8 = 64;
const PROTO_UDP: u8 = 17;
const PROTO_GRE: u8 = 47;
const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86DD;

const GRE_HEADER_LEN: usize = 4;
const IPV4_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;
const UDP_HEADER_LEN: usize = 8;
const FINAL_SEGMENT_V4_LEN: usize = IPV4_HEADER_LEN + UDP_HEADER_LEN + crate::probe::PROBE_WIRE_LEN;
const FINAL_SEGMENT_V6_LEN: usize = IPV6_HEADER_LEN + UDP_HEADER_LEN + crate::probe::PROBE_WIRE_LEN;

/// Crafts the wire bytes for one probe against `target`, deterministically.
///
/// Dispatches on the address family of the first hop's destination.
pub fn craft(target: &Target, probe: Probe, return_udp_port: u16) -> Result<Vec<u8>, CraftError> {
    let first_hop = target.hops.first().ok_or(CraftError::NoHops)?;

    match first_hop.dst_addr(probe.sequence) {
        IpAddr::V4(_) => craft_ipv4(target, probe, return_udp_port),
        IpAddr::V6(_) => craft_ipv6(target, probe, return_udp_port),
    }
}

pub fn craft_ipv4(target: &Target, probe: Probe, return_udp_port: u16) -> Result<Vec<u8>, CraftError> {
    if target.hops.is_empty() {
        return Err(CraftError::NoHops);
    }

    let mut out = Vec::with_capacity(128);
    push_gre(&mut out, ETHERTYPE_IPV4);
    push_intermediate_hops_v4(&mut out, target, probe.sequence)?;
    push_final_segment_v4(&mut out, target, probe, return_udp_port)?;

    Ok(out)
}

pub fn craft_ipv6(target: &Target, probe: Probe, return_udp_port: u16) -> Result<Vec<u8>, CraftError> {
    if target.hops.is_empty() {
        return Err(CraftError::NoHops);
    }

    let mut out = Vec::with_capacity(160);
    push_gre(&mut out, ETHERTYPE_IPV6);
    push_intermediate_hops_v6(&mut out, target, probe.sequence)?;
    push_final_segment_v6(&mut out, target, probe, return_udp_port)?;

    Ok(out)
}

fn push_gre(out: &mut Vec<u8>, ethertype: u16) {
    out.extend_from_slice(&[0x00, 0x00]);
    out.extend_from_slice(&ethertype.to_be_bytes());
}

fn push_intermediate_hops_v4(out: &mut Vec<u8>, target: &Target, seq: u64) -> Result<(), CraftError> {
    let num_intermediate = target.hops.len() - 1;

    for i in 1..target.hops.len() {
        let src = expect_v4(target.hops[i - 1].src_addr(seq))?;
        let dst = expect_v4(target.hops[i].dst_addr(seq))?;

        // Everything that follows this header: its own trailing GRE layer,
        // every remaining intermediate IP+GRE pair, and the final segment.
        let remaining_after = num_intermediate - i;
        let payload_len =
            GRE_HEADER_LEN + remaining_after * (IPV4_HEADER_LEN + GRE_HEADER_LEN) + FINAL_SEGMENT_V4_LEN;

        push_ipv4_header(out, src, dst, target.tos.value, PROTO_GRE, payload_len);
        push_gre(out, ETHERTYPE_IPV4);
    }

    Ok(())
}

fn push_intermediate_hops_v6(out: &mut Vec<u8>, target: &Target, seq: u64) -> Result<(), CraftError> {
    let num_intermediate = target.hops.len() - 1;

    for i in 1..target.hops.len() {
        let src = expect_v6(target.hops[i - 1].src_addr(seq))?;
        let dst = expect_v6(target.hops[i].dst_addr(seq))?;

        let remaining_after = num_intermediate - i;
        let payload_len =
            GRE_HEADER_LEN + remaining_after * (IPV6_HEADER_LEN + GRE_HEADER_LEN) + FINAL_SEGMENT_V6_LEN;

        push_ipv6_header(out, src, dst, target.tos.value, PROTO_GRE, payload_len);
        push_gre(out, ETHERTYPE_IPV6);
    }

    Ok(())
}

fn push_final_segment_v4(
    out: &mut Vec<u8>,
    target: &Target,
    probe: Probe,
    return_udp_port: u16,
) -> Result<(), CraftError> {
    let last = target.hops.len() - 1;
    let src = expect_v4(target.hops[last].src_addr(probe.sequence))?;
    let dst = expect_v4(target.local_addr)?;

    let payload = probe.marshal();
    let udp_len = 8 + payload.len();

    push_ipv4_header(out, src, dst, target.tos.value, PROTO_UDP, udp_len);

    let checksum = udp_checksum_v4(src, dst, return_udp_port, return_udp_port, &payload);
    push_udp_header(out, return_udp_port, return_udp_port, udp_len as u16, checksum);
    out.extend_from_slice(&payload);

    Ok(())
}

fn push_final_segment_v6(
    out: &mut Vec<u8>,
    target: &Target,
    probe: Probe,
    return_udp_port: u16,
) -> Result<(), CraftError> {
    let last = target.hops.len() - 1;
    let src = expect_v6(target.hops[last].src_addr(probe.sequence))?;
    let dst = expect_v6(target.local_addr)?;

    let payload = probe.marshal();
    let udp_len = 8 + payload.len();

    push_ipv6_header(out, src, dst, target.tos.value, PROTO_UDP, udp_len);

    let checksum = udp_checksum_v6(src, dst, return_udp_port, return_udp_port, &payload);
    push_udp_header(out, return_udp_port, return_udp_port, udp_len as u16, checksum);
    out.extend_from_slice(&payload);

    Ok(())
}

fn expect_v4(addr: IpAddr) -> Result<Ipv4Addr, CraftError> {
    match addr {
        IpAddr::V4(v4) => Ok(v4),
        IpAddr::V6(_) => Err(CraftError::Checksum("mixed address family while crafting IPv4 packet")),
    }
}

fn expect_v6(addr: IpAddr) -> Result<Ipv6Addr, CraftError> {
    match addr {
        IpAddr::V6(v6) => Ok(v6),
        IpAddr::V4(_) => Err(CraftError::Checksum("mixed address family while crafting IPv6 packet")),
    }
}

/// `payload_len` is the length, in bytes, of everything that follows this header.
pub(crate) fn push_ipv4_header(
    out: &mut Vec<u8>,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    tos: u8,
    next_protocol: u8,
    payload_len: usize,
) {
    let total_len = 20 + payload_len;

    let mut header = [0u8; 20];
    header[0] = 0x45; // version 4, IHL 20 bytes
    header[1] = tos;
    header[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    // identification, flags, fragment offset are all zero
    header[8] = TTL;
    header[9] = next_protocol;
    // checksum filled in below
    header[12..16].copy_from_slice(&src.octets());
    header[16..20].copy_from_slice(&dst.octets());

    let checksum = internet_checksum(&header);
    header[10..12].copy_from_slice(&checksum.to_be_bytes());

    out.extend_from_slice(&header);
}

fn push_ipv6_header(
    out: &mut Vec<u8>,
    src: Ipv6Addr,
    dst: Ipv6Addr,
    traffic_class: u8,
    next_header: u8,
    payload_len: usize,
) {
    let mut header = [0u8; 40];
    header[0] = 0x60 | (traffic_class >> 4);
    header[1] = traffic_class << 4;
    // flow label (low 20 bits) stays zero
    header[4..6].copy_from_slice(&(payload_len as u16).to_be_bytes());
    header[6] = next_header;
    header[7] = TTL;
    header[8..24].copy_from_slice(&src.octets());
    header[24..40].copy_from_slice(&dst.octets());

    out.extend_from_slice(&header);
}

fn push_udp_header(out: &mut Vec<u8>, src_port: u16, dst_port: u16, length: u16, checksum: u16) {
    out.extend_from_slice(&src_port.to_be_bytes());
    out.extend_from_slice(&dst_port.to_be_bytes());
    out.extend_from_slice(&length.to_be_bytes());
    out.extend_from_slice(&checksum.to_be_bytes());
}

fn udp_checksum_v4(src: Ipv4Addr, dst: Ipv4Addr, src_port: u16, dst_port: u16, payload: &[u8]) -> u16 {
    let udp_len = 8 + payload.len();

    let mut pseudo = Vec::with_capacity(12 + udp_len);
    pseudo.extend_from_slice(&src.octets());
    pseudo.extend_from_slice(&dst.octets());
    pseudo.push(0);
    pseudo.push(PROTO_UDP);
    pseudo.extend_from_slice(&(udp_len as u16).to_be_bytes());
    pseudo.extend_from_slice(&src_port.to_be_bytes());
    pseudo.extend_from_slice(&dst_port.to_be_bytes());
    pseudo.extend_from_slice(&(udp_len as u16).to_be_bytes());
    pseudo.extend_from_slice(&[0, 0]); // checksum placeholder
    pseudo.extend_from_slice(payload);

    checksum_non_zero(&pseudo)
}

fn udp_checksum_v6(src: Ipv6Addr, dst: Ipv6Addr, src_port: u16, dst_port: u16, payload: &[u8]) -> u16 {
    let udp_len = 8 + payload.len();

    let mut pseudo = Vec::with_capacity(40 + udp_len);
    pseudo.extend_from_slice(&src.octets());
    pseudo.extend_from_slice(&dst.octets());
    pseudo.extend_from_slice(&(udp_len as u32).to_be_bytes());
    pseudo.extend_from_slice(&[0, 0, 0]);
    pseudo.push(PROTO_UDP);
    pseudo.extend_from_slice(&src_port.to_be_bytes());
    pseudo.extend_from_slice(&dst_port.to_be_bytes());
    pseudo.extend_from_slice(&(udp_len as u16).to_be_bytes());
    pseudo.extend_from_slice(&[0, 0]); // checksum placeholder
    pseudo.extend_from_slice(payload);

    checksum_non_zero(&pseudo)
}

/// The internet checksum (RFC 1071): one's complement of the one's-complement sum
/// of 16-bit words, odd trailing byte padded with zero.
fn internet_checksum(bytes: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = bytes.chunks_exact(2);

    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }

    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !(sum as u16)
}

/// UDP checksum of zero means "no checksum computed"; a genuine all-zero result
/// is transmitted as the all-ones value instead, per RFC 768.
fn checksum_non_zero(bytes: &[u8]) -> u16 {
    match internet_checksum(bytes) {
        0 => 0xFFFF,
        sum => sum,
    }
}
