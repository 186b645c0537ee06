//! Packet path
//!
//! Parsing, NAT rewriting and RST synthesis for the per-core fast path:
//! Ethernet II + IPv4 + TCP only, no VLAN, fragments dropped. All
//! transformations are in-place on the frame buffer; checksums are fixed
//! up incrementally so a rewrite never walks the payload.

use bytes::BytesMut;

use riptide_common::{Tuple2, Tuple4};

const ETH_LEN: usize = 14;
const ETHERTYPE_IPV4: u16 = 0x0800;
const IPPROTO_TCP: u8 = 6;

/// What to do with a processed frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Rewritten and ready to transmit
    Forward,
    /// Discard silently
    Drop,
    /// Discard and answer with a synthesized RST
    Reset,
}

/// Batch frame I/O towards the NIC layer.
///
/// The driver side (RX/TX queue polling, checksum offload) lives outside
/// this crate; workers only ever see owned frame buffers.
pub trait FramePort: Send {
    /// Fetch a batch of received frames from `queue`
    fn receive(&mut self, queue: u16) -> Vec<BytesMut>;
    /// Hand a batch of frames to `queue` for transmission
    fn send(&mut self, queue: u16, frames: Vec<BytesMut>);
}

/// Header offsets and flow key extracted from a frame
#[derive(Debug, Clone, Copy)]
pub struct ParsedFrame {
    /// Directed flow key, as seen on the wire
    pub tuple: Tuple4,
    /// Raw TCP control bits
    pub tcp_flags: u8,
    /// Start of the IPv4 header
    pub l3: usize,
    /// Start of the TCP header
    pub l4: usize,
    /// IPv4 total length (the byte count the metrics see)
    pub ip_len: u16,
}

/// Parse an Ethernet II / IPv4 / TCP frame.
///
/// Anything else - short frames, non-IPv4, fragments, non-TCP - yields
/// `None` and the caller drops the frame.
pub fn parse_frame(data: &[u8]) -> Option<ParsedFrame> {
    if data.len() < ETH_LEN + 20 + 20 {
        return None;
    }
    if u16::from_be_bytes([data[12], data[13]]) != ETHERTYPE_IPV4 {
        return None;
    }
    let l3 = ETH_LEN;
    if data[l3] >> 4 != 4 {
        return None;
    }
    let ihl = ((data[l3] & 0x0F) as usize) * 4;
    if ihl < 20 || data.len() < l3 + ihl + 20 {
        return None;
    }
    // More-fragments or a non-zero offset: the L4 header may be absent or
    // the flow key ambiguous.
    let frag = u16::from_be_bytes([data[l3 + 6], data[l3 + 7]]);
    if frag & 0x3FFF != 0 {
        return None;
    }
    if data[l3 + 9] != IPPROTO_TCP {
        return None;
    }
    let l4 = l3 + ihl;
    let src = Tuple2::new(
        u32::from_be_bytes([data[l3 + 12], data[l3 + 13], data[l3 + 14], data[l3 + 15]]),
        u16::from_be_bytes([data[l4], data[l4 + 1]]),
    );
    let dst = Tuple2::new(
        u32::from_be_bytes([data[l3 + 16], data[l3 + 17], data[l3 + 18], data[l3 + 19]]),
        u16::from_be_bytes([data[l4 + 2], data[l4 + 3]]),
    );
    Some(ParsedFrame {
        tuple: Tuple4::new(src, dst),
        tcp_flags: data[l4 + 13],
        l3,
        l4,
        ip_len: u16::from_be_bytes([data[l3 + 2], data[l3 + 3]]),
    })
}

#[inline(always)]
fn read_u16(data: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([data[at], data[at + 1]])
}

#[inline(always)]
fn write_u16(data: &mut [u8], at: usize, v: u16) {
    data[at..at + 2].copy_from_slice(&v.to_be_bytes());
}

/// Incremental checksum fixup for one replaced 16-bit word (RFC 1624)
#[inline(always)]
fn csum_replace(data: &mut [u8], csum_at: usize, old: u16, new: u16) {
    let mut sum = (!read_u16(data, csum_at)) as u32;
    sum += (!old) as u32;
    sum += new as u32;
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    write_u16(data, csum_at, !(sum as u16));
}

/// Replace a 16-bit field, fixing up every listed checksum
#[inline(always)]
fn replace_field(data: &mut [u8], at: usize, new: u16, csums: &[usize]) {
    let old = read_u16(data, at);
    for &c in csums {
        csum_replace(data, c, old, new);
    }
    write_u16(data, at, new);
}

/// Rewrite the frame's endpoint at `addr_at`/`port_at` to `to`.
///
/// Addresses feed both the IPv4 header checksum and the TCP pseudo-header
/// checksum; ports only the latter.
fn rewrite_endpoint(data: &mut [u8], p: &ParsedFrame, addr_at: usize, port_at: usize, to: Tuple2) {
    let ip_csum = p.l3 + 10;
    let tcp_csum = p.l4 + 16;
    let ip = to.ip.to_be_bytes();
    replace_field(
        data,
        addr_at,
        u16::from_be_bytes([ip[0], ip[1]]),
        &[ip_csum, tcp_csum],
    );
    replace_field(
        data,
        addr_at + 2,
        u16::from_be_bytes([ip[2], ip[3]]),
        &[ip_csum, tcp_csum],
    );
    replace_field(data, port_at, to.port, &[tcp_csum]);
}

/// NAT a client -> VIP frame into local -> real
pub fn rewrite_original(data: &mut [u8], p: &ParsedFrame, local: Tuple2, real: Tuple2) {
    rewrite_endpoint(data, p, p.l3 + 12, p.l4, local);
    rewrite_endpoint(data, p, p.l3 + 16, p.l4 + 2, real);
}

/// NAT a real -> local frame into VIP -> client
pub fn rewrite_reply(data: &mut [u8], p: &ParsedFrame, vip: Tuple2, client: Tuple2) {
    rewrite_endpoint(data, p, p.l3 + 12, p.l4, vip);
    rewrite_endpoint(data, p, p.l3 + 16, p.l4 + 2, client);
}

/// Ones-complement sum over `data`, folded to 16 bits
fn checksum_fold(data: &[u8], mut sum: u32) -> u16 {
    let mut chunks = data.chunks_exact(2);
    for c in &mut chunks {
        sum += u16::from_be_bytes([c[0], c[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Synthesize a protocol-correct RST answering the frame in `data`.
///
/// Addresses, ports and MACs are mirrored; the sequence numbers follow the
/// usual rule (use their ACK as our sequence when present, otherwise
/// acknowledge their SYN/segment).
pub fn build_rst(data: &[u8], p: &ParsedFrame) -> BytesMut {
    use crate::conntrack::flags;

    let mut out = BytesMut::zeroed(ETH_LEN + 20 + 20);

    // Ethernet: swap source and destination MACs.
    out[0..6].copy_from_slice(&data[6..12]);
    out[6..12].copy_from_slice(&data[0..6]);
    out[12..14].copy_from_slice(&ETHERTYPE_IPV4.to_be_bytes());

    // IPv4 header, no options.
    out[14] = 0x45;
    write_u16(&mut out, 16, 40);
    out[22] = 64; // TTL
    out[23] = IPPROTO_TCP;
    out[26..30].copy_from_slice(&data[p.l3 + 16..p.l3 + 20]);
    out[30..34].copy_from_slice(&data[p.l3 + 12..p.l3 + 16]);
    let ip_csum = checksum_fold(&out[14..34], 0);
    write_u16(&mut out, 24, ip_csum);

    // TCP header: mirrored ports, RST|ACK.
    let l4 = 34;
    out[l4..l4 + 2].copy_from_slice(&data[p.l4 + 2..p.l4 + 4]);
    out[l4 + 2..l4 + 4].copy_from_slice(&data[p.l4..p.l4 + 2]);
    let their_seq = u32::from_be_bytes([
        data[p.l4 + 4],
        data[p.l4 + 5],
        data[p.l4 + 6],
        data[p.l4 + 7],
    ]);
    let their_ack = u32::from_be_bytes([
        data[p.l4 + 8],
        data[p.l4 + 9],
        data[p.l4 + 10],
        data[p.l4 + 11],
    ]);
    let (seq, ack) = if p.tcp_flags & flags::ACK != 0 {
        (their_ack, their_seq.wrapping_add(1))
    } else {
        (0, their_seq.wrapping_add(1))
    };
    out[l4 + 4..l4 + 8].copy_from_slice(&seq.to_be_bytes());
    out[l4 + 8..l4 + 12].copy_from_slice(&ack.to_be_bytes());
    out[l4 + 12] = 5 << 4;
    out[l4 + 13] = flags::RST | flags::ACK;

    // TCP checksum over the pseudo-header and the 20-byte header.
    let mut pseudo = 0u32;
    pseudo += read_u16(&out, 26) as u32;
    pseudo += read_u16(&out, 28) as u32;
    pseudo += read_u16(&out, 30) as u32;
    pseudo += read_u16(&out, 32) as u32;
    pseudo += IPPROTO_TCP as u32;
    pseudo += 20;
    let tcp_csum = checksum_fold(&out[l4..l4 + 20], pseudo);
    write_u16(&mut out, l4 + 16, tcp_csum);

    out
}

/// Build a minimal TCP test frame (headers only, valid checksums)
#[cfg(test)]
pub(crate) fn build_tcp_frame(src: Tuple2, dst: Tuple2, tcp_flags: u8) -> BytesMut {
    let mut out = BytesMut::zeroed(ETH_LEN + 20 + 20);
    out[0..6].copy_from_slice(&[2, 0, 0, 0, 0, 1]);
    out[6..12].copy_from_slice(&[2, 0, 0, 0, 0, 2]);
    out[12..14].copy_from_slice(&ETHERTYPE_IPV4.to_be_bytes());

    out[14] = 0x45;
    write_u16(&mut out, 16, 40);
    out[22] = 64;
    out[23] = IPPROTO_TCP;
    out[26..30].copy_from_slice(&src.ip.to_be_bytes());
    out[30..34].copy_from_slice(&dst.ip.to_be_bytes());
    let ip_csum = checksum_fold(&out[14..34], 0);
    write_u16(&mut out, 24, ip_csum);

    let l4 = 34;
    write_u16(&mut out, l4, src.port);
    write_u16(&mut out, l4 + 2, dst.port);
    out[l4 + 4..l4 + 8].copy_from_slice(&1000u32.to_be_bytes());
    out[l4 + 12] = 5 << 4;
    out[l4 + 13] = tcp_flags;
    let mut pseudo = 0u32;
    pseudo += read_u16(&out, 26) as u32;
    pseudo += read_u16(&out, 28) as u32;
    pseudo += read_u16(&out, 30) as u32;
    pseudo += read_u16(&out, 32) as u32;
    pseudo += IPPROTO_TCP as u32;
    pseudo += 20;
    let tcp_csum = checksum_fold(&out[l4..l4 + 20], pseudo);
    write_u16(&mut out, l4 + 16, tcp_csum);
    out
}
