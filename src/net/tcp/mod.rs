//! Transmission Control Protocol.
//!
//! `rx` validates an incoming segment and finds its connection; `input` runs the RFC 793
//! segment-arrival checklist on it. `data` keeps received bytes in sequence order and `output`
//! builds every outgoing segment. Connections themselves and the user-facing calls live in
//! `sock`, the table of live connections in `registry`.

use alloc::boxed::Box;

use bitflags::bitflags;
use log::trace;

use crate::mbuf::MBuf;

use super::{
    checksum::tcp_checksum, get_u16, get_u32, ip::IpHeader, put_u16, put_u32, Header, NetStack,
};

mod data;
mod input;
mod output;
mod registry;
mod sock;

#[cfg(test)]
pub(crate) use registry::Endpoints;
pub(crate) use registry::Registry;
pub(crate) use sock::TcpSock;

bitflags! {
    pub struct TcpFlags: u8 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
        const URG = 0x20;
        const ECE = 0x40;
        const CWR = 0x80;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
    Close,
}

pub(crate) const MIN_DATA_OFF: u8 = 5; // in 32-bit words

pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack_seq: u32,
    pub doff: u8,
    pub flags: TcpFlags,
    pub window: u16,
    pub checksum: u16,
    pub urgent: u16,
}

impl Header for TcpHeader {
    const SIZE: usize = 20;

    fn decode(b: &[u8]) -> Self {
        Self {
            src_port: get_u16(b, 0),
            dst_port: get_u16(b, 2),
            seq: get_u32(b, 4),
            ack_seq: get_u32(b, 8),
            doff: b[12] >> 4,
            flags: TcpFlags::from_bits_truncate(b[13]),
            window: get_u16(b, 14),
            checksum: get_u16(b, 16),
            urgent: get_u16(b, 18),
        }
    }

    fn encode(&self, b: &mut [u8]) {
        put_u16(b, 0, self.src_port);
        put_u16(b, 2, self.dst_port);
        put_u32(b, 4, self.seq);
        put_u32(b, 8, self.ack_seq);
        b[12] = self.doff << 4;
        b[13] = self.flags.bits();
        put_u16(b, 14, self.window);
        put_u16(b, 16, self.checksum);
        put_u16(b, 18, self.urgent);
    }
}

pub const HEADER_SIZE: usize = TcpHeader::SIZE;

// sequence number comparisons, modulo 2^32

#[inline]
pub(crate) fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

#[inline]
pub(crate) fn seq_le(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) <= 0
}

#[inline]
pub(crate) fn seq_gt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

#[inline]
pub(crate) fn seq_ge(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) >= 0
}

/// An arriving segment: its header, the addresses from the ip header, and its data. The
/// mbuf's `seq`/`end_seq` cover the data only.
pub(crate) struct Segment {
    pub hdr: TcpHeader,
    pub saddr: u32,
    pub daddr: u32,
    pub m: Box<MBuf>,
}

impl Segment {
    pub fn len(&self) -> u32 {
        self.m.end_seq.wrapping_sub(self.m.seq)
    }

    pub fn has(&self, flags: TcpFlags) -> bool {
        self.hdr.flags.contains(flags)
    }
}

pub fn rx(stack: &NetStack, mut m: Box<MBuf>, ip_hdr: &IpHeader) {
    if m.len() < HEADER_SIZE {
        return;
    }
    if tcp_checksum(ip_hdr.src_ip_addr, ip_hdr.dst_ip_addr, m.data()) != 0 {
        trace!("tcp_rx: bad checksum");
        return;
    }

    let hdr = match m.pull_hdr::<TcpHeader>() {
        Some(hdr) => hdr,
        None => return,
    };
    if hdr.doff < MIN_DATA_OFF {
        trace!("tcp_rx: bad data offset {}", hdr.doff);
        return;
    }
    // options are not supported; skip them
    let opts = (hdr.doff - MIN_DATA_OFF) as usize * 4;
    if m.pull(opts).is_none() {
        return;
    }

    m.seq = hdr.seq;
    m.end_seq = hdr.seq.wrapping_add(m.len() as u32);
    m.tcp_flags = hdr.flags;

    let sock = match stack.tcp.lookup(
        ip_hdr.dst_ip_addr,
        hdr.dst_port,
        ip_hdr.src_ip_addr,
        hdr.src_port,
    ) {
        Some(sock) => sock,
        None => {
            trace!("tcp_rx: no connection for port {}", hdr.dst_port);
            return;
        }
    };

    let seg = Segment {
        hdr,
        saddr: ip_hdr.src_ip_addr,
        daddr: ip_hdr.dst_ip_addr,
        m,
    };
    input::process(stack, &sock, seg);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_comparisons_wrap() {
        assert!(seq_lt(1, 2));
        assert!(seq_lt(u32::MAX, 0));
        assert!(seq_gt(5, u32::MAX - 5));
        assert!(seq_le(7, 7));
        assert!(seq_ge(7, 7));
        assert!(!seq_gt(7, 7));
    }

    #[test]
    fn header_codec() {
        let hdr = TcpHeader {
            src_port: 4000,
            dst_port: 80,
            seq: 0x01020304,
            ack_seq: 0x0a0b0c0d,
            doff: MIN_DATA_OFF,
            flags: TcpFlags::SYN | TcpFlags::ACK,
            window: 65535,
            checksum: 0,
            urgent: 0,
        };
        let mut b = [0u8; HEADER_SIZE];
        hdr.encode(&mut b);
        assert_eq!(0x50, b[12]);
        assert_eq!(0x12, b[13]);

        let back = TcpHeader::decode(&b);
        assert_eq!(0x01020304, back.seq);
        assert_eq!(0x0a0b0c0d, back.ack_seq);
        assert_eq!(TcpFlags::SYN | TcpFlags::ACK, back.flags);
    }
}
