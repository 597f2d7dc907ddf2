use alloc::boxed::Box;
use core::convert::{TryFrom, TryInto};

use log::trace;

use crate::{
    error::{NetError, Result},
    mbuf::MBuf,
    param::IP_DEFAULT_TTL,
};

use super::{
    checksum::in_cksum, ethernet, get_u16, get_u32, put_u16, put_u32, tcp, udp, Header, Ipv4,
    NetStack, ETHERNET_MAC_ADDR_BROADCAST,
};

const VERSION_IHL: u8 = (4 << 4) | (20 >> 2); // version 4, no options

#[repr(u8)]
#[derive(PartialEq, Debug, Clone, Copy)]
pub enum Protocol {
    TCP = 6,
    UDP = 17,
}

impl TryFrom<u8> for Protocol {
    type Error = &'static str;
    fn try_from(value: u8) -> core::result::Result<Self, Self::Error> {
        match value {
            6 => Ok(Protocol::TCP),
            17 => Ok(Protocol::UDP),
            _ => Err("unsupported ip protocol"),
        }
    }
}

pub struct IpHeader {
    pub hdr_ver: u8,
    pub tos: u8,
    pub len: u16,
    pub id: u16,
    pub fragment: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub src_ip_addr: u32,
    pub dst_ip_addr: u32,
}

impl Header for IpHeader {
    const SIZE: usize = 20;

    fn decode(b: &[u8]) -> Self {
        Self {
            hdr_ver: b[0],
            tos: b[1],
            len: get_u16(b, 2),
            id: get_u16(b, 4),
            fragment: get_u16(b, 6),
            ttl: b[8],
            protocol: b[9],
            checksum: get_u16(b, 10),
            src_ip_addr: get_u32(b, 12),
            dst_ip_addr: get_u32(b, 16),
        }
    }

    fn encode(&self, b: &mut [u8]) {
        b[0] = self.hdr_ver;
        b[1] = self.tos;
        put_u16(b, 2, self.len);
        put_u16(b, 4, self.id);
        put_u16(b, 6, self.fragment);
        b[8] = self.ttl;
        b[9] = self.protocol;
        put_u16(b, 10, self.checksum);
        put_u32(b, 12, self.src_ip_addr);
        put_u32(b, 16, self.dst_ip_addr);
    }
}

pub const HEADER_SIZE: usize = IpHeader::SIZE;

pub fn tx(stack: &NetStack, mut m: Box<MBuf>, dst_ip_addr: u32, proto: Protocol) -> Result<()> {
    let len = m.len() + HEADER_SIZE;
    let hdr = IpHeader {
        hdr_ver: VERSION_IHL,
        tos: 0,
        len: len as u16,
        id: 0,
        fragment: 0,
        ttl: IP_DEFAULT_TTL,
        protocol: proto as u8,
        checksum: 0,
        src_ip_addr: stack.config().ip,
        dst_ip_addr,
    };
    let b = m.push(HEADER_SIZE).ok_or(NetError::NoBuffers)?;
    hdr.encode(b);
    let sum = in_cksum(b, 0);
    put_u16(b, 10, sum);

    // There is no arp cache; the frame goes out to everyone on the link.
    ethernet::tx(stack, m, ethernet::Type::IPv4, &ETHERNET_MAC_ADDR_BROADCAST)
}

pub fn rx(stack: &NetStack, mut m: Box<MBuf>) {
    let (hdr, verified) = match m.data().get(..HEADER_SIZE) {
        Some(b) => (IpHeader::decode(b), in_cksum(b, 0) == 0),
        None => return,
    };
    m.pull(HEADER_SIZE);

    if hdr.hdr_ver != VERSION_IHL {
        trace!("ip_rx: unsupported version/ihl {:#x}", hdr.hdr_ver);
        return;
    }
    if !verified {
        trace!("ip_rx: bad header checksum from {}", Ipv4(hdr.src_ip_addr));
        return;
    }
    if hdr.fragment != 0 {
        trace!("ip_rx: fragmented packet from {}", Ipv4(hdr.src_ip_addr));
        return;
    }
    if hdr.dst_ip_addr != stack.config().ip {
        trace!("ip_rx: not for us ({})", Ipv4(hdr.dst_ip_addr));
        return;
    }
    let proto: Protocol = match hdr.protocol.try_into() {
        Ok(proto) => proto,
        Err(msg) => {
            trace!("ip_rx: {} {}", msg, hdr.protocol);
            return;
        }
    };

    let len = match (hdr.len as usize).checked_sub(HEADER_SIZE) {
        Some(len) if len <= m.len() => len,
        _ => {
            trace!("ip_rx: bad total length {}", hdr.len);
            return;
        }
    };
    // the link layer may have padded a short frame
    let padding = m.len() - len;
    m.trim(padding);

    match proto {
        Protocol::UDP => udp::rx(stack, m, &hdr),
        Protocol::TCP => tcp::rx(stack, m, &hdr),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::ethernet::{EthHeader, HEADER_SIZE as ETH_HEADER_SIZE};
    use crate::param::build_ip_addr;
    use crate::testutil;

    fn frame(
        stack: &NetStack,
        payload: &[u8],
        pad: usize,
        f: impl FnOnce(&mut IpHeader),
    ) -> Box<MBuf> {
        let mut m = MBuf::alloc(ETH_HEADER_SIZE + HEADER_SIZE).unwrap();
        m.put(payload.len()).unwrap().copy_from_slice(payload);
        let mut hdr = IpHeader {
            hdr_ver: VERSION_IHL,
            tos: 0,
            len: (HEADER_SIZE + payload.len()) as u16,
            id: 0,
            fragment: 0,
            ttl: 64,
            protocol: Protocol::UDP as u8,
            checksum: 0,
            src_ip_addr: testutil::PEER_IP,
            dst_ip_addr: stack.config().ip,
        };
        f(&mut hdr);
        m.put(pad).unwrap();
        let b = m.push(HEADER_SIZE).unwrap();
        hdr.encode(b);
        if hdr.checksum == 0 {
            let sum = in_cksum(b, 0);
            put_u16(b, 10, sum);
        }
        m.push_hdr(&EthHeader {
            dst_mac: stack.config().mac,
            src_mac: testutil::PEER_MAC,
            typ: ethernet::Type::IPv4 as u16,
        })
        .unwrap();
        m
    }

    fn udp_payload(dport: u16) -> [u8; 12] {
        let mut p = [0u8; 12];
        put_u16(&mut p, 0, 4000);
        put_u16(&mut p, 2, dport);
        put_u16(&mut p, 4, 12);
        p[8..].copy_from_slice(b"ping");
        p
    }

    #[test]
    fn tx_builds_valid_header() {
        let (stack, lo) = testutil::stack();
        let mut m = MBuf::alloc(ETH_HEADER_SIZE + HEADER_SIZE).unwrap();
        m.put(3).unwrap().copy_from_slice(b"abc");
        tx(&stack, m, testutil::PEER_IP, Protocol::UDP).unwrap();

        let mut frame = lo.pop_frame().unwrap();
        let eth = frame.pull_hdr::<EthHeader>().unwrap();
        assert_eq!(ETHERNET_MAC_ADDR_BROADCAST, eth.dst_mac);
        assert_eq!(0, in_cksum(&frame.data()[..HEADER_SIZE], 0));

        let hdr = frame.pull_hdr::<IpHeader>().unwrap();
        assert_eq!(0x45, hdr.hdr_ver);
        assert_eq!(23, hdr.len);
        assert_eq!(IP_DEFAULT_TTL, hdr.ttl);
        assert_eq!(Protocol::UDP as u8, hdr.protocol);
        assert_eq!(stack.config().ip, hdr.src_ip_addr);
        assert_eq!(testutil::PEER_IP, hdr.dst_ip_addr);
        assert_eq!(b"abc", frame.data());
    }

    #[test]
    fn rx_trims_link_padding() {
        let (stack, _lo) = testutil::stack();
        let sock = stack.udp.open().unwrap();
        stack.udp.bind(&stack, sock, 2000).unwrap();

        stack.rx(frame(&stack, &udp_payload(2000), 18, |_| {}));

        let mut buf = [0u8; 16];
        let (n, from) = stack.udp.read(&stack, sock, &mut buf).unwrap();
        assert_eq!(b"ping", &buf[..n]);
        assert_eq!(testutil::PEER_IP, from.addr);
        stack.udp.close(&stack, sock);
    }

    #[test]
    fn rx_drops_invalid_packets() {
        let (stack, _lo) = testutil::stack();
        let sock = stack.udp.open().unwrap();
        stack.udp.bind(&stack, sock, 2000).unwrap();
        let p = udp_payload(2000);

        stack.rx(frame(&stack, &p, 0, |h| h.checksum = 0xbeef));
        stack.rx(frame(&stack, &p, 0, |h| h.fragment = 0x2000));
        stack.rx(frame(&stack, &p, 0, |h| h.hdr_ver = 0x46));
        stack.rx(frame(&stack, &p, 0, |h| h.dst_ip_addr = build_ip_addr(10, 0, 2, 16)));
        stack.rx(frame(&stack, &p, 0, |h| h.protocol = 1));
        stack.rx(frame(&stack, &p, 0, |h| h.len = 100));

        assert_eq!(0, stack.udp.pending(sock));
        stack.udp.close(&stack, sock);
    }
}
