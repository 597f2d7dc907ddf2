use alloc::boxed::Box;

use core::convert::{TryFrom, TryInto};

use log::{trace, warn};

use crate::{
    error::{NetError, Result},
    mbuf::MBuf,
};

use super::{arp, get_u16, ip, put_u16, Header, NetStack};

pub const ETHERNET_MAC_ADDR_BROADCAST: [u8; 6] = [0xff, 0xff, 0xff, 0xff, 0xff, 0xff];

#[repr(u16)]
#[derive(PartialEq, Debug, Clone, Copy)]
pub enum Type {
    IPv4 = 0x800,
    ARP = 0x806,
}

impl TryFrom<u16> for Type {
    type Error = &'static str;
    fn try_from(value: u16) -> core::result::Result<Self, Self::Error> {
        match value {
            0x800 => Ok(Type::IPv4),
            0x806 => Ok(Type::ARP),
            _ => Err("undefined ethernet type"),
        }
    }
}

pub struct EthHeader {
    pub dst_mac: [u8; 6],
    pub src_mac: [u8; 6],
    pub typ: u16,
}

impl Header for EthHeader {
    const SIZE: usize = 14;

    fn decode(b: &[u8]) -> Self {
        let mut dst_mac = [0u8; 6];
        let mut src_mac = [0u8; 6];
        dst_mac.copy_from_slice(&b[0..6]);
        src_mac.copy_from_slice(&b[6..12]);
        Self {
            dst_mac,
            src_mac,
            typ: get_u16(b, 12),
        }
    }

    fn encode(&self, b: &mut [u8]) {
        b[0..6].copy_from_slice(&self.dst_mac);
        b[6..12].copy_from_slice(&self.src_mac);
        put_u16(b, 12, self.typ);
    }
}

pub const HEADER_SIZE: usize = EthHeader::SIZE;

/// prepends the ethernet header and hands the frame to the device.
pub fn tx(stack: &NetStack, mut m: Box<MBuf>, typ: Type, dst_mac: &[u8; 6]) -> Result<()> {
    let hdr = EthHeader {
        dst_mac: *dst_mac,
        src_mac: stack.config().mac,
        typ: typ as u16,
    };
    m.push_hdr(&hdr).ok_or(NetError::NoBuffers)?;

    stack.kernel().transmit(m).map_err(|msg| {
        warn!("failed to send packet: {}", msg);
        NetError::Transmit(msg)
    })
}

pub fn rx(stack: &NetStack, mut m: Box<MBuf>) {
    let hdr = match m.pull_hdr::<EthHeader>() {
        Some(hdr) => hdr,
        None => {
            trace!("eth_rx: runt frame ({} bytes)", m.len());
            return;
        }
    };

    match hdr.typ.try_into() {
        Ok(Type::IPv4) => ip::rx(stack, m),
        Ok(Type::ARP) => arp::rx(stack, m),
        Err(msg) => trace!("eth_rx: {} {:#x}", msg, hdr.typ),
    }
}
