use alloc::boxed::Box;
use core::convert::{TryFrom, TryInto};

use log::{debug, trace};

use crate::{
    error::{NetError, Result},
    mbuf::MBuf,
    param::MBUF_DEFAULT_HEADROOM,
};

use super::{ethernet, get_u16, get_u32, put_u16, put_u32, Header, Ipv4, NetStack};

const ETH_HTYPE: u16 = 1;
const IPV4_PTYPE: u16 = 0x800;
const ETH_HLEN: u8 = 6;
const IPV4_PLEN: u8 = 4;

#[repr(u16)]
#[derive(PartialEq, Debug, Clone, Copy)]
pub enum Operand {
    Request = 1,
    Reply = 2,
}

impl TryFrom<u16> for Operand {
    type Error = &'static str;
    fn try_from(value: u16) -> core::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Operand::Request),
            2 => Ok(Operand::Reply),
            _ => Err("undefined arp operand"),
        }
    }
}

pub struct ArpHeader {
    pub htype: u16,
    pub ptype: u16,
    pub hlen: u8,
    pub plen: u8,
    pub oper: u16,
    pub sha: [u8; 6],
    pub spa: u32,
    pub tha: [u8; 6],
    pub tpa: u32,
}

impl Header for ArpHeader {
    const SIZE: usize = 28;

    fn decode(b: &[u8]) -> Self {
        let mut sha = [0u8; 6];
        let mut tha = [0u8; 6];
        sha.copy_from_slice(&b[8..14]);
        tha.copy_from_slice(&b[18..24]);
        Self {
            htype: get_u16(b, 0),
            ptype: get_u16(b, 2),
            hlen: b[4],
            plen: b[5],
            oper: get_u16(b, 6),
            sha,
            spa: get_u32(b, 14),
            tha,
            tpa: get_u32(b, 24),
        }
    }

    fn encode(&self, b: &mut [u8]) {
        put_u16(b, 0, self.htype);
        put_u16(b, 2, self.ptype);
        b[4] = self.hlen;
        b[5] = self.plen;
        put_u16(b, 6, self.oper);
        b[8..14].copy_from_slice(&self.sha);
        put_u32(b, 14, self.spa);
        b[18..24].copy_from_slice(&self.tha);
        put_u32(b, 24, self.tpa);
    }
}

impl ArpHeader {
    fn is_ethernet_ipv4(&self) -> bool {
        self.htype == ETH_HTYPE
            && self.ptype == IPV4_PTYPE
            && self.hlen == ETH_HLEN
            && self.plen == IPV4_PLEN
    }
}

pub fn tx(stack: &NetStack, op: Operand, dst_mac: &[u8; 6], dst_ip: u32) -> Result<()> {
    let mut m = MBuf::alloc(MBUF_DEFAULT_HEADROOM)?;
    let hdr = ArpHeader {
        htype: ETH_HTYPE,
        ptype: IPV4_PTYPE,
        hlen: ETH_HLEN,
        plen: IPV4_PLEN,
        oper: op as u16,
        sha: stack.config().mac,
        spa: stack.config().ip,
        tha: *dst_mac,
        tpa: dst_ip,
    };
    m.put_hdr(&hdr).ok_or(NetError::NoBuffers)?;

    ethernet::tx(stack, m, ethernet::Type::ARP, dst_mac)
}

/// answers requests for our own address; everything else is dropped.
pub fn rx(stack: &NetStack, mut m: Box<MBuf>) {
    let hdr = match m.pull_hdr::<ArpHeader>() {
        Some(hdr) => hdr,
        None => return,
    };
    if !hdr.is_ethernet_ipv4() {
        trace!("arp_rx: not an ethernet/ipv4 arp packet");
        return;
    }

    match hdr.oper.try_into() {
        Ok(Operand::Request) if hdr.tpa == stack.config().ip => {
            debug!("arp_rx: who-has {} tell {}", Ipv4(hdr.tpa), Ipv4(hdr.spa));
            // a failed reply is not retried; the peer asks again
            let _ = tx(stack, Operand::Reply, &hdr.sha, hdr.spa);
        }
        Ok(_) => {}
        Err(msg) => trace!("arp_rx: {} {}", msg, hdr.oper),
    }
}
