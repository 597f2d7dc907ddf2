//! A fake kernel and a fake peer for the unit tests.

use alloc::{boxed::Box, collections::VecDeque, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::{sync::Mutex, thread};

use crate::{
    kernel::Kernel,
    mbuf::MBuf,
    net::{in_cksum, tcp::TcpHeader, Header, NetConfig, NetStack, TcpFlags},
    param::build_ip_addr,
};

pub const PEER_IP: u32 = build_ip_addr(10, 0, 2, 2);
pub const PEER_MAC: [u8; 6] = [0x52, 0x55, 0x0a, 0x00, 0x02, 0x02];

const ETH_LEN: usize = 14;
const IP_LEN: usize = 20;
const TCP_LEN: usize = 20;

/// Records every transmitted frame instead of putting it on a wire.
pub struct Loopback {
    ticks: AtomicU64,
    killed: AtomicBool,
    frames: Mutex<VecDeque<Box<MBuf>>>,
    fail: Mutex<Option<&'static str>>,
}

impl Loopback {
    pub fn new() -> Self {
        Self {
            ticks: AtomicU64::new(0),
            killed: AtomicBool::new(false),
            frames: Mutex::new(VecDeque::new()),
            fail: Mutex::new(None),
        }
    }

    pub fn advance(&self, ticks: u64) {
        self.ticks.fetch_add(ticks, Ordering::SeqCst);
    }

    pub fn set_ticks(&self, ticks: u64) {
        self.ticks.store(ticks, Ordering::SeqCst);
    }

    pub fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
    }

    /// makes every following transmit fail with `msg`.
    pub fn fail_transmit(&self, msg: &'static str) {
        *self.fail.lock().unwrap() = Some(msg);
    }

    pub fn pop_frame(&self) -> Option<Box<MBuf>> {
        self.frames.lock().unwrap().pop_front()
    }
}

impl Kernel for Loopback {
    fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }

    fn killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    fn sleep(&self, _chan: usize) {
        thread::yield_now();
    }

    fn wakeup(&self, _chan: usize) {}

    fn transmit(&self, m: Box<MBuf>) -> Result<(), &'static str> {
        if let Some(msg) = *self.fail.lock().unwrap() {
            return Err(msg);
        }
        self.frames.lock().unwrap().push_back(m);
        Ok(())
    }
}

pub fn stack() -> (Arc<NetStack>, Arc<Loopback>) {
    let lo = Arc::new(Loopback::new());
    let stack = NetStack::new(NetConfig::default(), lo.clone());
    (stack, lo)
}

fn frame(bytes: &[u8]) -> Box<MBuf> {
    let mut m = MBuf::alloc(0).unwrap();
    m.put(bytes.len()).unwrap().copy_from_slice(bytes);
    m
}

fn eth_header(b: &mut Vec<u8>, dst: &[u8; 6], typ: u16) {
    b.extend_from_slice(dst);
    b.extend_from_slice(&PEER_MAC);
    b.extend_from_slice(&typ.to_be_bytes());
}

fn ip_header(b: &mut Vec<u8>, dst: u32, proto: u8, payload: usize) {
    let start = b.len();
    b.extend_from_slice(&[0x45, 0]);
    b.extend_from_slice(&((IP_LEN + payload) as u16).to_be_bytes());
    b.extend_from_slice(&[0, 0, 0, 0, 64, proto, 0, 0]);
    b.extend_from_slice(&PEER_IP.to_be_bytes());
    b.extend_from_slice(&dst.to_be_bytes());
    let sum = in_cksum(&b[start..], 0);
    b[start + 10..start + 12].copy_from_slice(&sum.to_be_bytes());
}

/// an arp packet from the peer asking for `target`.
pub fn arp_request(target: u32, oper: u16) -> Box<MBuf> {
    let mut b = Vec::new();
    eth_header(&mut b, &[0xff; 6], 0x806);
    b.extend_from_slice(&1u16.to_be_bytes());
    b.extend_from_slice(&0x800u16.to_be_bytes());
    b.extend_from_slice(&[6, 4]);
    b.extend_from_slice(&oper.to_be_bytes());
    b.extend_from_slice(&PEER_MAC);
    b.extend_from_slice(&PEER_IP.to_be_bytes());
    b.extend_from_slice(&[0; 6]);
    b.extend_from_slice(&target.to_be_bytes());
    frame(&b)
}

/// a udp datagram from the peer's `sport` to the stack's `dport`.
pub fn udp_frame(stack: &NetStack, sport: u16, dport: u16, data: &[u8]) -> Box<MBuf> {
    let mut b = Vec::new();
    eth_header(&mut b, &stack.config().mac, 0x800);
    ip_header(&mut b, stack.config().ip, 17, 8 + data.len());
    b.extend_from_slice(&sport.to_be_bytes());
    b.extend_from_slice(&dport.to_be_bytes());
    b.extend_from_slice(&((8 + data.len()) as u16).to_be_bytes());
    b.extend_from_slice(&[0, 0]);
    b.extend_from_slice(data);
    frame(&b)
}

fn pseudo_sum(saddr: u32, daddr: u32, len: usize) -> u32 {
    (saddr >> 16) + (saddr & 0xffff) + (daddr >> 16) + (daddr & 0xffff) + 6 + len as u32
}

/// a tcp segment from the peer's `sport` to the stack's `dport`, with valid checksums.
pub fn tcp_frame(
    stack: &NetStack,
    sport: u16,
    dport: u16,
    seq: u32,
    ack_seq: u32,
    flags: TcpFlags,
    data: &[u8],
) -> Box<MBuf> {
    let hdr = TcpHeader {
        src_port: sport,
        dst_port: dport,
        seq,
        ack_seq,
        doff: 5,
        flags,
        window: 65535,
        checksum: 0,
        urgent: 0,
    };
    let mut seg = alloc::vec![0u8; TCP_LEN];
    hdr.encode(&mut seg);
    seg.extend_from_slice(data);
    let sum = in_cksum(&seg, pseudo_sum(PEER_IP, stack.config().ip, seg.len()));
    seg[16..18].copy_from_slice(&sum.to_be_bytes());

    let mut b = Vec::new();
    eth_header(&mut b, &stack.config().mac, 0x800);
    ip_header(&mut b, stack.config().ip, 6, seg.len());
    b.extend_from_slice(&seg);
    frame(&b)
}

/// A transmitted tcp segment, taken apart.
pub struct TcpSegmentInfo {
    pub hdr: TcpHeader,
    pub data: Vec<u8>,
    pub checksum_ok: bool,
}

/// takes the next transmitted frame apart; None if there is none or it is not tcp.
pub fn pop_tcp(lo: &Loopback) -> Option<TcpSegmentInfo> {
    let m = lo.pop_frame()?;
    let b = m.data();
    if b.len() < ETH_LEN + IP_LEN + TCP_LEN || b[ETH_LEN + 9] != 6 {
        return None;
    }
    let ip = &b[ETH_LEN..ETH_LEN + IP_LEN];
    let saddr = u32::from_be_bytes([ip[12], ip[13], ip[14], ip[15]]);
    let daddr = u32::from_be_bytes([ip[16], ip[17], ip[18], ip[19]]);
    let seg = &b[ETH_LEN + IP_LEN..];

    Some(TcpSegmentInfo {
        hdr: TcpHeader::decode(&seg[..TCP_LEN]),
        data: seg[TCP_LEN..].to_vec(),
        checksum_ok: in_cksum(seg, pseudo_sum(saddr, daddr, seg.len())) == 0,
    })
}

/// waits for another thread to transmit a tcp segment.
pub fn wait_tcp(lo: &Loopback) -> TcpSegmentInfo {
    loop {
        if let Some(seg) = pop_tcp(lo) {
            return seg;
        }
        thread::yield_now();
    }
}
