use alloc::{boxed::Box, collections::VecDeque};

use array_macro::array;
use log::{debug, trace};

use crate::{
    error::{NetError, Result},
    mbuf::MBuf,
    param::{MBUF_SIZE, UDP_CB_TABLE_SIZE},
    spinlock::{SpinLock, SpinLockGuard, WaitQueue},
};

use super::{
    ethernet,
    get_u16,
    ip::{self, IpHeader},
    port::{self, PortOwner},
    put_u16, Header, NetStack, SockAddr,
};

pub struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub len: u16,
    pub checksum: u16,
}

impl Header for UdpHeader {
    const SIZE: usize = 8;

    fn decode(b: &[u8]) -> Self {
        Self {
            src_port: get_u16(b, 0),
            dst_port: get_u16(b, 2),
            len: get_u16(b, 4),
            checksum: get_u16(b, 6),
        }
    }

    fn encode(&self, b: &mut [u8]) {
        put_u16(b, 0, self.src_port);
        put_u16(b, 2, self.dst_port);
        put_u16(b, 4, self.len);
        put_u16(b, 6, self.checksum);
    }
}

pub const HEADER_SIZE: usize = UdpHeader::SIZE;
const HEADROOM: usize = ethernet::HEADER_SIZE + ip::HEADER_SIZE + HEADER_SIZE;

#[derive(Clone, Copy)]
struct Meta {
    used: bool,
    port: u16,
    peer_addr: u32,
    peer_port: u16,
}

impl Meta {
    const fn new() -> Self {
        Self {
            used: false,
            port: 0,
            peer_addr: 0,
            peer_port: 0,
        }
    }
}

/// Addressing of every control block. Guarded by one lock so that port reservation and
/// delivery see a consistent table.
pub struct Metas {
    table: [Meta; UDP_CB_TABLE_SIZE],
}

impl Metas {
    pub fn port_in_use(&self, port: u16) -> bool {
        self.table.iter().any(|m| m.used && m.port == port)
    }

    pub fn set_port(&mut self, idx: usize, port: u16) -> Result<()> {
        match self.table.get_mut(idx) {
            Some(meta) if meta.used => {
                meta.port = port;
                Ok(())
            }
            _ => Err(NetError::InvalidArgument),
        }
    }

    /// a connected socket matching all three fields wins over one only bound to `port`.
    fn select(&self, src_addr: u32, port: u16, src_port: u16) -> Option<usize> {
        let exact = self.table.iter().position(|m| {
            m.used && m.port == port && m.peer_addr == src_addr && m.peer_port == src_port
        });
        exact.or_else(|| {
            self.table
                .iter()
                .position(|m| m.used && m.port == port && m.peer_port == 0)
        })
    }
}

struct Datagram {
    from: SockAddr,
    m: Box<MBuf>,
}

struct RxQueue {
    open: bool,
    q: VecDeque<Datagram>,
}

struct ControlBlock {
    rxq: SpinLock<RxQueue>,
    wait: WaitQueue,
}

impl ControlBlock {
    fn new() -> Self {
        Self {
            rxq: SpinLock::new(
                RxQueue {
                    open: false,
                    q: VecDeque::new(),
                },
                "udp_cb_rxq",
            ),
            wait: WaitQueue::new(),
        }
    }
}

pub struct Table {
    meta: SpinLock<Metas>,
    cbs: [ControlBlock; UDP_CB_TABLE_SIZE],
}

impl Table {
    pub fn new() -> Self {
        Self {
            meta: SpinLock::new(
                Metas {
                    table: array![_ => Meta::new(); UDP_CB_TABLE_SIZE],
                },
                "udp_table",
            ),
            cbs: array![_ => ControlBlock::new(); UDP_CB_TABLE_SIZE],
        }
    }

    pub(crate) fn metas(&self) -> SpinLockGuard<'_, Metas> {
        self.meta.lock()
    }

    fn cb(&self, idx: usize) -> Result<&ControlBlock> {
        self.cbs.get(idx).ok_or(NetError::InvalidArgument)
    }

    /// reserves a control block.
    pub fn open(&self) -> Result<usize> {
        let mut metas = self.meta.lock();
        let idx = metas
            .table
            .iter()
            .position(|m| !m.used)
            .ok_or(NetError::NoSockets)?;
        metas.table[idx] = Meta {
            used: true,
            ..Meta::new()
        };
        self.cbs[idx].rxq.lock().open = true;
        Ok(idx)
    }

    /// releases the control block and every datagram still queued on it.
    pub fn close(&self, stack: &NetStack, idx: usize) {
        let mut metas = self.meta.lock();
        let cb = match (metas.table.get_mut(idx), self.cbs.get(idx)) {
            (Some(meta), Some(cb)) if meta.used => {
                *meta = Meta::new();
                cb
            }
            _ => return,
        };
        let mut rxq = cb.rxq.lock();
        rxq.open = false;
        rxq.q.clear();
        cb.wait.notify_all(stack.kernel());
    }

    pub fn bind(&self, stack: &NetStack, idx: usize, port: u16) -> Result<()> {
        port::reserve_port(stack, port, PortOwner::Udp(idx))
    }

    /// records the peer and binds a free local port if there is none yet.
    pub fn connect(&self, stack: &NetStack, idx: usize, addr: &SockAddr) -> Result<()> {
        if addr.port == 0 {
            return Err(NetError::InvalidArgument);
        }
        let bound = {
            let metas = self.meta.lock();
            match metas.table.get(idx) {
                Some(meta) if meta.used => meta.port != 0,
                _ => return Err(NetError::InvalidArgument),
            }
        };
        if !bound {
            port::reserve_any_port(stack, PortOwner::Udp(idx))?;
        }

        let mut metas = self.meta.lock();
        match metas.table.get_mut(idx) {
            Some(meta) if meta.used => {
                meta.peer_addr = addr.addr;
                meta.peer_port = addr.port;
                Ok(())
            }
            _ => Err(NetError::InvalidArgument),
        }
    }

    #[cfg(test)]
    pub fn local_port(&self, idx: usize) -> Option<u16> {
        let metas = self.meta.lock();
        metas.table.get(idx).filter(|m| m.used).map(|m| m.port)
    }

    pub fn peer(&self, idx: usize) -> Option<SockAddr> {
        let metas = self.meta.lock();
        metas
            .table
            .get(idx)
            .filter(|m| m.used && m.peer_port != 0)
            .map(|m| SockAddr::inet(m.peer_addr, m.peer_port))
    }

    /// sends `data` as one datagram to the connected peer.
    pub fn send(&self, stack: &NetStack, idx: usize, data: &[u8]) -> Result<usize> {
        let meta = {
            let metas = self.meta.lock();
            match metas.table.get(idx) {
                Some(meta) if meta.used => *meta,
                _ => return Err(NetError::InvalidArgument),
            }
        };
        if meta.port == 0 || meta.peer_port == 0 {
            return Err(NetError::NotConnected);
        }
        if data.len() > MBUF_SIZE - HEADROOM {
            return Err(NetError::MessageTooLong);
        }

        let mut m = MBuf::alloc(HEADROOM)?;
        m.put(data.len())
            .ok_or(NetError::NoBuffers)?
            .copy_from_slice(data);
        let hdr = UdpHeader {
            src_port: meta.port,
            dst_port: meta.peer_port,
            len: (data.len() + HEADER_SIZE) as u16,
            checksum: 0, // zero means no checksum is provided
        };
        m.push_hdr(&hdr).ok_or(NetError::NoBuffers)?;

        ip::tx(stack, m, meta.peer_addr, ip::Protocol::UDP)?;
        Ok(data.len())
    }

    /// blocks until a datagram arrives, then copies as much of it as fits into `buf`.
    /// The rest of the datagram is discarded.
    pub fn read(&self, stack: &NetStack, idx: usize, buf: &mut [u8]) -> Result<(usize, SockAddr)> {
        let cb = self.cb(idx)?;
        let mut rxq = cb.rxq.lock();
        let dgram = loop {
            if !rxq.open {
                return Err(NetError::NotConnected);
            }
            if let Some(dgram) = rxq.q.pop_front() {
                break dgram;
            }
            rxq = cb.wait.wait(rxq, stack.kernel())?;
        };
        drop(rxq);

        let n = buf.len().min(dgram.m.len());
        buf[..n].copy_from_slice(&dgram.m.data()[..n]);
        Ok((n, dgram.from))
    }

    /// number of datagrams waiting on the control block.
    #[cfg(test)]
    pub fn pending(&self, idx: usize) -> usize {
        self.cbs.get(idx).map_or(0, |cb| cb.rxq.lock().q.len())
    }

    fn deliver(&self, stack: &NetStack, m: Box<MBuf>, from: SockAddr, port: u16) {
        let metas = self.meta.lock();
        let idx = match metas.select(from.addr, port, from.port) {
            Some(idx) => idx,
            None => {
                trace!("udp_rx: no socket on port {}", port);
                return;
            }
        };
        let cb = &self.cbs[idx];
        let mut rxq = cb.rxq.lock();
        drop(metas);
        rxq.q.push_back(Datagram { from, m });
        cb.wait.notify_all(stack.kernel());
    }
}

pub fn rx(stack: &NetStack, mut m: Box<MBuf>, ip_hdr: &IpHeader) {
    let len = m.len();
    let hdr = match m.pull_hdr::<UdpHeader>() {
        Some(hdr) => hdr,
        None => return,
    };
    if hdr.len as usize != len {
        debug!("udp_rx: length mismatch (udp {}, ip {})", hdr.len, len);
        return;
    }

    let from = SockAddr::inet(ip_hdr.src_ip_addr, hdr.src_port);
    stack.udp.deliver(stack, m, from, hdr.dst_port);
}
