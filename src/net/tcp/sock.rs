use alloc::{
    collections::VecDeque,
    sync::{Arc, Weak},
    vec::Vec,
};

use bitflags::bitflags;
use log::{debug, warn};

use crate::{
    error::{NetError, Result},
    mbuf::{MbufQueue, OfoQueue},
    net::{
        port::{self, PortOwner},
        NetStack, SockAddr,
    },
    param::{TCP_DEFAULT_WINDOW, TCP_MAX_BACKLOG, TCP_TIMEWAIT_TICKS},
    spinlock::{SpinLock, SpinLockGuard, WaitQueue},
    timer::TimerId,
};

use super::{data, output, registry::Endpoints, Segment, TcpState};

/// transmission control block
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Tcb {
    // send sequence variables
    pub snd_una: u32, // oldest unacknowledged sequence number
    pub snd_nxt: u32, // next sequence number to be sent
    pub snd_wnd: u16,
    pub snd_wl1: u32, // segment sequence number used for last window update
    pub snd_wl2: u32, // segment acknowledgment number used for last window update
    pub iss: u32,
    // receive sequence variables
    pub rcv_nxt: u32,
    pub rcv_wnd: u16,
    pub irs: u32,
}

bitflags! {
    pub(crate) struct SockFlags: u8 {
        /// a PSH-tagged segment was fully read; the pending read returns
        const PSH = 0x01;
        /// the peer's FIN was received
        const FIN = 0x02;
        /// torn down; nothing may touch the connection's queues again
        const DONE = 0x04;
    }
}

/// A passively opened connection sitting in its listener's listen or accept queue.
pub(crate) struct Child {
    pub sock: Arc<TcpSock>,
    pub endpoints: Endpoints,
}

pub(crate) struct TcpSockInner {
    pub state: TcpState,
    pub saddr: u32,
    pub sport: u16,
    pub daddr: u32,
    pub dport: u16,
    pub tcb: Tcb,
    pub flags: SockFlags,
    pub parent: Option<Weak<TcpSock>>,
    pub backlog: usize,
    pub listen_queue: VecDeque<Child>, // handshake in progress
    pub accept_queue: VecDeque<Child>, // handshake done, waiting for accept
    pub rcv_queue: MbufQueue,
    pub ofo_queue: OfoQueue,
    pub time_wait: Option<TimerId>,
}

impl TcpSockInner {
    fn new() -> Self {
        Self {
            state: TcpState::Close,
            saddr: 0,
            sport: 0,
            daddr: 0,
            dport: 0,
            tcb: Tcb {
                rcv_wnd: TCP_DEFAULT_WINDOW,
                ..Tcb::default()
            },
            flags: SockFlags::empty(),
            parent: None,
            backlog: 0,
            listen_queue: VecDeque::new(),
            accept_queue: VecDeque::new(),
            rcv_queue: MbufQueue::new(),
            ofo_queue: OfoQueue::new(),
            time_wait: None,
        }
    }

    pub fn endpoints(&self) -> Endpoints {
        Endpoints {
            saddr: self.saddr,
            sport: self.sport,
            daddr: self.daddr,
            dport: self.dport,
        }
    }

    pub fn set_state(&mut self, state: TcpState) {
        debug!(
            "tcp {}:{}: {:?} -> {:?}",
            self.sport, self.dport, self.state, state
        );
        self.state = state;
    }
}

/// A TCP connection object.
///
/// All mutable state sits behind one spinlock. Blocked callers wait on one of the three
/// queues; every transition that could satisfy them notifies the matching queue.
pub struct TcpSock {
    inner: SpinLock<TcpSockInner>,
    pub(crate) wait_connect: WaitQueue,
    pub(crate) wait_accept: WaitQueue,
    pub(crate) wait_rcv: WaitQueue,
}

impl TcpSock {
    pub(crate) fn new() -> Self {
        Self::with_inner(TcpSockInner::new())
    }

    fn with_inner(inner: TcpSockInner) -> Self {
        Self {
            inner: SpinLock::new(inner, "tcp_sock"),
            wait_connect: WaitQueue::new(),
            wait_accept: WaitQueue::new(),
            wait_rcv: WaitQueue::new(),
        }
    }

    pub(crate) fn lock(&self) -> SpinLockGuard<'_, TcpSockInner> {
        self.inner.lock()
    }

    #[cfg(test)]
    pub fn state(&self) -> TcpState {
        self.lock().state
    }

    /// allocates a closed connection and registers it.
    pub(crate) fn alloc(stack: &NetStack) -> Result<Arc<Self>> {
        stack.tcp.charge()?;
        let sock = Arc::new(Self::new());
        stack.tcp.register(&sock, Endpoints::default(), false);
        Ok(sock)
    }

    /// allocates the connection a SYN to a listener asks for and answers the SYN. The caller
    /// queues it on the listener.
    pub(crate) fn alloc_child(
        stack: &NetStack,
        parent: &Arc<Self>,
        seg: &Segment,
    ) -> Result<Child> {
        stack.tcp.charge()?;
        let mut inner = TcpSockInner::new();
        inner.state = TcpState::SynReceived;
        inner.saddr = seg.daddr;
        inner.sport = seg.hdr.dst_port;
        inner.daddr = seg.saddr;
        inner.dport = seg.hdr.src_port;
        inner.parent = Some(Arc::downgrade(parent));

        inner.tcb.irs = seg.hdr.seq;
        inner.tcb.iss = stack.alloc_iss();
        inner.tcb.rcv_nxt = seg.hdr.seq.wrapping_add(1);
        output::send_synack(stack, &mut inner, seg);
        inner.tcb.snd_nxt = inner.tcb.iss.wrapping_add(1);
        inner.tcb.snd_una = inner.tcb.iss;

        let endpoints = inner.endpoints();
        Ok(Child {
            sock: Arc::new(Self::with_inner(inner)),
            endpoints,
        })
    }

    /// a child of this listener talking to `daddr:dport`.
    pub(crate) fn find_child(&self, daddr: u32, dport: u16) -> Option<Arc<Self>> {
        let inner = self.lock();
        inner
            .listen_queue
            .iter()
            .chain(inner.accept_queue.iter())
            .find(|c| c.endpoints.daddr == daddr && c.endpoints.dport == dport)
            .map(|c| c.sock.clone())
    }

    /// tears the connection down: it moves to CLOSE, drops its queued data, leaves the
    /// registry and its parent's queues, and wakes every waiter. Runs once per connection.
    pub(crate) fn done(self: &Arc<Self>, stack: &NetStack, inner: &mut TcpSockInner) {
        if inner.flags.contains(SockFlags::DONE) {
            return;
        }
        inner.flags.insert(SockFlags::DONE);
        inner.set_state(TcpState::Close);
        inner.rcv_queue.clear();
        inner.ofo_queue.clear();
        if let Some(id) = inner.time_wait.take() {
            stack.timers.cancel(id);
        }

        if let Some(parent) = inner.parent.take().and_then(|p| p.upgrade()) {
            let mut pinner = parent.lock();
            pinner.listen_queue.retain(|c| !Arc::ptr_eq(&c.sock, self));
            pinner.accept_queue.retain(|c| !Arc::ptr_eq(&c.sock, self));
        }
        stack.tcp.unregister(self);

        let kernel = stack.kernel();
        self.wait_connect.notify_all(kernel);
        self.wait_accept.notify_all(kernel);
        self.wait_rcv.notify_all(kernel);
        stack.tcp.uncharge();
    }

    /// moves to TIME_WAIT and schedules the final teardown.
    pub(crate) fn enter_time_wait(self: &Arc<Self>, stack: &NetStack, inner: &mut TcpSockInner) {
        inner.set_state(TcpState::TimeWait);
        let sock = self.clone();
        let now = stack.kernel().ticks();
        inner.time_wait = stack.timers.add(now, TCP_TIMEWAIT_TICKS, move |stack| {
            let mut inner = sock.lock();
            if inner.state == TcpState::TimeWait {
                sock.done(stack, &mut inner);
            }
        });
        if inner.time_wait.is_none() {
            warn!("tcp: cannot schedule time-wait timer, closing now");
            self.done(stack, inner);
        }
    }

    pub(crate) fn bind(self: &Arc<Self>, stack: &NetStack, port: u16) -> Result<()> {
        let mut inner = self.lock();
        if inner.sport != 0 || inner.state != TcpState::Close {
            return Err(NetError::InvalidArgument);
        }
        port::reserve_port(stack, port, PortOwner::Tcp(self))?;
        inner.sport = port;
        Ok(())
    }

    pub(crate) fn listen(self: &Arc<Self>, stack: &NetStack, backlog: usize) -> Result<()> {
        if backlog > TCP_MAX_BACKLOG {
            return Err(NetError::BacklogFull);
        }
        let mut inner = self.lock();
        if inner.state != TcpState::Close || inner.sport == 0 {
            return Err(NetError::InvalidState);
        }
        inner.set_state(TcpState::Listen);
        inner.backlog = backlog;
        stack.tcp.update(self, inner.endpoints(), true);
        Ok(())
    }

    /// sends a SYN to `addr` and blocks until the handshake completes or fails.
    pub(crate) fn connect(self: &Arc<Self>, stack: &NetStack, addr: &SockAddr) -> Result<()> {
        let mut inner = self.lock();
        if inner.state != TcpState::Close || inner.flags.contains(SockFlags::DONE) {
            return Err(NetError::InvalidState);
        }
        if inner.sport == 0 {
            inner.sport = port::reserve_any_port(stack, PortOwner::Tcp(self))?;
        }
        inner.saddr = stack.config().ip;
        inner.daddr = addr.addr;
        inner.dport = addr.port;

        // three-way handshake starts, send the first SYN
        inner.set_state(TcpState::SynSent);
        inner.tcb.iss = stack.alloc_iss();
        inner.tcb.snd_una = inner.tcb.iss;
        inner.tcb.snd_nxt = inner.tcb.iss.wrapping_add(1);
        stack.tcp.update(self, inner.endpoints(), false);
        output::send_syn(stack, &mut inner);

        while matches!(inner.state, TcpState::SynSent | TcpState::SynReceived) {
            inner = self.wait_connect.wait(inner, stack.kernel())?;
        }
        if inner.state == TcpState::Close {
            return Err(NetError::ConnectionRefused);
        }
        debug!("tcp {}: connected to port {}", inner.sport, inner.dport);
        Ok(())
    }

    /// blocks until a connection completes its handshake and hands it out with its peer.
    pub(crate) fn accept(self: &Arc<Self>, stack: &NetStack) -> Result<(Arc<Self>, SockAddr)> {
        let mut inner = self.lock();
        loop {
            if inner.state != TcpState::Listen {
                return Err(NetError::InvalidState);
            }
            if let Some(child) = inner.accept_queue.pop_front() {
                // registered while our lock is held, so `Registry::lookup` never misses it
                stack.tcp.register(&child.sock, child.endpoints, false);
                let peer = SockAddr::inet(child.endpoints.daddr, child.endpoints.dport);
                return Ok((child.sock, peer));
            }
            inner = self.wait_accept.wait(inner, stack.kernel())?;
        }
    }

    pub(crate) fn read(self: &Arc<Self>, stack: &NetStack, buf: &mut [u8]) -> Result<usize> {
        let inner = self.lock();
        match inner.state {
            TcpState::Established
            | TcpState::FinWait1
            | TcpState::FinWait2
            | TcpState::CloseWait => data::receive(self, stack, inner, buf),
            _ => Err(NetError::NotConnected),
        }
    }

    pub(crate) fn write(self: &Arc<Self>, stack: &NetStack, data: &[u8]) -> Result<usize> {
        let mut inner = self.lock();
        match inner.state {
            TcpState::Established | TcpState::CloseWait => output::send(stack, &mut inner, data),
            _ => Err(NetError::NotConnected),
        }
    }

    pub(crate) fn close(self: &Arc<Self>, stack: &NetStack) {
        let mut inner = self.lock();
        match inner.state {
            TcpState::Close | TcpState::SynSent | TcpState::SynReceived => {
                self.done(stack, &mut inner)
            }
            TcpState::Listen => {
                let mut children: Vec<Child> = inner.listen_queue.drain(..).collect();
                children.extend(inner.accept_queue.drain(..));
                self.done(stack, &mut inner);
                drop(inner);
                for child in children {
                    let mut cinner = child.sock.lock();
                    child.sock.done(stack, &mut cinner);
                }
            }
            TcpState::Established => {
                inner.set_state(TcpState::FinWait1);
                output::send_fin(stack, &mut inner);
            }
            TcpState::CloseWait => {
                inner.set_state(TcpState::LastAck);
                output::send_fin(stack, &mut inner);
            }
            _ => {}
        }
    }

    pub(crate) fn peer(&self) -> Option<SockAddr> {
        let inner = self.lock();
        if inner.dport == 0 {
            return None;
        }
        Some(SockAddr::inet(inner.daddr, inner.dport))
    }
}
