//! The socket layer the file descriptor table talks to.
//!
//! A `Socket` is a wrapper around either a TCP connection or a UDP control block. Like an open
//! file, it is owned by whoever holds the descriptor and closes itself when dropped.

use alloc::sync::Arc;
use core::convert::TryFrom;

use log::debug;

use crate::error::{NetError, Result};

use super::{tcp::TcpSock, NetStack, SAFamily, SockAddr, SocketType};

enum SocketInner {
    Tcp(Arc<TcpSock>),
    Udp(usize),
}

pub struct Socket {
    stack: Arc<NetStack>,
    inner: Option<SocketInner>,
}

impl Socket {
    /// `socket(domain, type)`: only INET stream and datagram sockets exist.
    pub fn new(stack: Arc<NetStack>, domain: u16, typ: u8) -> Result<Self> {
        match SAFamily::try_from(domain) {
            Ok(SAFamily::INET) => {}
            _ => return Err(NetError::UnsupportedFamily),
        }
        let inner = match SocketType::try_from(typ).map_err(|_| NetError::UnsupportedType)? {
            SocketType::Stream => SocketInner::Tcp(TcpSock::alloc(&stack)?),
            SocketType::Datagram => SocketInner::Udp(stack.udp.open()?),
        };
        Ok(Self {
            stack,
            inner: Some(inner),
        })
    }

    fn inner(&self) -> Result<&SocketInner> {
        self.inner.as_ref().ok_or(NetError::NotConnected)
    }

    /// binds the local port; the address part is ignored as the stack has one address.
    pub fn bind(&self, addr: &SockAddr) -> Result<()> {
        match self.inner()? {
            SocketInner::Tcp(sock) => sock.bind(&self.stack, addr.port),
            SocketInner::Udp(idx) => self.stack.udp.bind(&self.stack, *idx, addr.port),
        }
    }

    pub fn listen(&self, backlog: usize) -> Result<()> {
        match self.inner()? {
            SocketInner::Tcp(sock) => sock.listen(&self.stack, backlog),
            SocketInner::Udp(_) => Err(NetError::UnsupportedType),
        }
    }

    /// for TCP, blocks until the handshake is done. For UDP, only records the peer.
    pub fn connect(&self, addr: &SockAddr) -> Result<()> {
        if addr.family != SAFamily::INET {
            return Err(NetError::UnsupportedFamily);
        }
        match self.inner()? {
            SocketInner::Tcp(sock) => sock.connect(&self.stack, addr),
            SocketInner::Udp(idx) => self.stack.udp.connect(&self.stack, *idx, addr),
        }
    }

    pub fn accept(&self) -> Result<(Socket, SockAddr)> {
        match self.inner()? {
            SocketInner::Tcp(sock) => {
                let (child, peer) = sock.accept(&self.stack)?;
                let conn = Socket {
                    stack: self.stack.clone(),
                    inner: Some(SocketInner::Tcp(child)),
                };
                Ok((conn, peer))
            }
            SocketInner::Udp(_) => Err(NetError::UnsupportedType),
        }
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        match self.inner()? {
            SocketInner::Tcp(sock) => sock.read(&self.stack, buf),
            SocketInner::Udp(idx) => self
                .stack
                .udp
                .read(&self.stack, *idx, buf)
                .map(|(n, _)| n),
        }
    }

    /// like `read`, but also tells where a datagram came from.
    pub fn read_from(&self, buf: &mut [u8]) -> Result<(usize, SockAddr)> {
        match self.inner()? {
            SocketInner::Tcp(sock) => {
                let peer = sock.peer().ok_or(NetError::NotConnected)?;
                sock.read(&self.stack, buf).map(|n| (n, peer))
            }
            SocketInner::Udp(idx) => self.stack.udp.read(&self.stack, *idx, buf),
        }
    }

    pub fn write(&self, data: &[u8]) -> Result<usize> {
        match self.inner()? {
            SocketInner::Tcp(sock) => sock.write(&self.stack, data),
            SocketInner::Udp(idx) => self.stack.udp.send(&self.stack, *idx, data),
        }
    }

    pub fn peer_addr(&self) -> Option<SockAddr> {
        match self.inner.as_ref()? {
            SocketInner::Tcp(sock) => sock.peer(),
            SocketInner::Udp(idx) => self.stack.udp.peer(*idx),
        }
    }

    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        match self.inner.take() {
            Some(SocketInner::Tcp(sock)) => sock.close(&self.stack),
            Some(SocketInner::Udp(idx)) => self.stack.udp.close(&self.stack, idx),
            None => {}
        }
        debug!("socket closed");
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        if self.inner.is_some() {
            self.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        net::TcpState,
        param::TCP_TIMEWAIT_TICKS,
        testutil::{self, Loopback},
    };
    use core::sync::atomic::{AtomicBool, Ordering};
    use std::thread::{self, JoinHandle};

    const INET: u16 = SAFamily::INET as u16;
    const STREAM: u8 = SocketType::Stream as u8;
    const DGRAM: u8 = SocketType::Datagram as u8;

    /// feeds every transmitted frame back into the stack, so it talks to itself.
    struct Pump {
        stop: Arc<AtomicBool>,
        handle: JoinHandle<()>,
    }

    impl Pump {
        fn start(stack: &Arc<NetStack>, lo: &Arc<Loopback>) -> Self {
            let stop = Arc::new(AtomicBool::new(false));
            let handle = {
                let (stack, lo, stop) = (stack.clone(), lo.clone(), stop.clone());
                thread::spawn(move || loop {
                    match lo.pop_frame() {
                        Some(m) => stack.rx(m),
                        None if stop.load(Ordering::SeqCst) => break,
                        None => thread::yield_now(),
                    }
                })
            };
            Self { stop, handle }
        }

        fn stop(self) {
            self.stop.store(true, Ordering::SeqCst);
            self.handle.join().unwrap();
        }
    }

    fn wait_until(cond: impl Fn() -> bool) {
        while !cond() {
            thread::yield_now();
        }
    }

    #[test]
    fn rejects_unknown_family_and_type() {
        let (stack, _lo) = testutil::stack();
        assert_eq!(
            Some(NetError::UnsupportedFamily),
            Socket::new(stack.clone(), SAFamily::LOCAL as u16, STREAM).err()
        );
        assert_eq!(
            Some(NetError::UnsupportedType),
            Socket::new(stack.clone(), INET, 3).err()
        );
    }

    #[test]
    fn stream_operations_on_datagram_socket_fail() {
        let (stack, _lo) = testutil::stack();
        let sock = Socket::new(stack, INET, DGRAM).unwrap();
        assert_eq!(Err(NetError::UnsupportedType), sock.listen(1));
        assert_eq!(Some(NetError::UnsupportedType), sock.accept().err());
    }

    #[test]
    fn drop_releases_resources() {
        let (stack, _lo) = testutil::stack();
        {
            let tcp = Socket::new(stack.clone(), INET, STREAM).unwrap();
            tcp.bind(&SockAddr::inet(0, 80)).unwrap();
            let udp = Socket::new(stack.clone(), INET, DGRAM).unwrap();
            udp.bind(&SockAddr::inet(0, 81)).unwrap();
            assert_eq!(1, stack.tcp.live());
        }
        assert_eq!(0, stack.tcp.live());

        // both ports are free again
        let tcp = Socket::new(stack.clone(), INET, STREAM).unwrap();
        tcp.bind(&SockAddr::inet(0, 81)).unwrap();
        let udp = Socket::new(stack.clone(), INET, DGRAM).unwrap();
        udp.bind(&SockAddr::inet(0, 80)).unwrap();
    }

    #[test]
    fn udp_talks_to_itself() {
        let (stack, lo) = testutil::stack();
        let server = Socket::new(stack.clone(), INET, DGRAM).unwrap();
        server.bind(&SockAddr::inet(0, 2000)).unwrap();
        let client = Socket::new(stack.clone(), INET, DGRAM).unwrap();
        client
            .connect(&SockAddr::inet(stack.config().ip, 2000))
            .unwrap();

        assert_eq!(Ok(5), client.write(b"hello"));
        stack.rx(lo.pop_frame().unwrap());

        let mut buf = [0u8; 16];
        let (n, from) = server.read_from(&mut buf).unwrap();
        assert_eq!(b"hello", &buf[..n]);
        assert_eq!(stack.config().ip, from.addr);
        assert_eq!(stack.udp.local_port(1), Some(from.port));
        assert!(server.peer_addr().is_none());
    }

    #[test]
    fn tcp_talks_to_itself() {
        let (stack, lo) = testutil::stack();
        let pump = Pump::start(&stack, &lo);

        let server = Socket::new(stack.clone(), INET, STREAM).unwrap();
        server.bind(&SockAddr::inet(0, 80)).unwrap();
        server.listen(1).unwrap();

        let client = Socket::new(stack.clone(), INET, STREAM).unwrap();
        client.connect(&SockAddr::inet(stack.config().ip, 80)).unwrap();
        let (conn, peer) = server.accept().unwrap();
        assert_eq!(stack.config().ip, peer.addr);
        assert_eq!(Some(SockAddr::inet(stack.config().ip, 80)), client.peer_addr());

        let mut buf = [0u8; 16];
        assert_eq!(Ok(5), client.write(b"hello"));
        assert_eq!(Ok(5), conn.read(&mut buf));
        assert_eq!(b"hello", &buf[..5]);
        assert_eq!(Ok(5), conn.write(b"world"));
        assert_eq!(Ok(5), client.read(&mut buf));
        assert_eq!(b"world", &buf[..5]);

        // client closes first and ends up in TIME_WAIT
        let client_sock = match client.inner {
            Some(SocketInner::Tcp(ref sock)) => sock.clone(),
            _ => unreachable!(),
        };
        client.close();
        assert_eq!(Ok(0), conn.read(&mut buf));
        conn.close();
        wait_until(|| client_sock.state() == TcpState::TimeWait && stack.tcp.live() == 2);

        pump.stop();
        lo.advance(TCP_TIMEWAIT_TICKS);
        stack.tick();
        assert_eq!(TcpState::Close, client_sock.state());
        assert_eq!(1, stack.tcp.live());
        drop(server);
        assert_eq!(0, stack.tcp.live());
    }
}
