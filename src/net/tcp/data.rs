use alloc::{boxed::Box, sync::Arc};

use crate::{
    error::{NetError, Result},
    mbuf::MBuf,
    net::NetStack,
    spinlock::SpinLockGuard,
};

use super::{
    output, seq_gt, seq_le,
    sock::{SockFlags, TcpSock, TcpSockInner},
    TcpFlags, TcpState,
};

/// moves every out-of-order segment that `rcv_nxt` has caught up with to the receive queue.
fn consume_ofo_queue(inner: &mut TcpSockInner) {
    while let Some(head) = inner.ofo_queue.peek() {
        let (seq, end_seq) = (head.seq, head.end_seq);
        if seq_le(end_seq, inner.tcb.rcv_nxt) {
            // fully received meanwhile
            inner.ofo_queue.dequeue();
            continue;
        }
        if seq_gt(seq, inner.tcb.rcv_nxt) {
            break;
        }

        let mut m = match inner.ofo_queue.dequeue() {
            Some(m) => m,
            None => break,
        };
        let overlap = inner.tcb.rcv_nxt.wrapping_sub(seq) as usize;
        m.pull(overlap);
        m.seq = inner.tcb.rcv_nxt;
        inner.tcb.rcv_nxt = end_seq;
        inner.rcv_queue.enqueue(m);
    }
}

/// takes the text of an acceptable segment. In-order data goes straight to the receive
/// queue, anything else waits in the out-of-order queue. Either way the peer gets an ack
/// naming the next byte we expect.
pub(super) fn queue(stack: &NetStack, sock: &TcpSock, inner: &mut TcpSockInner, m: Box<MBuf>) {
    if m.seq == inner.tcb.rcv_nxt {
        inner.tcb.rcv_nxt = m.end_seq;
        inner.rcv_queue.enqueue(m);
        consume_ofo_queue(inner);
        sock.wait_rcv.notify_all(stack.kernel());
    } else {
        inner.ofo_queue.insert(m);
    }
    output::send_ack(stack, inner);
}

/// copies received bytes into `buf`, across segment boundaries. A segment is released once
/// all of it was read; if it was pushed, the PSH flag is raised and the copy stops there.
pub(super) fn dequeue(inner: &mut TcpSockInner, buf: &mut [u8]) -> usize {
    let mut rlen = 0;
    while rlen < buf.len() {
        let m = match inner.rcv_queue.peek_mut() {
            Some(m) => m,
            None => break,
        };
        let n = (buf.len() - rlen).min(m.len());
        if let Some(data) = m.pull(n) {
            buf[rlen..rlen + n].copy_from_slice(data);
            rlen += n;
        }

        if m.is_empty() {
            let psh = m.tcp_flags.contains(TcpFlags::PSH);
            inner.rcv_queue.dequeue();
            if psh {
                inner.flags.insert(SockFlags::PSH);
                break;
            }
        }
    }
    rlen
}

/// the blocking half of `read`: returns at a push boundary, at end of stream, or once `buf`
/// is full.
pub(super) fn receive<'a>(
    sock: &'a Arc<TcpSock>,
    stack: &NetStack,
    mut inner: SpinLockGuard<'a, TcpSockInner>,
    buf: &mut [u8],
) -> Result<usize> {
    let mut rlen = 0;
    while rlen < buf.len() {
        rlen += dequeue(&mut inner, &mut buf[rlen..]);

        if inner.flags.contains(SockFlags::PSH) {
            inner.flags.remove(SockFlags::PSH);
            break;
        }
        if inner.flags.contains(SockFlags::FIN) || rlen == buf.len() {
            break;
        }
        if inner.state == TcpState::Close {
            if rlen == 0 {
                return Err(NetError::ConnectionReset);
            }
            break;
        }
        inner = sock.wait_rcv.wait(inner, stack.kernel())?;
    }
    Ok(rlen)
}
