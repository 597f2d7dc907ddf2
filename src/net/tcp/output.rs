use alloc::boxed::Box;

use log::trace;

use crate::{
    error::{NetError, Result},
    mbuf::MBuf,
    net::{checksum::tcp_checksum, ip, put_u16, NetStack},
    param::{MBUF_DEFAULT_HEADROOM, TCP_DEFAULT_MSS},
};

use super::{
    registry::Endpoints, sock::TcpSockInner, Segment, TcpFlags, TcpHeader, TcpState, MIN_DATA_OFF,
};

/// prepends a header to `m`, checksums the segment and hands it to ip.
fn transmit_raw(
    stack: &NetStack,
    ep: &Endpoints,
    mut m: Box<MBuf>,
    flags: TcpFlags,
    seq: u32,
    ack_seq: u32,
    window: u16,
) -> Result<()> {
    let hdr = TcpHeader {
        src_port: ep.sport,
        dst_port: ep.dport,
        seq,
        ack_seq,
        doff: MIN_DATA_OFF,
        flags,
        window,
        checksum: 0,
        urgent: 0,
    };
    m.push_hdr(&hdr).ok_or(NetError::NoBuffers)?;
    let sum = tcp_checksum(ep.saddr, ep.daddr, m.data());
    put_u16(m.data_mut(), 16, sum);

    ip::tx(stack, m, ep.daddr, ip::Protocol::TCP)
}

/// the acknowledgment number is always `rcv_nxt` and the window `rcv_wnd`.
fn transmit(
    stack: &NetStack,
    inner: &TcpSockInner,
    m: Box<MBuf>,
    flags: TcpFlags,
    seq: u32,
) -> Result<()> {
    transmit_raw(
        stack,
        &inner.endpoints(),
        m,
        flags,
        seq,
        inner.tcb.rcv_nxt,
        inner.tcb.rcv_wnd,
    )
}

/// sends a segment without data. Control segments are not retransmitted, so a failure is
/// only logged.
fn send_ctl(stack: &NetStack, inner: &TcpSockInner, flags: TcpFlags, seq: u32) {
    let res = MBuf::alloc(MBUF_DEFAULT_HEADROOM)
        .and_then(|m| transmit(stack, inner, m, flags, seq));
    if let Err(err) = res {
        trace!("tcp {}: cannot send {:?}: {}", inner.sport, flags, err);
    }
}

pub(super) fn send_syn(stack: &NetStack, inner: &mut TcpSockInner) {
    if inner.state == TcpState::Close {
        return;
    }
    send_ctl(stack, inner, TcpFlags::SYN, inner.tcb.iss);
}

/// answers the SYN in `seg` with our own.
pub(super) fn send_synack(stack: &NetStack, inner: &mut TcpSockInner, seg: &Segment) {
    if seg.has(TcpFlags::RST) {
        return;
    }
    send_ctl(stack, inner, TcpFlags::SYN | TcpFlags::ACK, inner.tcb.iss);
}

pub(super) fn send_ack(stack: &NetStack, inner: &mut TcpSockInner) {
    if inner.state == TcpState::Close {
        return;
    }
    send_ctl(stack, inner, TcpFlags::ACK, inner.tcb.snd_nxt);
}

/// sends our FIN; it occupies one sequence number.
pub(super) fn send_fin(stack: &NetStack, inner: &mut TcpSockInner) {
    if inner.state == TcpState::Close {
        return;
    }
    send_ctl(stack, inner, TcpFlags::FIN | TcpFlags::ACK, inner.tcb.snd_nxt);
    inner.tcb.snd_nxt = inner.tcb.snd_nxt.wrapping_add(1);
}

/// resets the connection's peer. Like FIN, RST occupies a sequence number; nothing that was
/// sent is waiting for an ack any more.
pub(super) fn send_reset(stack: &NetStack, inner: &mut TcpSockInner) {
    send_ctl(stack, inner, TcpFlags::RST, inner.tcb.snd_nxt);
    inner.tcb.snd_nxt = inner.tcb.snd_nxt.wrapping_add(1);
    inner.tcb.snd_una = inner.tcb.snd_nxt;
}

/// resets the sender of `seg`, which has no usable connection on this side.
pub(super) fn send_reply_reset(stack: &NetStack, seg: &Segment) {
    let ep = Endpoints {
        saddr: seg.daddr,
        sport: seg.hdr.dst_port,
        daddr: seg.saddr,
        dport: seg.hdr.src_port,
    };
    let res = MBuf::alloc(MBUF_DEFAULT_HEADROOM)
        .and_then(|m| transmit_raw(stack, &ep, m, TcpFlags::RST, seg.hdr.ack_seq, 0, 0));
    if let Err(err) = res {
        trace!("tcp {}: cannot send reset: {}", ep.sport, err);
    }
}

fn data_segment(chunk: &[u8]) -> Result<Box<MBuf>> {
    let mut m = MBuf::alloc(MBUF_DEFAULT_HEADROOM)?;
    m.put(chunk.len())
        .ok_or(NetError::NoBuffers)?
        .copy_from_slice(chunk);
    Ok(m)
}

/// sends `data` in segments of at most one MSS; the last one carries PSH.
///
/// Returns how many bytes went out. Running out of buffers part way returns the count so
/// far, or the error if nothing was sent.
pub(super) fn send(stack: &NetStack, inner: &mut TcpSockInner, data: &[u8]) -> Result<usize> {
    let mut sent = 0;
    for chunk in data.chunks(TCP_DEFAULT_MSS) {
        let flags = if sent + chunk.len() == data.len() {
            TcpFlags::ACK | TcpFlags::PSH
        } else {
            TcpFlags::ACK
        };

        let seq = inner.tcb.snd_nxt;
        let res = match data_segment(chunk) {
            Ok(m) => transmit(stack, inner, m, flags, seq),
            Err(err) => Err(err),
        };
        match res {
            Ok(()) => {
                inner.tcb.snd_nxt = inner.tcb.snd_nxt.wrapping_add(chunk.len() as u32);
                sent += chunk.len();
            }
            Err(err) if sent == 0 => return Err(err),
            Err(_) => break,
        }
    }
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::tcp::sock::TcpSock;
    use crate::testutil::{self, PEER_IP};
    use alloc::vec;

    fn established(stack: &NetStack) -> alloc::sync::Arc<TcpSock> {
        let sock = TcpSock::alloc(stack).unwrap();
        {
            let mut inner = sock.lock();
            inner.state = TcpState::Established;
            inner.saddr = stack.config().ip;
            inner.sport = 2000;
            inner.daddr = PEER_IP;
            inner.dport = 80;
            inner.tcb.snd_una = 100;
            inner.tcb.snd_nxt = 100;
            inner.tcb.rcv_nxt = 7000;
        }
        sock
    }

    #[test]
    fn send_segments_by_mss() {
        let (stack, lo) = testutil::stack();
        let sock = established(&stack);
        let data = vec![0x5a; TCP_DEFAULT_MSS + 1];

        assert_eq!(Ok(537), send(&stack, &mut sock.lock(), &data));

        let first = testutil::pop_tcp(&lo).unwrap();
        assert_eq!(TCP_DEFAULT_MSS, first.data.len());
        assert_eq!(TcpFlags::ACK, first.hdr.flags);
        assert_eq!(100, first.hdr.seq);
        assert_eq!(7000, first.hdr.ack_seq);

        let second = testutil::pop_tcp(&lo).unwrap();
        assert_eq!(1, second.data.len());
        assert_eq!(TcpFlags::ACK | TcpFlags::PSH, second.hdr.flags);
        assert_eq!(100 + TCP_DEFAULT_MSS as u32, second.hdr.seq);

        assert!(lo.pop_frame().is_none());
        assert_eq!(100 + 537, sock.lock().tcb.snd_nxt);
    }

    #[test]
    fn send_nothing() {
        let (stack, lo) = testutil::stack();
        let sock = established(&stack);
        assert_eq!(Ok(0), send(&stack, &mut sock.lock(), b""));
        assert!(lo.pop_frame().is_none());
    }

    #[test]
    fn send_reports_device_failure() {
        let (stack, lo) = testutil::stack();
        let sock = established(&stack);
        lo.fail_transmit("ring full");
        assert_eq!(
            Err(NetError::Transmit("ring full")),
            send(&stack, &mut sock.lock(), b"abc")
        );
        assert_eq!(100, sock.lock().tcb.snd_nxt);
    }

    #[test]
    fn fin_consumes_a_sequence_number() {
        let (stack, lo) = testutil::stack();
        let sock = established(&stack);
        send_fin(&stack, &mut sock.lock());
        let fin = testutil::pop_tcp(&lo).unwrap();
        assert_eq!(TcpFlags::FIN | TcpFlags::ACK, fin.hdr.flags);
        assert_eq!(100, fin.hdr.seq);
        assert_eq!(101, sock.lock().tcb.snd_nxt);
    }

    #[test]
    fn segments_carry_valid_checksums() {
        let (stack, lo) = testutil::stack();
        let sock = established(&stack);
        send(&stack, &mut sock.lock(), b"hello").unwrap();
        let seg = testutil::pop_tcp(&lo).unwrap();
        assert!(seg.checksum_ok);
        assert_eq!(b"hello", &seg.data[..]);
    }

    #[test]
    fn closed_connections_send_no_ack() {
        let (stack, lo) = testutil::stack();
        let sock = established(&stack);
        sock.lock().state = TcpState::Close;
        send_ack(&stack, &mut sock.lock());
        send_fin(&stack, &mut sock.lock());
        assert!(lo.pop_frame().is_none());
    }

    #[test]
    fn reset_acknowledges_everything() {
        let (stack, lo) = testutil::stack();
        let sock = established(&stack);
        sock.lock().tcb.snd_nxt = 150;
        send_reset(&stack, &mut sock.lock());
        let rst = testutil::pop_tcp(&lo).unwrap();
        assert_eq!(TcpFlags::RST, rst.hdr.flags);
        assert_eq!(150, rst.hdr.seq);
        let tcb = sock.lock().tcb;
        assert_eq!(151, tcb.snd_nxt);
        assert_eq!(151, tcb.snd_una);
    }
}
