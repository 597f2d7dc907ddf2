//! Segment arrival, following the event processing section of RFC 793.
//!
//! Every segment is processed with its connection's lock held from the first check to the
//! last, so segments of one connection never interleave.

use alloc::sync::Arc;

use log::{trace, warn};

use crate::net::NetStack;

use super::{
    data, output, seq_ge, seq_gt, seq_le, seq_lt,
    sock::{SockFlags, Tcb, TcpSock, TcpSockInner},
    Segment, TcpFlags, TcpHeader, TcpState,
};

/// whether a segment starting at `seq` with `len` bytes of text falls into the receive window.
/// A closed window still takes segments without text.
fn acceptable(tcb: &Tcb, seq: u32, len: u32) -> bool {
    let wnd = tcb.rcv_wnd as u32;
    if len > 0 && wnd == 0 {
        return false;
    }
    seq_ge(seq, tcb.rcv_nxt) && seq_le(seq, tcb.rcv_nxt.wrapping_add(wnd))
}

/// takes the peer's window from `hdr` unless an older segment is being looked at.
fn update_window(tcb: &mut Tcb, hdr: &TcpHeader) {
    if seq_lt(tcb.snd_wl1, hdr.seq) || (tcb.snd_wl1 == hdr.seq && seq_le(tcb.snd_wl2, hdr.ack_seq))
    {
        tcb.snd_wnd = hdr.window;
        tcb.snd_wl1 = hdr.seq;
        tcb.snd_wl2 = hdr.ack_seq;
    }
}

/// records the window the peer opens the connection with.
fn init_window(tcb: &mut Tcb, hdr: &TcpHeader) {
    tcb.snd_wnd = hdr.window;
    tcb.snd_wl1 = hdr.seq;
    tcb.snd_wl2 = hdr.ack_seq;
}

pub(super) fn process(stack: &NetStack, sock: &Arc<TcpSock>, seg: Segment) {
    let mut inner = sock.lock();
    match inner.state {
        TcpState::Close => trace!("tcp {}: segment for closed connection", inner.sport),
        TcpState::Listen => listen(stack, sock, &mut inner, &seg),
        TcpState::SynSent => syn_sent(stack, sock, &mut inner, &seg),
        _ => synchronized(stack, sock, &mut inner, seg),
    }
}

fn listen(stack: &NetStack, sock: &Arc<TcpSock>, inner: &mut TcpSockInner, seg: &Segment) {
    if seg.has(TcpFlags::RST) {
        return;
    }
    if seg.has(TcpFlags::ACK) {
        output::send_reply_reset(stack, seg);
        return;
    }
    if !seg.has(TcpFlags::SYN) {
        return;
    }

    match TcpSock::alloc_child(stack, sock, seg) {
        Ok(child) => inner.listen_queue.push_back(child),
        Err(err) => warn!("tcp {}: dropping syn: {}", inner.sport, err),
    }
}

fn syn_sent(stack: &NetStack, sock: &Arc<TcpSock>, inner: &mut TcpSockInner, seg: &Segment) {
    let ack = seg.hdr.ack_seq;
    if seg.has(TcpFlags::ACK) && (seq_le(ack, inner.tcb.iss) || seq_gt(ack, inner.tcb.snd_nxt)) {
        if !seg.has(TcpFlags::RST) {
            output::send_reply_reset(stack, seg);
        }
        return;
    }
    if seg.has(TcpFlags::RST) {
        // only a reset that acknowledges our SYN counts
        if seg.has(TcpFlags::ACK) {
            sock.done(stack, inner);
        }
        return;
    }
    if !seg.has(TcpFlags::SYN) {
        return;
    }

    inner.tcb.irs = seg.hdr.seq;
    inner.tcb.rcv_nxt = seg.hdr.seq.wrapping_add(1);
    if seg.has(TcpFlags::ACK) {
        inner.tcb.snd_una = ack;
    }

    if seq_gt(inner.tcb.snd_una, inner.tcb.iss) {
        // our SYN has been acked
        inner.set_state(TcpState::Established);
        init_window(&mut inner.tcb, &seg.hdr);
        output::send_ack(stack, inner);
        sock.wait_connect.notify_all(stack.kernel());
    } else {
        // simultaneous open
        inner.set_state(TcpState::SynReceived);
        inner.tcb.snd_una = inner.tcb.iss;
        output::send_synack(stack, inner, seg);
    }
}

/// completes a handshake in SYN_RECEIVED. Returns false if the segment must be dropped.
fn syn_received(
    stack: &NetStack,
    sock: &Arc<TcpSock>,
    inner: &mut TcpSockInner,
    seg: &Segment,
) -> bool {
    let ack = seg.hdr.ack_seq;
    if !(seq_le(inner.tcb.snd_una, ack) && seq_le(ack, inner.tcb.snd_nxt)) {
        output::send_reply_reset(stack, seg);
        return false;
    }

    match inner.parent.clone() {
        Some(weak) => {
            let parent = match weak.upgrade() {
                Some(parent) => parent,
                None => return false,
            };
            let mut pinner = parent.lock();
            if pinner.state != TcpState::Listen || pinner.accept_queue.len() >= pinner.backlog {
                trace!("tcp {}: accept queue full", pinner.sport);
                return false;
            }
            let pos = match pinner
                .listen_queue
                .iter()
                .position(|c| Arc::ptr_eq(&c.sock, sock))
            {
                Some(pos) => pos,
                None => return false,
            };
            if let Some(child) = pinner.listen_queue.remove(pos) {
                pinner.accept_queue.push_back(child);
            }
            parent.wait_accept.notify_all(stack.kernel());
        }
        None => sock.wait_connect.notify_all(stack.kernel()),
    }

    inner.tcb.snd_una = ack;
    init_window(&mut inner.tcb, &seg.hdr);
    inner.set_state(TcpState::Established);
    true
}

/// every state from SYN_RECEIVED on.
fn synchronized(stack: &NetStack, sock: &Arc<TcpSock>, inner: &mut TcpSockInner, seg: Segment) {
    // first check sequence number
    if !acceptable(&inner.tcb, seg.hdr.seq, seg.len()) {
        if !seg.has(TcpFlags::RST) {
            output::send_ack(stack, inner);
        }
        return;
    }

    // second check the RST bit
    if seg.has(TcpFlags::RST) {
        trace!("tcp {}: reset by peer in {:?}", inner.sport, inner.state);
        sock.done(stack, inner);
        return;
    }

    // fourth check the SYN bit; a SYN in the window is an error
    if seg.has(TcpFlags::SYN) {
        output::send_reset(stack, inner);
        sock.done(stack, inner);
        return;
    }

    // fifth check the ACK field
    if !seg.has(TcpFlags::ACK) {
        return;
    }
    if inner.state == TcpState::SynReceived && !syn_received(stack, sock, inner, &seg) {
        return;
    }
    match inner.state {
        TcpState::Established
        | TcpState::FinWait1
        | TcpState::FinWait2
        | TcpState::CloseWait
        | TcpState::Closing
        | TcpState::LastAck => {
            let ack = seg.hdr.ack_seq;
            if seq_gt(ack, inner.tcb.snd_nxt) {
                trace!("tcp {}: ack {} for unsent data", inner.sport, ack);
                return;
            }
            if seq_ge(ack, inner.tcb.snd_una) {
                update_window(&mut inner.tcb, &seg.hdr);
            }

            // duplicates move nothing
            let advanced = seq_gt(ack, inner.tcb.snd_una);
            if advanced {
                inner.tcb.snd_una = ack;
            }
            if advanced && inner.tcb.snd_una == inner.tcb.snd_nxt {
                // our FIN, if sent, is acked
                match inner.state {
                    TcpState::FinWait1 => inner.set_state(TcpState::FinWait2),
                    TcpState::Closing => {
                        sock.enter_time_wait(stack, inner);
                        return;
                    }
                    TcpState::LastAck => {
                        sock.done(stack, inner);
                        return;
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }

    // seventh, process the segment text
    let flags = seg.hdr.flags;
    let fin_seq = seg.m.end_seq;
    if matches!(
        inner.state,
        TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2
    ) && (seg.len() > 0 || flags.contains(TcpFlags::PSH))
    {
        data::queue(stack, sock, inner, seg.m);
    }

    // eighth, check the FIN bit
    if flags.contains(TcpFlags::FIN) && fin_seq == inner.tcb.rcv_nxt {
        inner.tcb.rcv_nxt = inner.tcb.rcv_nxt.wrapping_add(1);
        inner.flags.insert(SockFlags::FIN);
        output::send_ack(stack, inner);
        sock.wait_rcv.notify_all(stack.kernel());

        match inner.state {
            TcpState::SynReceived | TcpState::Established => {
                inner.set_state(TcpState::CloseWait)
            }
            TcpState::FinWait1 => {
                if inner.tcb.snd_una == inner.tcb.snd_nxt {
                    sock.enter_time_wait(stack, inner);
                } else {
                    inner.set_state(TcpState::Closing);
                }
            }
            TcpState::FinWait2 => sock.enter_time_wait(stack, inner),
            _ => {}
        }
    }
}
