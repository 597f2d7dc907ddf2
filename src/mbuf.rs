//! packet buffer management
//!
//! The four operations below move the edges of the populated region:
//!
//! ```text
//!            <- push            <- trim
//!             -> pull            -> put
//! [-headroom-][------buffer------][-tailroom-]
//! |----------------MBUF_SIZE-----------------|
//! ```
//!
//! Each of them fails without touching the mbuf if the edge would leave `[0, MBUF_SIZE]`.
//! An mbuf is owned by exactly one place at a time (a driver ring slot, a socket queue or the
//! function handling it), so there is no reference count; dropping the `Box` frees it.

use alloc::{alloc::Layout, boxed::Box, collections::VecDeque};

use crate::{
    error::{NetError, Result},
    net::{
        tcp::{seq_ge, seq_gt, seq_lt, TcpFlags},
        Header,
    },
    param::MBUF_SIZE,
};

#[repr(C, align(8))]
pub struct MBuf {
    head: usize,
    len: usize,
    // set once the mbuf carries a tcp segment
    pub seq: u32,     // first sequence number of the segment's data
    pub end_seq: u32, // one past the last sequence number of the data
    pub tcp_flags: TcpFlags,
    // buffer
    buf: [u8; MBUF_SIZE],
}

impl MBuf {
    /// allocates an empty mbuf whose data starts `headroom` bytes into the buffer.
    pub fn alloc(headroom: usize) -> Result<Box<Self>> {
        if headroom > MBUF_SIZE {
            return Err(NetError::InvalidArgument);
        }

        // An all-zero MBuf is valid, and building it in place keeps 2KiB off the stack.
        let layout = Layout::new::<Self>();
        let ptr = unsafe { alloc::alloc::alloc_zeroed(layout) } as *mut Self;
        if ptr.is_null() {
            return Err(NetError::NoBuffers);
        }
        let mut m = unsafe { Box::from_raw(ptr) };
        m.head = headroom;
        Ok(m)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn headroom(&self) -> usize {
        self.head
    }

    pub fn tailroom(&self) -> usize {
        MBUF_SIZE - self.head - self.len
    }

    pub fn data(&self) -> &[u8] {
        &self.buf[self.head..self.head + self.len]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.head..self.head + self.len]
    }

    /// strips `len` bytes from the front and returns them.
    pub fn pull(&mut self, len: usize) -> Option<&[u8]> {
        if len > self.len {
            return None;
        }
        let ret = self.head;
        self.head += len;
        self.len -= len;
        Some(&self.buf[ret..ret + len])
    }

    /// grows the buffer by `len` bytes at the front and returns the new bytes.
    pub fn push(&mut self, len: usize) -> Option<&mut [u8]> {
        if len > self.head {
            return None;
        }
        self.head -= len;
        self.len += len;
        Some(&mut self.buf[self.head..self.head + len])
    }

    /// grows the buffer by `len` bytes at the back and returns the new bytes.
    pub fn put(&mut self, len: usize) -> Option<&mut [u8]> {
        if len > self.tailroom() {
            return None;
        }
        let ret = self.head + self.len;
        self.len += len;
        Some(&mut self.buf[ret..ret + len])
    }

    /// strips `len` bytes from the back and returns them.
    pub fn trim(&mut self, len: usize) -> Option<&[u8]> {
        if len > self.len {
            return None;
        }
        self.len -= len;
        let ret = self.head + self.len;
        Some(&self.buf[ret..ret + len])
    }

    pub fn pull_hdr<H: Header>(&mut self) -> Option<H> {
        self.pull(H::SIZE).map(H::decode)
    }

    pub fn push_hdr<H: Header>(&mut self, hdr: &H) -> Option<()> {
        self.push(H::SIZE).map(|b| hdr.encode(b))
    }

    pub fn put_hdr<H: Header>(&mut self, hdr: &H) -> Option<()> {
        self.put(H::SIZE).map(|b| hdr.encode(b))
    }
}

/// FIFO of mbufs; a socket's mailbox.
pub struct MbufQueue {
    q: VecDeque<Box<MBuf>>,
}

impl MbufQueue {
    pub const fn new() -> Self {
        Self { q: VecDeque::new() }
    }

    pub fn len(&self) -> usize {
        self.q.len()
    }

    pub fn is_empty(&self) -> bool {
        self.q.is_empty()
    }

    pub fn enqueue(&mut self, m: Box<MBuf>) {
        self.q.push_back(m);
    }

    pub fn dequeue(&mut self) -> Option<Box<MBuf>> {
        self.q.pop_front()
    }

    pub fn peek(&self) -> Option<&MBuf> {
        self.q.front().map(|m| &**m)
    }

    pub fn peek_mut(&mut self) -> Option<&mut MBuf> {
        self.q.front_mut().map(|m| &mut **m)
    }

    pub fn clear(&mut self) {
        self.q.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &MBuf> {
        self.q.iter().map(|m| &**m)
    }
}

/// TCP segments that arrived ahead of `rcv_nxt`, kept sorted by `seq` with no two ranges
/// overlapping.
pub struct OfoQueue {
    q: VecDeque<Box<MBuf>>,
}

impl OfoQueue {
    pub const fn new() -> Self {
        Self { q: VecDeque::new() }
    }

    pub fn len(&self) -> usize {
        self.q.len()
    }

    pub fn is_empty(&self) -> bool {
        self.q.is_empty()
    }

    pub fn peek(&self) -> Option<&MBuf> {
        self.q.front().map(|m| &**m)
    }

    pub fn dequeue(&mut self) -> Option<Box<MBuf>> {
        self.q.pop_front()
    }

    pub fn clear(&mut self) {
        self.q.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &MBuf> {
        self.q.iter().map(|m| &**m)
    }

    /// inserts `m` in front of the first queued segment that starts after it. Bytes already
    /// held by the neighbours are cut off `m`; returns false if nothing of `m` was new.
    pub fn insert(&mut self, mut m: Box<MBuf>) -> bool {
        let pos = self
            .q
            .iter()
            .position(|n| seq_lt(m.seq, n.seq))
            .unwrap_or(self.q.len());

        if pos > 0 {
            let prev_end = self.q[pos - 1].end_seq;
            if seq_ge(prev_end, m.end_seq) {
                // we already have this segment
                return false;
            }
            if seq_gt(prev_end, m.seq) {
                let overlap = prev_end.wrapping_sub(m.seq) as usize;
                m.pull(overlap);
                m.seq = prev_end;
            }
        }

        if let Some(next) = self.q.get(pos) {
            let next_seq = next.seq;
            if seq_gt(m.end_seq, next_seq) {
                let overlap = m.end_seq.wrapping_sub(next_seq) as usize;
                m.trim(overlap);
                m.end_seq = next_seq;
            }
        }

        if m.is_empty() {
            return false;
        }
        self.q.insert(pos, m);
        true
    }
}
