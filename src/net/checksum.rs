//! Internet checksum (RFC 1071).

use super::ip::Protocol;

/// adds up `data` as big-endian 16-bit words; an odd trailing byte is padded with zero.
fn sum_words(data: &[u8], init: u32) -> u32 {
    let mut sum = init;
    let mut words = data.chunks_exact(2);
    for w in &mut words {
        sum = sum.wrapping_add(u16::from_be_bytes([w[0], w[1]]) as u32);
    }
    if let [last] = words.remainder() {
        sum = sum.wrapping_add((*last as u32) << 8);
    }
    sum
}

/// one's complement of the one's complement sum of `data`, starting from `init`.
///
/// Run over a header that already carries its checksum, the result is zero if the header is
/// intact.
pub fn in_cksum(data: &[u8], init: u32) -> u16 {
    let mut sum = sum_words(data, init);

    // add back carry outs from top 16 bits to low 16 bits
    while sum >> 16 != 0 {
        sum = (sum >> 16) + (sum & 0xffff);
    }

    !(sum as u16)
}

/// checksum of a tcp segment (header and data) including the IPv4 pseudo-header.
pub(crate) fn tcp_checksum(saddr: u32, daddr: u32, segment: &[u8]) -> u16 {
    let mut sum = 0u32;
    sum += saddr >> 16;
    sum += saddr & 0xffff;
    sum += daddr >> 16;
    sum += daddr & 0xffff;
    sum += Protocol::TCP as u32;
    sum += segment.len() as u32;

    in_cksum(segment, sum)
}
