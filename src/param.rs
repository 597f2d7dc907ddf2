// packet buffers
pub const MBUF_SIZE: usize = 2048;
pub const MBUF_DEFAULT_HEADROOM: usize = 128;

// qemu's user network: the guest address and the e1000's mac address.
pub const LOCAL_IP_ADDR: u32 = build_ip_addr(10, 0, 2, 15);
pub const LOCAL_MAC_ADDR: [u8; 6] = [0x52, 0x54, 0x00, 0x12, 0x34, 0x56];

// ports handed out by bind() and the automatic allocator, inclusive.
pub const MIN_PORT: u16 = 10;
pub const MAX_PORT: u16 = 4999;

pub const IP_DEFAULT_TTL: u8 = 100;

pub const TCP_DEFAULT_MSS: usize = 536;
pub const TCP_DEFAULT_WINDOW: u16 = 65535;
pub const TCP_MAX_BACKLOG: usize = 128;
pub const TCP_MAX_SOCKS: usize = 128; // max # of live tcp connection objects
pub const TCP_MSL_TICKS: u64 = 10; // maximum segment lifetime, in timer ticks
pub const TCP_TIMEWAIT_TICKS: u64 = 2 * TCP_MSL_TICKS;
pub const TCP_FIRST_ISS: u32 = 12345678;

pub const UDP_CB_TABLE_SIZE: usize = 16;

pub const fn build_ip_addr(v1: u32, v2: u32, v3: u32, v4: u32) -> u32 {
    (v1 << 24) | (v2 << 16) | (v3 << 8) | (v4 << 0)
}
