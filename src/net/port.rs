//! Local port reservation, shared by TCP connections and UDP control blocks.
//!
//! A port is taken while both tables are locked (TCP registry first), so two binds can never
//! both see it free.

use alloc::sync::Arc;

use log::debug;

use crate::{
    error::{NetError, Result},
    param::{MAX_PORT, MIN_PORT},
};

use super::{tcp::TcpSock, NetStack};

/// Who a reserved port is for.
#[derive(Clone, Copy)]
pub(crate) enum PortOwner<'a> {
    Tcp(&'a Arc<TcpSock>),
    Udp(usize),
}

const SPAN: u32 = (MAX_PORT - MIN_PORT) as u32 + 1;

fn in_range(port: u16) -> bool {
    (MIN_PORT..=MAX_PORT).contains(&port)
}

/// reserves `port` for `owner`, if nobody else holds it.
pub(crate) fn reserve_port(stack: &NetStack, port: u16, owner: PortOwner) -> Result<()> {
    if !in_range(port) {
        return Err(NetError::InvalidArgument);
    }
    let mut entries = stack.tcp.entries();
    let mut metas = stack.udp.metas();
    if entries.port_in_use(port) || metas.port_in_use(port) {
        return Err(NetError::AddressInUse);
    }
    match owner {
        PortOwner::Tcp(sock) => entries.set_local_port(sock, port),
        PortOwner::Udp(idx) => metas.set_port(idx, port),
    }
}

/// reserves the first free port after a hint taken from the clock.
pub(crate) fn reserve_any_port(stack: &NetStack, owner: PortOwner) -> Result<u16> {
    let start = (stack.kernel().ticks() % SPAN as u64) as u32;
    let mut entries = stack.tcp.entries();
    let mut metas = stack.udp.metas();

    for i in 0..SPAN {
        let port = MIN_PORT + ((start + i) % SPAN) as u16;
        if entries.port_in_use(port) || metas.port_in_use(port) {
            continue;
        }
        match owner {
            PortOwner::Tcp(sock) => entries.set_local_port(sock, port)?,
            PortOwner::Udp(idx) => metas.set_port(idx, port)?,
        }
        debug!("port {} allocated", port);
        return Ok(port);
    }
    Err(NetError::PortsExhausted)
}
