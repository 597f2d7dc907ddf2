use core::fmt;

/// Errors returned to the socket layer.
///
/// Frames that fail validation on the receive path are dropped and never turn into one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetError {
    /// an mbuf could not be allocated
    NoBuffers,
    /// the connection or control block table is full
    NoSockets,
    InvalidArgument,
    UnsupportedFamily,
    UnsupportedType,
    AddressInUse,
    PortsExhausted,
    /// the call is not valid in the connection's current state
    InvalidState,
    ConnectionRefused,
    ConnectionReset,
    NotConnected,
    BacklogFull,
    MessageTooLong,
    /// the calling process was marked for termination while blocked
    Killed,
    /// the device refused the frame
    Transmit(&'static str),
}

pub type Result<T> = core::result::Result<T, NetError>;

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetError::NoBuffers => write!(f, "no packet buffers available"),
            NetError::NoSockets => write!(f, "no sockets available"),
            NetError::InvalidArgument => write!(f, "invalid argument"),
            NetError::UnsupportedFamily => write!(f, "address family not supported"),
            NetError::UnsupportedType => write!(f, "socket type not supported"),
            NetError::AddressInUse => write!(f, "address already in use"),
            NetError::PortsExhausted => write!(f, "no free local ports"),
            NetError::InvalidState => write!(f, "operation not valid in this state"),
            NetError::ConnectionRefused => write!(f, "connection refused"),
            NetError::ConnectionReset => write!(f, "connection reset"),
            NetError::NotConnected => write!(f, "not connected"),
            NetError::BacklogFull => write!(f, "backlog full"),
            NetError::MessageTooLong => write!(f, "message too long"),
            NetError::Killed => write!(f, "process killed"),
            NetError::Transmit(msg) => write!(f, "transmit failed: {}", msg),
        }
    }
}
