use thiserror::Error;

/// Programmer and usage errors. Protocol level failures (timeouts, refused connections) are not
///  errors, they are reported as events.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("writing {requested} bytes exceeds the buffer's remaining capacity of {remaining} bytes")]
    BufferOverflow { requested: usize, remaining: usize },
    #[error("reading {requested} bytes at offset {offset} exceeds the length of {len} bytes")]
    OutOfRange { offset: usize, requested: usize, len: usize },
    #[error("read view belongs to receive epoch {view_epoch}, but epoch {current_epoch} has started")]
    StaleReadView { view_epoch: u64, current_epoch: u64 },
    #[error("a driver update is in flight - complete it before using the driver")]
    UpdateInFlight,
    #[error("socket is not bound")]
    NotBound,
    #[error("endpoint {0} is already bound")]
    AddressInUse(String),
    #[error("all {0} connection slots are in use")]
    ConnectionPoolExhausted(usize),
    #[error("datagram of {len} bytes exceeds the maximum datagram size of {max} bytes")]
    DatagramTooLarge { len: usize, max: usize },
    #[error("address family mismatch: {0}")]
    AddressFamily(String),
}
