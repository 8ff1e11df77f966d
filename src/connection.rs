use std::fmt::{Display, Formatter};

/// Reference to a connection slot. A handle stays valid only as long as the slot's generation
///  matches; recycling a slot bumps its generation, which turns all old handles stale.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionHandle {
    index: u32,
    generation: u32,
}

impl ConnectionHandle {
    pub(crate) fn new(index: u32, generation: u32) -> ConnectionHandle {
        ConnectionHandle { index, generation }
    }

    pub fn index(&self) -> usize {
        self.index as usize
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl Display for ConnectionHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}@{}", self.index, self.generation)
    }
}

/// ```ascii
/// Disconnected -> Connecting -> Connected -> Disconnecting -> Disconnected
/// ```
///
/// `Disconnecting` is a slot whose handle was already invalidated by a local disconnect, but whose
///  Disconnect message is still waiting to be sent. Stale handles always report `Disconnected`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_equality() {
        assert_eq!(ConnectionHandle::new(1, 2), ConnectionHandle::new(1, 2));
        assert_ne!(ConnectionHandle::new(1, 2), ConnectionHandle::new(1, 3));
        assert_ne!(ConnectionHandle::new(1, 2), ConnectionHandle::new(2, 2));
        assert_eq!(ConnectionHandle::new(4, 7).to_string(), "#4@7");
    }
}
