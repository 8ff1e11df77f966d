use std::time::Duration;

use anyhow::bail;

use crate::fragmenter::FragmentHeader;
use crate::message_header::DataHeader;
use crate::packet_header::PacketHeader;

#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Size of the fixed connection slot pool. This is the maximum number of connections that
    ///  can be connecting, connected or waiting for their Disconnect message to be sent.
    pub max_connections: usize,

    /// This is the payload size inside a UDP packet that the driver assumes. Payloads that do not
    ///  fit into a single datagram (including headers) are fragmented.
    ///
    /// With full Ethernet frames and no optional IP headers, this is `1500 - 20 - 8 = 1472` for
    ///  IPV4. Choosing it too big causes packets to be dropped by the network; choosing it too
    ///  small wastes bandwidth.
    pub max_datagram_size: usize,

    /// Time to wait for an Accept before re-sending a ConnectionRequest
    pub connect_timeout: Duration,
    /// Number of ConnectionRequests (including the first) before a connection attempt is given up
    pub max_connect_attempts: u32,
    /// A connected slot that receives nothing for this long is dropped
    pub disconnect_timeout: Duration,

    /// upper bound for a single application payload, fragmented or not
    pub max_message_size: usize,
    /// Capacity of the buffer that holds all payloads received during one tick. Payloads
    ///  arriving after the arena is full are dropped.
    pub receive_arena_size: usize,

    /// Number of incoming connection requests that can wait for `accept()`
    pub max_pending_accepts: usize,
    /// Number of incomplete fragmented payloads tracked per connection
    pub max_reassemblies_per_connection: usize,
    /// Initial number of events buffered per connection; grows on demand
    pub event_queue_initial_capacity: usize,
    /// Number of datagram buffers kept for reuse
    pub send_buffer_pool_size: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig {
            max_connections: 64,
            max_datagram_size: 1472,
            connect_timeout: Duration::from_millis(1000),
            max_connect_attempts: 60,
            disconnect_timeout: Duration::from_millis(30_000),
            max_message_size: 64 * 1024,
            receive_arena_size: 1024 * 1024,
            max_pending_accepts: 64,
            max_reassemblies_per_connection: 8,
            event_queue_initial_capacity: 4,
            send_buffer_pool_size: 256,
        }
    }
}

impl DriverConfig {
    /// The smallest datagram size that leaves room for a meaningful fragment
    pub const MIN_DATAGRAM_SIZE: usize = 64;

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_connections == 0 || self.max_connections > u32::MAX as usize {
            bail!("max_connections must be between 1 and {}", u32::MAX);
        }
        if self.max_datagram_size < Self::MIN_DATAGRAM_SIZE {
            bail!("max_datagram_size is too small");
        }
        if self.fragment_size() > u16::MAX as usize {
            bail!("max_datagram_size is too big for the fragment header's length field");
        }
        if self.max_connect_attempts == 0 {
            bail!("max_connect_attempts must be at least 1");
        }
        if self.max_message_size > u32::MAX as usize {
            bail!("max_message_size must fit the u32 length prefix");
        }
        if self.receive_arena_size > u32::MAX as usize {
            bail!("receive_arena_size must be addressable by u32 offsets");
        }
        if self.max_message_size > self.receive_arena_size {
            bail!("receive_arena_size must hold at least one message of max_message_size");
        }
        if self.max_message_size.div_ceil(self.fragment_size()) > u16::MAX as usize {
            bail!("max_message_size requires more fragments than the fragment header can count");
        }
        if self.max_reassemblies_per_connection == 0 {
            bail!("max_reassemblies_per_connection must be at least 1");
        }
        if self.event_queue_initial_capacity == 0 {
            bail!("event_queue_initial_capacity must be at least 1");
        }

        Ok(())
    }

    /// payload bytes per fragment
    pub fn fragment_size(&self) -> usize {
        self.max_datagram_size - PacketHeader::SERIALIZED_LEN - FragmentHeader::SERIALIZED_LEN
    }

    /// largest payload that is sent as a single Data message
    pub fn max_unfragmented_payload(&self) -> usize {
        self.max_datagram_size - PacketHeader::SERIALIZED_LEN - DataHeader::SERIALIZED_LEN
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_is_valid() {
        DriverConfig::default().validate().unwrap();
    }

    #[test]
    fn test_derived_sizes() {
        let config = DriverConfig::default();
        assert_eq!(config.fragment_size(), 1460);
        assert_eq!(config.max_unfragmented_payload(), 1466);
    }

    #[rstest]
    #[case::no_connections(DriverConfig { max_connections: 0, ..Default::default() })]
    #[case::tiny_datagrams(DriverConfig { max_datagram_size: 20, ..Default::default() })]
    #[case::huge_datagrams(DriverConfig { max_datagram_size: 100_000, ..Default::default() })]
    #[case::no_attempts(DriverConfig { max_connect_attempts: 0, ..Default::default() })]
    #[case::arena_too_small(DriverConfig { receive_arena_size: 1000, ..Default::default() })]
    #[case::no_reassemblies(DriverConfig { max_reassemblies_per_connection: 0, ..Default::default() })]
    #[case::no_event_capacity(DriverConfig { event_queue_initial_capacity: 0, ..Default::default() })]
    fn test_invalid(#[case] config: DriverConfig) {
        assert!(config.validate().is_err());
    }
}
