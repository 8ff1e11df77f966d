//! Connection-oriented transport on top of unreliable datagrams.
//!
//! A [driver::Driver] binds, listens, connects, accepts, sends and receives over a pluggable
//!  [socket::DatagramSocket]. There is no background processing: all I/O happens in explicitly
//!  scheduled ticks, and the results of a tick are popped as events afterwards.
//!
//! Each datagram starts with a two byte header (all numbers are big endian):
//!
//! ```ascii
//! 0: protocol version (u8) - 0
//! 1: message type (u8)     - 1 ConnectionRequest, 2 Accept, 3 Data, 4 Disconnect, 5 DataFragment
//! ```
//!
//! `Data` continues with the payload length (u32) followed by the payload. Payloads that do not fit
//!  into a single datagram are sent as a sequence of `DataFragment` messages, each continuing with
//!  a [fragmenter::FragmentHeader] and a slice of the payload.
//!
//! There is no retransmission of lost data, and no ordering guarantee across datagrams.

pub mod buffers;
pub mod concurrent_event_queue;
pub mod config;
pub mod connection;
pub mod connection_table;
pub mod driver;
pub mod endpoint;
pub mod error;
pub mod event_queue;
pub mod fragmenter;
pub mod message_header;
pub mod packet_header;
pub mod safe_converter;
pub mod socket;
