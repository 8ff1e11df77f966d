use anyhow::anyhow;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::buffers::read_view::{Cursor, ReadView};
use crate::buffers::write_buffer::WriteBuffer;

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
pub enum MessageType {
    ConnectionRequest = 1,
    Accept = 2,
    /// a complete application payload, preceded by a [crate::message_header::DataHeader]
    Data = 3,
    Disconnect = 4,
    /// one slice of an application payload that did not fit into a single datagram, preceded
    ///  by a [crate::fragmenter::FragmentHeader]
    DataFragment = 5,
}

/// The header every datagram starts with
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PacketHeader {
    pub message_type: MessageType,
}

impl PacketHeader {
    pub const PROTOCOL_VERSION_1: u8 = 0;
    pub const SERIALIZED_LEN: usize = 2;

    pub fn new(message_type: MessageType) -> PacketHeader {
        PacketHeader { message_type }
    }

    pub fn ser(&self, buf: &mut WriteBuffer) -> anyhow::Result<()> {
        buf.write_u8(Self::PROTOCOL_VERSION_1)?;
        buf.write_u8(self.message_type.into())
    }

    pub fn deser(view: &ReadView, cursor: &mut Cursor) -> anyhow::Result<PacketHeader> {
        let protocol_version = view.read_u8(cursor)?;
        if protocol_version != Self::PROTOCOL_VERSION_1 {
            return Err(anyhow!("unsupported protocol version {}", protocol_version));
        }
        let raw_type = view.read_u8(cursor)?;
        let message_type = MessageType::try_from_primitive(raw_type)
            .map_err(|_| anyhow!("invalid message type {}", raw_type))?;
        Ok(PacketHeader { message_type })
    }
}
