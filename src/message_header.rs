use crate::buffers::read_view::{Cursor, ReadView};
use crate::buffers::write_buffer::WriteBuffer;
use crate::safe_converter::PrecheckedCast;

/// Length prefix of a [crate::packet_header::MessageType::Data] message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataHeader {
    pub payload_len: u32,
}

impl DataHeader {
    pub const SERIALIZED_LEN: usize = size_of::<u32>();

    /// NB: callers ensure that the payload length fits into a u32
    pub(crate) fn for_payload(payload: &[u8]) -> DataHeader {
        DataHeader {
            payload_len: payload.len().prechecked_cast(),
        }
    }

    pub fn ser(&self, buf: &mut WriteBuffer) -> anyhow::Result<()> {
        buf.write_u32(self.payload_len)
    }

    pub fn deser(view: &ReadView, cursor: &mut Cursor) -> anyhow::Result<Self> {
        let payload_len = view.read_u32(cursor)?;
        Ok(DataHeader {
            payload_len,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rstest::rstest;

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(9999)]
    #[case(99999)]
    #[case(u32::MAX)]
    fn test_ser(#[case] len: u32) {
        let original = DataHeader { payload_len: len };

        let mut buf = WriteBuffer::new(DataHeader::SERIALIZED_LEN);
        original.ser(&mut buf).unwrap();
        let view = ReadView::from_bytes(Bytes::copy_from_slice(buf.as_ref()));
        let mut cursor = Cursor::new();
        let deser = DataHeader::deser(&view, &mut cursor).unwrap();
        assert_eq!(view.remaining(&cursor), 0);
        assert_eq!(deser, original);
    }

    #[test]
    fn test_for_payload() {
        assert_eq!(DataHeader::for_payload(b"ping"), DataHeader { payload_len: 4 });
    }
}
