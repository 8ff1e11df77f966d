use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::bail;
use bytes::Bytes;

use crate::error::TransportError;

/// Read position into a [ReadView]. The cursor is owned by the caller and passed into every
///  read, so a view itself is never mutated by reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursor {
    position: usize,
}

impl Cursor {
    pub fn new() -> Cursor {
        Cursor::default()
    }

    pub fn position(&self) -> usize {
        self.position
    }
}

/// Shared counter of receive epochs. Views handed out during epoch `n` become stale once the
///  counter moved past `n`.
#[derive(Debug, Clone, Default)]
pub struct ReceiveEpoch(Arc<AtomicU64>);

impl ReceiveEpoch {
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    /// start a new epoch, returning its number
    pub fn advance(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }
}

#[derive(Debug, Clone)]
struct EpochTag {
    epoch: u64,
    source: ReceiveEpoch,
}

/// An immutable, bounds checked window of `len` bytes.
#[derive(Debug, Clone)]
pub struct ReadView {
    bytes: Bytes,
    offset: usize,
    len: usize,
    epoch: Option<EpochTag>,
}

impl ReadView {
    /// A view of all of `bytes` that never goes stale
    pub fn from_bytes(bytes: Bytes) -> ReadView {
        let len = bytes.len();
        ReadView {
            bytes,
            offset: 0,
            len,
            epoch: None,
        }
    }

    /// A view of a range of a driver's receive arena, valid only while `source` is at `epoch`.
    ///  The caller ensures that the range lies inside `bytes`.
    pub(crate) fn for_epoch(bytes: Bytes, offset: usize, len: usize, source: &ReceiveEpoch, epoch: u64) -> ReadView {
        debug_assert!(offset + len <= bytes.len());
        ReadView {
            bytes,
            offset,
            len,
            epoch: Some(EpochTag {
                epoch,
                source: source.clone(),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn remaining(&self, cursor: &Cursor) -> usize {
        self.len.saturating_sub(cursor.position)
    }

    /// false once the receive epoch this view was issued in has ended
    pub fn is_valid(&self) -> bool {
        self.check_epoch().is_ok()
    }

    fn check_epoch(&self) -> anyhow::Result<()> {
        if let Some(tag) = &self.epoch {
            let current_epoch = tag.source.current();
            if current_epoch != tag.epoch {
                bail!(TransportError::StaleReadView { view_epoch: tag.epoch, current_epoch });
            }
        }
        Ok(())
    }

    fn take(&self, cursor: &mut Cursor, n: usize) -> anyhow::Result<&[u8]> {
        self.check_epoch()?;
        if n > self.remaining(cursor) {
            bail!(TransportError::OutOfRange { offset: cursor.position, requested: n, len: self.len });
        }
        let start = self.offset + cursor.position;
        cursor.position += n;
        Ok(&self.bytes[start..start + n])
    }

    pub fn read_u8(&self, cursor: &mut Cursor) -> anyhow::Result<u8> {
        Ok(self.take(cursor, 1)?[0])
    }

    pub fn read_u16(&self, cursor: &mut Cursor) -> anyhow::Result<u16> {
        let raw = self.take(cursor, size_of::<u16>())?;
        Ok(u16::from_be_bytes([raw[0], raw[1]]))
    }

    pub fn read_u32(&self, cursor: &mut Cursor) -> anyhow::Result<u32> {
        let raw = self.take(cursor, size_of::<u32>())?;
        Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    /// fill all of `destination`
    pub fn read_bytes(&self, cursor: &mut Cursor, destination: &mut [u8]) -> anyhow::Result<()> {
        let raw = self.take(cursor, destination.len())?;
        destination.copy_from_slice(raw);
        Ok(())
    }

    /// zero-copy read of the next `n` bytes
    pub fn read_slice(&self, cursor: &mut Cursor, n: usize) -> anyhow::Result<Bytes> {
        self.check_epoch()?;
        if n > self.remaining(cursor) {
            bail!(TransportError::OutOfRange { offset: cursor.position, requested: n, len: self.len });
        }
        let start = self.offset + cursor.position;
        cursor.position += n;
        Ok(self.bytes.slice(start..start + n))
    }

    /// copy of the entire view, independent of any cursor
    pub fn to_vec(&self) -> anyhow::Result<Vec<u8>> {
        self.check_epoch()?;
        Ok(self.bytes[self.offset..self.offset + self.len].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn view_of(data: &[u8]) -> ReadView {
        ReadView::from_bytes(Bytes::copy_from_slice(data))
    }

    #[test]
    fn test_read_numbers() {
        let view = view_of(&[1, 0, 2, 0, 0, 0, 3]);
        let mut cursor = Cursor::new();
        assert_eq!(view.read_u8(&mut cursor).unwrap(), 1);
        assert_eq!(view.read_u16(&mut cursor).unwrap(), 2);
        assert_eq!(view.read_u32(&mut cursor).unwrap(), 3);
        assert_eq!(cursor.position(), 7);
        assert_eq!(view.remaining(&cursor), 0);
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::one(vec![1])]
    #[case::several(vec![1, 2, 3, 4, 5])]
    fn test_read_one_past_end_fails(#[case] data: Vec<u8>) {
        let view = view_of(&data);
        let mut cursor = Cursor::new();
        let mut all = vec![0u8; data.len()];
        view.read_bytes(&mut cursor, &mut all).unwrap();

        let err = view.read_u8(&mut cursor).unwrap_err();
        assert_eq!(err.downcast_ref::<TransportError>(), Some(&TransportError::OutOfRange { offset: data.len(), requested: 1, len: data.len() }));
        assert_eq!(cursor.position(), data.len());
    }

    #[test]
    fn test_failed_read_leaves_cursor() {
        let view = view_of(&[1, 2, 3]);
        let mut cursor = Cursor::new();
        view.read_u8(&mut cursor).unwrap();
        assert!(view.read_u32(&mut cursor).is_err());
        assert_eq!(cursor.position(), 1);
        assert_eq!(view.read_u16(&mut cursor).unwrap(), 0x0203);
    }

    #[test]
    fn test_independent_cursors() {
        let view = view_of(&[1, 2, 3, 4]);
        let mut a = Cursor::new();
        let mut b = Cursor::new();

        assert_eq!(view.read_u8(&mut a).unwrap(), 1);
        assert_eq!(view.read_u8(&mut a).unwrap(), 2);
        assert_eq!(view.read_u8(&mut b).unwrap(), 1);
        assert_eq!(view.read_u16(&mut a).unwrap(), 0x0304);
        assert_eq!(view.read_u8(&mut b).unwrap(), 2);
    }

    #[test]
    fn test_parallel_readers() {
        let view = view_of(&(0..=255u8).collect::<Vec<_>>());
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    let mut cursor = Cursor::new();
                    for expected in 0..=255u8 {
                        assert_eq!(view.read_u8(&mut cursor).unwrap(), expected);
                    }
                });
            }
        });
    }

    #[test]
    fn test_sub_range_view() {
        let source = ReceiveEpoch::default();
        let view = ReadView::for_epoch(Bytes::from_static(&[1, 2, 3, 4, 5]), 1, 3, &source, source.current());
        let mut cursor = Cursor::new();
        assert_eq!(view.len(), 3);
        assert_eq!(view.read_slice(&mut cursor, 3).unwrap().as_ref(), &[2, 3, 4]);
        assert!(view.read_u8(&mut cursor).is_err());
        assert_eq!(view.to_vec().unwrap(), vec![2, 3, 4]);
    }

    #[test]
    fn test_stale_epoch() {
        let source = ReceiveEpoch::default();
        source.advance();
        let view = ReadView::for_epoch(Bytes::from_static(&[1, 2]), 0, 2, &source, source.current());
        assert!(view.is_valid());

        source.advance();
        assert!(!view.is_valid());
        let err = view.read_u8(&mut Cursor::new()).unwrap_err();
        assert_eq!(err.downcast_ref::<TransportError>(), Some(&TransportError::StaleReadView { view_epoch: 1, current_epoch: 2 }));
        assert!(view.to_vec().is_err());
    }

    #[test]
    fn test_view_for_past_epoch_is_stale() {
        let source = ReceiveEpoch::default();
        let epoch = source.advance();
        source.advance();
        let view = ReadView::for_epoch(Bytes::from_static(&[1, 2]), 0, 2, &source, epoch);
        assert!(!view.is_valid());
        assert!(view.read_u8(&mut Cursor::new()).is_err());
    }
}
