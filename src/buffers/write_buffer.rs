use std::fmt::{Debug, Formatter};

use anyhow::bail;
use bytes::{BufMut, Bytes, BytesMut};

use crate::buffers::read_view::ReadView;
use crate::error::TransportError;

/// A byte buffer with a capacity that is fixed at construction. Writes append at the write
///  cursor (`len`) and fail rather than reallocate when capacity is exhausted.
#[derive(Eq)]
pub struct WriteBuffer {
    buf: BytesMut,
    capacity: usize,
}

impl WriteBuffer {
    pub fn new(capacity: usize) -> WriteBuffer {
        WriteBuffer {
            buf: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.buf.len()
    }

    /// reset the write cursor, keeping the allocation
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    fn ensure_remaining(&self, requested: usize) -> anyhow::Result<()> {
        if requested > self.remaining() {
            bail!(TransportError::BufferOverflow { requested, remaining: self.remaining() });
        }
        Ok(())
    }

    pub fn write(&mut self, data: &[u8]) -> anyhow::Result<()> {
        self.ensure_remaining(data.len())?;
        self.buf.put_slice(data);
        Ok(())
    }

    pub fn write_u8(&mut self, value: u8) -> anyhow::Result<()> {
        self.ensure_remaining(size_of::<u8>())?;
        self.buf.put_u8(value);
        Ok(())
    }

    pub fn write_u16(&mut self, value: u16) -> anyhow::Result<()> {
        self.ensure_remaining(size_of::<u16>())?;
        self.buf.put_u16(value);
        Ok(())
    }

    pub fn write_u32(&mut self, value: u32) -> anyhow::Result<()> {
        self.ensure_remaining(size_of::<u32>())?;
        self.buf.put_u32(value);
        Ok(())
    }

    /// Copy `count` written bytes starting at `offset` to the start of `destination`
    pub fn copy_to(&self, offset: usize, count: usize, destination: &mut [u8]) -> anyhow::Result<()> {
        if offset.checked_add(count).map_or(true, |end| end > self.len()) {
            bail!(TransportError::OutOfRange { offset, requested: count, len: self.len() });
        }
        if count > destination.len() {
            bail!(TransportError::BufferOverflow { requested: count, remaining: destination.len() });
        }
        destination[..count].copy_from_slice(&self.buf[offset..offset + count]);
        Ok(())
    }

    /// Create an immutable view of a range of the bytes written so far. The view owns a copy of
    ///  the range, so the buffer can be cleared and reused while the view is alive.
    pub fn read_view(&self, offset: usize, length: usize) -> anyhow::Result<ReadView> {
        if offset.checked_add(length).map_or(true, |end| end > self.len()) {
            bail!(TransportError::OutOfRange { offset, requested: length, len: self.len() });
        }
        Ok(ReadView::from_bytes(Bytes::copy_from_slice(&self.buf[offset..offset + length])))
    }

    /// Hand out the written bytes as shared, immutable `Bytes` and continue with an empty buffer
    ///  of the same capacity. The next write reclaims the allocation if all handed-out `Bytes`
    ///  are dropped by then.
    pub(crate) fn freeze(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    /// This is a convenience function for test code. It derives the buffer's capacity from the
    ///  slice used for initialization, which is a shortcut not intended for production usage.
    #[cfg(test)]
    pub fn from_slice(capacity: usize, data: &[u8]) -> WriteBuffer {
        let mut result = WriteBuffer::new(capacity);
        result.write(data).unwrap();
        result
    }
}

impl PartialEq for WriteBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.as_ref().eq(other.as_ref())
    }
}

impl Debug for WriteBuffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.as_ref().fmt(f)
    }
}

impl AsRef<[u8]> for WriteBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.buf
    }
}
