use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

use tracing::{debug, trace};

use crate::buffers::write_buffer::WriteBuffer;

/// Pool of equally sized [WriteBuffer]s. Buffers are handed out as [PooledBuffer] guards that
///  return them to the pool when they go out of scope, on all exit paths.
pub struct BufferPool {
    buf_size: usize,
    max_pool_size: usize,
    buffers: Mutex<Vec<WriteBuffer>>,
}

impl BufferPool {
    pub fn new(buf_size: usize, max_pool_size: usize) -> Arc<BufferPool> {
        Arc::new(BufferPool {
            buf_size,
            max_pool_size,
            buffers: Mutex::new(Vec::with_capacity(max_pool_size)),
        })
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    pub fn get_from_pool(self: &Arc<Self>) -> PooledBuffer {
        let buffer = self.buffers.lock()
            .ok()
            .and_then(|mut buffers| buffers.pop());

        let buffer = match buffer {
            Some(buffer) => {
                trace!("returning buffer from pool");
                buffer
            }
            None => {
                debug!("no buffer in pool: creating new buffer");
                WriteBuffer::new(self.buf_size)
            }
        };

        PooledBuffer {
            buffer: Some(buffer),
            pool: self.clone(),
        }
    }

    fn return_to_pool(&self, mut buffer: WriteBuffer) {
        buffer.clear();

        let Ok(mut buffers) = self.buffers.lock() else {
            return;
        };
        if buffers.len() < self.max_pool_size {
            trace!("returning buffer to pool");
            buffers.push(buffer);
        }
        else {
            debug!("pool is full: discarding returned buffer");
        }
    }

    #[cfg(test)]
    fn num_pooled(&self) -> usize {
        self.buffers.lock().unwrap().len()
    }
}

/// A [WriteBuffer] on loan from a [BufferPool]
pub struct PooledBuffer {
    buffer: Option<WriteBuffer>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = WriteBuffer;

    fn deref(&self) -> &WriteBuffer {
        self.buffer.as_ref().expect("buffer is present until drop")
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut WriteBuffer {
        self.buffer.as_mut().expect("buffer is present until drop")
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.return_to_pool(buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_returned_buffer_is_cleared() {
        let pool = BufferPool::new(10, 10);

        {
            let mut buf = pool.get_from_pool();
            buf.write(&[1, 2]).unwrap();
        }
        assert_eq!(pool.num_pooled(), 1);

        let buf = pool.get_from_pool();
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), 10);
        assert_eq!(pool.num_pooled(), 0);
    }

    #[test]
    fn test_returned_on_error_path() {
        fn fill(pool: &Arc<BufferPool>) -> anyhow::Result<()> {
            let mut buf = pool.get_from_pool();
            buf.write(&[0; 4])?;
            buf.write(&[0; 4])?;
            Ok(())
        }

        let pool = BufferPool::new(6, 2);
        assert!(fill(&pool).is_err());
        assert_eq!(pool.num_pooled(), 1);
    }

    #[test]
    fn test_full_pool_discards() {
        let pool = BufferPool::new(4, 1);
        let a = pool.get_from_pool();
        let b = pool.get_from_pool();
        drop(a);
        drop(b);
        assert_eq!(pool.num_pooled(), 1);
    }
}
