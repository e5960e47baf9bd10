use super::{BufferHandle, BufferPool};

/// A reader/writer view over a pooled buffer's bytes, bound to that
/// buffer's own `read_offset`/`write_offset` cursors.
///
/// Grounded on `io_queue_buffer_stream_{reader,writer,readable,writeable,
/// reset}` in the original implementation. Cursors live with the buffer,
/// not with the view, so multiple `BufferStream`s obtained for the same
/// handle observe the same position; state transitions in [`super::IoQueue`]
/// never reset them.
pub struct BufferStream<'a> {
    pool: &'a BufferPool,
    handle: BufferHandle,
}

impl<'a> BufferStream<'a> {
    pub(super) fn new(pool: &'a BufferPool, handle: BufferHandle) -> Self {
        Self { pool, handle }
    }

    /// Bytes available to read without blocking.
    pub fn readable(&self) -> usize {
        self.pool
            .with_slot(self.handle, |s| s.write_offset.saturating_sub(s.read_offset))
            .unwrap_or(0)
    }

    /// Remaining capacity available to write.
    pub fn writable(&self) -> usize {
        self.pool
            .with_slot(self.handle, |s| s.data.len().saturating_sub(s.write_offset))
            .unwrap_or(0)
    }

    /// Read up to `out.len()` bytes, advancing the read cursor. Returns the
    /// number of bytes actually read.
    pub fn read(&self, out: &mut [u8]) -> usize {
        self.pool
            .with_slot_mut(self.handle, |s| {
                let available = s.write_offset.saturating_sub(s.read_offset);
                let n = out.len().min(available);
                out[..n].copy_from_slice(&s.data[s.read_offset..s.read_offset + n]);
                s.read_offset += n;
                n
            })
            .unwrap_or(0)
    }

    /// Write up to `data.len()` bytes, advancing the write cursor. Returns
    /// the number of bytes actually written (truncated at buffer capacity).
    pub fn write(&self, data: &[u8]) -> usize {
        self.pool
            .with_slot_mut(self.handle, |s| {
                let capacity = s.data.len().saturating_sub(s.write_offset);
                let n = data.len().min(capacity);
                s.data[s.write_offset..s.write_offset + n].copy_from_slice(&data[..n]);
                s.write_offset += n;
                n
            })
            .unwrap_or(0)
    }

    /// Reset both cursors to zero. Only ever called explicitly by the
    /// owner of the buffer, never implicitly by a queue state transition.
    pub fn reset(&self) {
        self.pool.with_slot_mut(self.handle, |s| {
            s.read_offset = 0;
            s.write_offset = 0;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write_round_trip() {
        let pool = BufferPool::new("test");
        let handle = pool.create(8, None);
        let stream = pool.as_stream(handle);

        assert_eq!(stream.write(b"hello"), 5);
        assert_eq!(stream.readable(), 5);

        let mut out = [0u8; 5];
        assert_eq!(stream.read(&mut out), 5);
        assert_eq!(&out, b"hello");
        assert_eq!(stream.readable(), 0);
    }

    #[test]
    fn write_truncates_at_capacity() {
        let pool = BufferPool::new("test");
        let handle = pool.create(4, None);
        let stream = pool.as_stream(handle);

        assert_eq!(stream.write(b"toolong"), 4);
        assert_eq!(stream.writable(), 0);
    }

    #[test]
    fn reset_does_not_happen_implicitly() {
        let pool = BufferPool::new("test");
        let queue = super::super::IoQueue::new("test");
        let handle = pool.create(8, None);
        let stream = pool.as_stream(handle);

        stream.write(b"data");
        queue.push_ready(handle, None);
        queue.pop_ready();
        queue.complete(handle, 0);

        assert_eq!(stream.readable(), 4);
    }
}
