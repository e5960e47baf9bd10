//! Buffer pool (component A).
//!
//! The original C implementation recovers a buffer's header from a raw
//! payload pointer via fixed offset arithmetic. In safe Rust the pool hands
//! out a [`BufferHandle`] (an index/generation pair into an arena) instead
//! of a pointer, so callers never need unsafe code to get back from payload
//! to header.

use std::sync::Mutex;

use log::trace;

mod queue;
mod stream;

pub use queue::{AbortCallback, IoQueue, QueueState};
pub use stream::BufferStream;

/// Handle to a pooled buffer. Cheap to copy, stable across state
/// transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle {
    index: usize,
    generation: u64,
}

struct Slot {
    generation: u64,
    occupied: bool,
    data: Vec<u8>,
    read_offset: usize,
    write_offset: usize,
    code: i32,
}

impl Slot {
    fn vacant(generation: u64) -> Self {
        Self {
            generation,
            occupied: false,
            data: Vec::new(),
            read_offset: 0,
            write_offset: 0,
            code: 0,
        }
    }
}

/// Arena-style allocator for buffers, grounded on `prx_buffer`'s dynamic
/// pool in the original implementation. Not a general-purpose allocator:
/// buffers are always sized up front and returned to the pool on release.
pub struct BufferPool {
    name: String,
    slots: Mutex<Vec<Slot>>,
    free_list: Mutex<Vec<usize>>,
}

impl BufferPool {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            slots: Mutex::new(Vec::new()),
            free_list: Mutex::new(Vec::new()),
        }
    }

    /// Allocate a buffer of `length` bytes, optionally pre-filled with
    /// `initial`. Mirrors `create_buffer`'s optional initial payload write.
    pub fn create(&self, length: usize, initial: Option<&[u8]>) -> BufferHandle {
        let mut data = vec![0u8; length];
        let mut written = 0;
        if let Some(initial) = initial {
            written = initial.len().min(length);
            data[..written].copy_from_slice(&initial[..written]);
        }

        let mut free_list = self.free_list.lock().unwrap();
        let mut slots = self.slots.lock().unwrap();

        let handle = if let Some(index) = free_list.pop() {
            let slot = &mut slots[index];
            slot.generation += 1;
            slot.occupied = true;
            slot.data = data;
            slot.read_offset = 0;
            slot.write_offset = written;
            slot.code = 0;
            BufferHandle {
                index,
                generation: slot.generation,
            }
        } else {
            let index = slots.len();
            slots.push(Slot {
                generation: 0,
                occupied: true,
                data,
                read_offset: 0,
                write_offset: written,
                code: 0,
            });
            BufferHandle {
                index,
                generation: 0,
            }
        };

        trace!(
            "pool '{}': allocated buffer {:?} ({} bytes)",
            self.name,
            handle,
            length
        );
        handle
    }

    /// Grow or shrink a buffer in place, preserving its existing bytes.
    /// Mirrors the original allocator's realloc, which may hand back a
    /// different backing pointer; the returned handle replaces `handle`,
    /// which is no longer valid against this pool.
    pub fn resize(&self, handle: BufferHandle, new_size: usize) -> Option<BufferHandle> {
        let mut slots = self.slots.lock().unwrap();
        let slot = slots.get_mut(handle.index)?;
        if !slot.occupied || slot.generation != handle.generation {
            return None;
        }

        slot.data.resize(new_size, 0);
        slot.read_offset = slot.read_offset.min(new_size);
        slot.write_offset = slot.write_offset.min(new_size);
        slot.generation += 1;

        let new_handle = BufferHandle {
            index: handle.index,
            generation: slot.generation,
        };
        trace!(
            "pool '{}': resized buffer {:?} -> {:?} ({} bytes)",
            self.name,
            handle,
            new_handle,
            new_size
        );
        Some(new_handle)
    }

    /// Return a buffer to the pool. The handle becomes invalid; any later
    /// use of it against this pool returns `None`/panics on access helpers.
    pub fn release(&self, handle: BufferHandle) {
        let mut slots = self.slots.lock().unwrap();
        if let Some(slot) = slots.get_mut(handle.index) {
            if slot.occupied && slot.generation == handle.generation {
                slot.occupied = false;
                slot.data = Vec::new();
                self.free_list.lock().unwrap().push(handle.index);
                trace!("pool '{}': released buffer {:?}", self.name, handle);
            }
        }
    }

    fn with_slot<T>(&self, handle: BufferHandle, f: impl FnOnce(&Slot) -> T) -> Option<T> {
        let slots = self.slots.lock().unwrap();
        slots
            .get(handle.index)
            .filter(|s| s.occupied && s.generation == handle.generation)
            .map(f)
    }

    fn with_slot_mut<T>(&self, handle: BufferHandle, f: impl FnOnce(&mut Slot) -> T) -> Option<T> {
        let mut slots = self.slots.lock().unwrap();
        slots
            .get_mut(handle.index)
            .filter(|s| s.occupied && s.generation == handle.generation)
            .map(f)
    }

    pub fn len(&self, handle: BufferHandle) -> usize {
        self.with_slot(handle, |s| s.data.len()).unwrap_or(0)
    }

    pub fn is_empty(&self, handle: BufferHandle) -> bool {
        self.len(handle) == 0
    }

    pub fn code(&self, handle: BufferHandle) -> i32 {
        self.with_slot(handle, |s| s.code).unwrap_or(0)
    }

    pub fn set_code(&self, handle: BufferHandle, code: i32) {
        self.with_slot_mut(handle, |s| s.code = code);
    }

    /// A [`BufferStream`] view bound to this handle's read/write cursors.
    /// Cursors are never reset by state transitions (see [`IoQueue`]).
    pub fn as_stream(&self, handle: BufferHandle) -> BufferStream<'_> {
        BufferStream::new(self, handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resize_grows_and_preserves_bytes() {
        let pool = BufferPool::new("test");
        let handle = pool.create(4, Some(b"abcd"));

        let grown = pool.resize(handle, 8).unwrap();
        assert_eq!(pool.len(grown), 8);

        let stream = pool.as_stream(grown);
        let mut out = [0u8; 4];
        assert_eq!(stream.read(&mut out), 4);
        assert_eq!(&out, b"abcd");
    }

    #[test]
    fn resize_shrinks_and_clamps_cursors() {
        let pool = BufferPool::new("test");
        let handle = pool.create(8, Some(b"abcdefgh"));

        let shrunk = pool.resize(handle, 2).unwrap();
        assert_eq!(pool.len(shrunk), 2);
    }

    #[test]
    fn resize_of_unknown_handle_returns_none() {
        let pool = BufferPool::new("test");
        let handle = pool.create(4, None);
        pool.release(handle);

        assert_eq!(pool.resize(handle, 8), None);
    }
}
