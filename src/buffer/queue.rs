use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use super::BufferHandle;

/// Which of the three queue states a buffer currently occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Ready,
    InProgress,
    Done,
}

pub type AbortCallback = Box<dyn FnOnce(BufferHandle, i32) + Send>;

struct Inner {
    ready: VecDeque<BufferHandle>,
    in_progress: VecDeque<BufferHandle>,
    done: VecDeque<BufferHandle>,
    callbacks: HashMap<BufferHandle, AbortCallback>,
}

/// Tri-state buffer queue (component B): every queued buffer is in exactly
/// one of `ready`, `in_progress`, or `done`, guarded by a single mutex.
///
/// Grounded on `io_queue_state_push/peek/pop`, `io_queue_rollback`, and
/// `io_queue_abort` in the original implementation. The original's
/// intrusive `DLIST_ENTRY` links are replaced by plain `VecDeque`s since
/// safe Rust has no use for the raw links.
pub struct IoQueue {
    name: String,
    inner: Mutex<Inner>,
}

impl IoQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(Inner {
                ready: VecDeque::new(),
                in_progress: VecDeque::new(),
                done: VecDeque::new(),
                callbacks: HashMap::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Unlink `handle` from whichever of the three lists currently holds
    /// it, if any.
    fn unlink(inner: &mut Inner, handle: BufferHandle) {
        inner.ready.retain(|h| *h != handle);
        inner.in_progress.retain(|h| *h != handle);
        inner.done.retain(|h| *h != handle);
    }

    /// Unlink `handle` from its current list (if any) and append it to
    /// ready. An optional callback fires at most once, either when the
    /// buffer is aborted or when it is explicitly completed via
    /// [`IoQueue::complete`]. Used both to hand a freshly created buffer to
    /// the queue and to requeue one (e.g. a send retry).
    pub fn push_ready(&self, handle: BufferHandle, callback: Option<AbortCallback>) {
        let mut inner = self.inner.lock().unwrap();
        Self::unlink(&mut inner, handle);
        inner.ready.push_back(handle);
        if let Some(cb) = callback {
            inner.callbacks.insert(handle, cb);
        }
    }

    pub fn has_ready(&self) -> bool {
        !self.inner.lock().unwrap().ready.is_empty()
    }

    /// Pop the first ready buffer and move it to in-progress.
    pub fn pop_ready(&self) -> Option<BufferHandle> {
        let mut inner = self.inner.lock().unwrap();
        let handle = inner.ready.pop_front()?;
        inner.in_progress.push_back(handle);
        Some(handle)
    }

    /// Unlink `handle` from its current list (if any) and append it to
    /// in-progress. Used to put a retried buffer back at the head of the
    /// queue it is being retried from, preserving its prior position.
    pub fn push_in_progress(&self, handle: BufferHandle) {
        let mut inner = self.inner.lock().unwrap();
        Self::unlink(&mut inner, handle);
        inner.in_progress.push_front(handle);
    }

    pub fn has_in_progress(&self) -> bool {
        !self.inner.lock().unwrap().in_progress.is_empty()
    }

    pub fn pop_in_progress(&self) -> Option<BufferHandle> {
        let mut inner = self.inner.lock().unwrap();
        let handle = inner.in_progress.pop_front()?;
        Some(handle)
    }

    pub fn has_done(&self) -> bool {
        !self.inner.lock().unwrap().done.is_empty()
    }

    pub fn pop_done(&self) -> Option<BufferHandle> {
        let mut inner = self.inner.lock().unwrap();
        inner.done.pop_front()
    }

    /// Unlink `handle` from its current list (if any) and append it to
    /// done, without touching its callback. Pure state transition; use
    /// [`IoQueue::complete`] instead when the abort/completion callback
    /// should also fire.
    pub fn push_done(&self, handle: BufferHandle) {
        let mut inner = self.inner.lock().unwrap();
        Self::unlink(&mut inner, handle);
        inner.done.push_back(handle);
    }

    /// Put a buffer back at the front of done, for a partial read/write that
    /// leaves bytes queued for the next call.
    pub fn push_done_front(&self, handle: BufferHandle) {
        let mut inner = self.inner.lock().unwrap();
        Self::unlink(&mut inner, handle);
        inner.done.push_front(handle);
    }

    /// Unlink `handle` from whichever list holds it and drop its callback
    /// without firing it.
    pub fn release(&self, handle: BufferHandle) {
        let mut inner = self.inner.lock().unwrap();
        Self::unlink(&mut inner, handle);
        inner.callbacks.remove(&handle);
    }

    /// Move an in-progress buffer into done, firing and clearing its
    /// callback if one is registered.
    pub fn complete(&self, handle: BufferHandle, code: i32) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(pos) = inner.in_progress.iter().position(|h| *h == handle) {
            inner.in_progress.remove(pos);
        }
        inner.done.push_back(handle);
        if let Some(cb) = inner.callbacks.remove(&handle) {
            drop(inner);
            cb(handle, code);
        }
    }

    /// Move all in-progress buffers back to the front of ready, preserving
    /// their relative order. Mirrors `io_queue_rollback`'s
    /// `DList_AppendTailList(queue->ready.Flink, &queue->inprogress)`.
    pub fn rollback(&self) {
        let mut inner = self.inner.lock().unwrap();
        let in_progress = std::mem::take(&mut inner.in_progress);
        for handle in in_progress.into_iter().rev() {
            inner.ready.push_front(handle);
        }
    }

    /// Fire every registered callback across all three lists without
    /// unlinking the buffers, clearing each callback slot so it fires at
    /// most once. Mirrors `io_queue_abort`/`state_abort_no_lock`.
    pub fn abort(&self, code: i32) {
        let callbacks: Vec<(BufferHandle, AbortCallback)> = {
            let mut inner = self.inner.lock().unwrap();
            inner.callbacks.drain().collect()
        };
        for (handle, cb) in callbacks {
            cb(handle, code);
        }
    }

    /// Drop all buffers from all three lists, firing any pending
    /// callbacks first. Mirrors `io_queue_release_all_buffers`.
    pub fn clear(&self, code: i32) {
        self.abort(code);
        let mut inner = self.inner.lock().unwrap();
        inner.ready.clear();
        inner.in_progress.clear();
        inner.done.clear();
    }

    pub fn state_of(&self, handle: BufferHandle) -> Option<QueueState> {
        let inner = self.inner.lock().unwrap();
        if inner.ready.contains(&handle) {
            Some(QueueState::Ready)
        } else if inner.in_progress.contains(&handle) {
            Some(QueueState::InProgress)
        } else if inner.done.contains(&handle) {
            Some(QueueState::Done)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPool;

    #[test]
    fn rollback_preserves_order() {
        let pool = BufferPool::new("test");
        let queue = IoQueue::new("test");

        let a = pool.create(4, None);
        let b = pool.create(4, None);
        let c = pool.create(4, None);

        queue.push_ready(a, None);
        queue.push_ready(b, None);
        queue.push_ready(c, None);

        assert_eq!(queue.pop_ready(), Some(a));
        assert_eq!(queue.pop_ready(), Some(b));
        assert!(queue.has_in_progress());

        queue.rollback();

        assert_eq!(queue.pop_ready(), Some(a));
        assert_eq!(queue.pop_ready(), Some(b));
        assert_eq!(queue.pop_ready(), Some(c));
    }

    #[test]
    fn abort_fires_callback_at_most_once() {
        let pool = BufferPool::new("test");
        let queue = IoQueue::new("test");
        let handle = pool.create(4, None);

        let fired = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let fired2 = fired.clone();
        queue.push_ready(
            handle,
            Some(Box::new(move |_h, _code| {
                fired2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            })),
        );

        queue.abort(-1);
        queue.abort(-1);

        assert_eq!(fired.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn complete_moves_to_done_and_fires_callback() {
        let pool = BufferPool::new("test");
        let queue = IoQueue::new("test");
        let handle = pool.create(4, None);

        queue.push_ready(handle, None);
        queue.pop_ready();
        queue.complete(handle, 0);

        assert!(queue.has_done());
        assert_eq!(queue.pop_done(), Some(handle));
    }
}
