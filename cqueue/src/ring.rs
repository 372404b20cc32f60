use std::cell::UnsafeCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard, Notify};

const MAGIC: u32 = 0xDEAD_BABE;

/// Slot header: `next` offset (8) + `wraps` flag (1) + payload length (4).
const SLOT_HDR: usize = 13;

/// Invoked on each drained slot payload before its space is released.
pub type PopFn = Box<dyn Fn(&[u8]) + Send + Sync>;
/// Replaces the default copy of a pushed payload into the arena.
pub type CpyFn = Box<dyn Fn(&mut [u8], &[u8]) + Send + Sync>;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("item size {len} exceeds queue size {size}")]
    TooLarge { len: usize, size: usize },
    #[error("queue is closed")]
    Closed,
    #[error("queue is not initialized")]
    BadMagic,
    #[error("queue already has a consumer")]
    ConsumerTaken,
}

/// A fixed-size byte arena with monotonically increasing head/tail/cursor
/// offsets. Producers serialize on the head lock; the single consumer reads
/// between `tail` and `head` without locking. Payloads never straddle the
/// physical end of the arena: a push that would wrap skips the trailing
/// bytes as dead space and writes its payload at offset zero, with the
/// slot's `wraps` flag telling the consumer where to look.
pub struct RingBuffer {
    magic: u32,
    size: usize,
    buf: UnsafeCell<Box<[u8]>>,
    head: AtomicU64,
    tail: AtomicU64,
    cursor: AtomicU64,
    head_lock: Mutex<()>,
    ext_lock: Option<Arc<Mutex<()>>>,
    producer_latch: Notify,
    consumer_latch: Notify,
    closed: AtomicBool,
    consumer_taken: AtomicBool,
    pop_fn: Option<PopFn>,
    cpy_fn: Option<CpyFn>,
}

// Producers only touch [head, head+len) while holding the head lock; the
// consumer only touches [tail, head). The ranges are disjoint, so sharing
// the arena across threads is sound.
unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// Creates a queue with `size` usable bytes and its own embedded head
    /// lock. The arena reserves one slot header past the end so a header
    /// written near the boundary never overflows.
    pub fn new(size: usize) -> Arc<Self> {
        Self::build(size, None, None, None)
    }

    /// Creates a queue whose head-side mutual exclusion is an external lock
    /// shared with other queues.
    pub fn with_ext_lock(size: usize, lock: Arc<Mutex<()>>) -> Arc<Self> {
        Self::build(size, Some(lock), None, None)
    }

    /// Creates a queue with custom copy/free hooks.
    pub fn with_handlers(size: usize, pop_fn: Option<PopFn>, cpy_fn: Option<CpyFn>) -> Arc<Self> {
        Self::build(size, None, pop_fn, cpy_fn)
    }

    fn build(
        size: usize,
        ext_lock: Option<Arc<Mutex<()>>>,
        pop_fn: Option<PopFn>,
        cpy_fn: Option<CpyFn>,
    ) -> Arc<Self> {
        assert!(size > SLOT_HDR, "queue size too small");
        let buf = vec![0u8; size + SLOT_HDR].into_boxed_slice();
        Arc::new(Self {
            magic: MAGIC,
            size,
            buf: UnsafeCell::new(buf),
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
            cursor: AtomicU64::new(0),
            head_lock: Mutex::new(()),
            ext_lock,
            producer_latch: Notify::new(),
            consumer_latch: Notify::new(),
            closed: AtomicBool::new(false),
            consumer_taken: AtomicBool::new(false),
            pop_fn,
            cpy_fn,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.tail.load(Ordering::Acquire)
    }

    pub fn has_unread(&self) -> bool {
        self.head.load(Ordering::Acquire) > self.cursor.load(Ordering::Acquire)
    }

    /// Marks the queue dead: blocked producers fail their push, a sleeping
    /// consumer wakes up.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.producer_latch.notify_waiters();
        self.consumer_latch.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn offset(&self, ptr: u64) -> usize {
        (ptr % self.size as u64) as usize
    }

    fn needs_wrap(&self, start: u64, len: usize) -> bool {
        self.offset(start) + len > self.size
    }

    fn arena(&self) -> *mut u8 {
        unsafe { (*self.buf.get()).as_mut_ptr() }
    }

    fn write_slot_header(&self, at: usize, next: u64, wraps: bool, len: usize) {
        let ptr = self.arena();
        unsafe {
            std::ptr::copy_nonoverlapping(next.to_le_bytes().as_ptr(), ptr.add(at), 8);
            *ptr.add(at + 8) = u8::from(wraps);
            std::ptr::copy_nonoverlapping(
                (len as i32).to_le_bytes().as_ptr(),
                ptr.add(at + 9),
                4,
            );
        }
    }

    fn read_slot_header(&self, at: usize) -> (u64, bool, usize) {
        let ptr = self.arena();
        unsafe {
            let mut next = [0u8; 8];
            std::ptr::copy_nonoverlapping(ptr.add(at), next.as_mut_ptr(), 8);
            let wraps = *ptr.add(at + 8) != 0;
            let mut len = [0u8; 4];
            std::ptr::copy_nonoverlapping(ptr.add(at + 9), len.as_mut_ptr(), 4);
            (
                u64::from_le_bytes(next),
                wraps,
                i32::from_le_bytes(len) as usize,
            )
        }
    }

    /// Acquires head-side mutual exclusion for a batch of pushes.
    pub async fn lock_head(&self) -> HeadLock<'_> {
        let guard = match &self.ext_lock {
            Some(lock) => lock.lock().await,
            None => self.head_lock.lock().await,
        };
        HeadLock {
            queue: self,
            _guard: guard,
        }
    }

    /// Non-blocking head lock acquisition.
    pub fn lock_head_nowait(&self) -> Option<HeadLock<'_>> {
        let guard = match &self.ext_lock {
            Some(lock) => lock.try_lock().ok()?,
            None => self.head_lock.try_lock().ok()?,
        };
        Some(HeadLock {
            queue: self,
            _guard: guard,
        })
    }

    /// Pushes one payload, taking and releasing the head lock around it.
    pub async fn push(&self, data: &[u8]) -> Result<(), QueueError> {
        let lock = self.lock_head().await;
        lock.push(data).await
    }

    async fn push_locked(&self, data: &[u8]) -> Result<(), QueueError> {
        let len = data.len();
        let mut len_needed = SLOT_HDR + len;
        if len_needed > self.size {
            return Err(QueueError::TooLarge {
                len,
                size: self.size,
            });
        }

        let head = self.head.load(Ordering::Acquire);

        // Wrapping wastes the dead space at the physical end instead of
        // splitting the payload into two regions.
        let wraps = self.needs_wrap(head, len_needed);
        if wraps {
            len_needed = len + (self.size - self.offset(head));
        }

        loop {
            let tail = self.tail.load(Ordering::Acquire);
            let space_used = (head - tail) as usize;
            if self.size - space_used >= len_needed {
                break;
            }
            if self.is_closed() {
                return Err(QueueError::Closed);
            }
            // register interest before re-checking so a concurrent pop_seen
            // cannot slip between the check and the wait
            let waiter = self.producer_latch.notified();
            let tail = self.tail.load(Ordering::Acquire);
            if self.size - (head - tail) as usize >= len_needed {
                break;
            }
            waiter.await;
        }

        let at = self.offset(head);
        let next = head + len_needed as u64;
        self.write_slot_header(at, next, wraps, len);

        let payload_at = if wraps { 0 } else { at + SLOT_HDR };
        let ptr = self.arena();
        match &self.cpy_fn {
            Some(cpy) => {
                let dest = unsafe { std::slice::from_raw_parts_mut(ptr.add(payload_at), len) };
                cpy(dest, data);
            }
            None => unsafe {
                std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(payload_at), len);
            },
        }

        self.head.store(next, Ordering::Release);
        self.consumer_latch.notify_one();
        Ok(())
    }

    /// Hands out the queue's single consumer handle. Fails if one was
    /// already taken or the arena header is corrupt.
    pub fn attach_consumer(self: &Arc<Self>) -> Result<Consumer, QueueError> {
        if self.magic != MAGIC {
            return Err(QueueError::BadMagic);
        }
        if self.consumer_taken.swap(true, Ordering::AcqRel) {
            return Err(QueueError::ConsumerTaken);
        }
        Ok(Consumer {
            queue: Arc::clone(self),
        })
    }
}

/// RAII head lock; pushes through this guard run without re-locking.
pub struct HeadLock<'a> {
    queue: &'a RingBuffer,
    _guard: MutexGuard<'a, ()>,
}

impl HeadLock<'_> {
    pub async fn push(&self, data: &[u8]) -> Result<(), QueueError> {
        self.queue.push_locked(data).await
    }
}

/// The queue's single logical consumer. Exclusive by construction, so the
/// peek/pop path never locks.
pub struct Consumer {
    queue: Arc<RingBuffer>,
}

impl Consumer {
    pub fn queue(&self) -> &Arc<RingBuffer> {
        &self.queue
    }

    /// Returns the payload at the cursor and advances the cursor past it.
    /// The slice borrows the arena; it stays valid until `pop_seen`.
    pub fn peek_next(&mut self) -> Option<&[u8]> {
        if !self.queue.has_unread() {
            return None;
        }
        let cursor = self.queue.cursor.load(Ordering::Acquire);
        let (next, wraps, len) = self.queue.read_slot_header(self.queue.offset(cursor));
        let payload_at = if wraps {
            0
        } else {
            self.queue.offset(cursor) + SLOT_HDR
        };
        self.queue.cursor.store(next, Ordering::Release);
        let ptr = self.queue.arena();
        Some(unsafe { std::slice::from_raw_parts(ptr.add(payload_at), len) })
    }

    /// Releases every slot between `tail` and the cursor, invoking the pop
    /// hook on each payload, then wakes a blocked producer.
    pub fn pop_seen(&mut self) {
        let tail = self.queue.tail.load(Ordering::Acquire);
        let cursor = self.queue.cursor.load(Ordering::Acquire);
        debug_assert!(tail <= cursor);

        if let Some(pop) = &self.queue.pop_fn {
            let mut start = tail;
            while start < cursor {
                let at = self.queue.offset(start);
                let (next, wraps, len) = self.queue.read_slot_header(at);
                let payload_at = if wraps { 0 } else { at + SLOT_HDR };
                let ptr = self.queue.arena();
                let payload = unsafe { std::slice::from_raw_parts(ptr.add(payload_at), len) };
                pop(payload);
                start = next;
            }
        }

        #[cfg(debug_assertions)]
        self.clobber_range(tail, cursor);

        // tail must move before the latch fires, or the producer could wake
        // and still observe the stale tail
        self.queue.tail.store(cursor, Ordering::Release);
        self.queue.producer_latch.notify_one();
    }

    /// Blocks until the queue has at least one unconsumed slot.
    pub async fn sleep_if_empty(&self) -> Result<(), QueueError> {
        let tail = self.queue.tail.load(Ordering::Acquire);
        loop {
            if self.queue.head.load(Ordering::Acquire) > tail {
                return Ok(());
            }
            if self.queue.is_closed() {
                return Err(QueueError::Closed);
            }
            let waiter = self.queue.consumer_latch.notified();
            if self.queue.head.load(Ordering::Acquire) > tail {
                return Ok(());
            }
            waiter.await;
        }
    }

    /// Waits until the cursor has unread slots ahead of it, bounded by
    /// `timeout`. Returns whether data is available. Unlike
    /// `sleep_if_empty`, this keeps working mid-batch, before drained slots
    /// have been released.
    pub async fn wait_unread(&self, timeout: std::time::Duration) -> Result<bool, QueueError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.queue.has_unread() {
                return Ok(true);
            }
            if self.queue.is_closed() {
                return Err(QueueError::Closed);
            }
            let waiter = self.queue.consumer_latch.notified();
            if self.queue.has_unread() {
                return Ok(true);
            }
            if tokio::time::timeout_at(deadline, waiter).await.is_err() {
                return Ok(self.queue.has_unread());
            }
        }
    }

    #[cfg(debug_assertions)]
    fn clobber_range(&self, tail: u64, cursor: u64) {
        let cursor_off = self.queue.offset(cursor);
        let tail_off = self.queue.offset(tail);
        let ptr = self.queue.arena();
        unsafe {
            if tail_off > cursor_off {
                std::ptr::write_bytes(ptr, 0x7f, cursor_off);
                std::ptr::write_bytes(ptr.add(tail_off), 0x7f, self.queue.size - tail_off);
            } else {
                std::ptr::write_bytes(ptr.add(tail_off), 0x7f, cursor_off - tail_off);
            }
        }
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.queue.consumer_taken.store(false, Ordering::Release);
    }
}
