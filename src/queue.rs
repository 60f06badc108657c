// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The message queue: a bounded ring of fixed-stride slots in a named
// shared memory segment, coordinated through the process-shared mutex and
// condition variables embedded in the segment header.
//
// Every operation takes the mutex, inspects and updates the header
// counters, touches slot storage, signals a condition variable and
// releases. Waits loop on (queue state && !stopped), so spurious wakeups
// and concurrent stop() are both handled by re-testing.

use std::mem;
use std::ptr;
use std::sync::atomic::Ordering;

use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::header::{self, QueueHeader, MAGIC, SLOT_SIZE_PREFIX, VERSION};
use crate::name;
use crate::perms::Permissions;
use crate::platform::{adaptive_yield, QueueSync};
use crate::segment::Segment;

/// Bound on the creator-publication wait when opening a segment that some
/// other process is still initializing.
const MAGIC_WAIT_SPINS: u32 = 4096;

/// Reference count value marking a queue whose last handle is tearing it
/// down. Openers that observe it must not revive the segment.
const REF_TOMBSTONE: u32 = u32::MAX;

/// A named, bounded, interprocess message queue in shared memory.
///
/// Handles are move-only; the underlying queue is shared by every handle
/// of the same name across all processes. Queue operations (`send`,
/// `try_send`, `receive`, `try_receive`, `clear`, `stop`, `reset`) may be
/// called concurrently from any number of threads and processes. `close`
/// (and `Drop`) must not run while another thread of this process is
/// blocked in an operation on the *same handle*; call [`stop`] and join
/// those threads first.
///
/// [`stop`]: MessageQueue::stop
pub struct MessageQueue {
    inner: Option<Inner>,
}

struct Inner {
    // Declared before `segment`: the sync handles must drop while the
    // mapping is still alive.
    sync: QueueSync,
    segment: Segment,
    name: String,
    max_queue_size: u32,
    max_message_size: u32,
    slot_stride: u32,
}

// Safety: all shared state lives in the mapped segment and is guarded by
// the embedded process-shared primitives; the per-handle fields are
// immutable after construction.
unsafe impl Send for MessageQueue {}
unsafe impl Sync for MessageQueue {}

impl MessageQueue {
    /// Create a new queue, failing if one with this name already exists.
    ///
    /// `max_queue_size` is the number of messages the queue can hold and
    /// must be at least 1; `max_message_size` is the largest message in
    /// bytes (zero-length messages are always allowed). `perms` applies to
    /// the underlying OS object at creation only.
    pub fn create(
        name: &str,
        max_queue_size: u32,
        max_message_size: u32,
        perms: &Permissions,
    ) -> Result<Self> {
        name::validate(name)?;
        assert!(max_queue_size > 0, "max_queue_size must be at least 1");

        let slot_stride = header::slot_stride(max_message_size);
        let size = header::segment_size(max_queue_size, slot_stride);
        let segment = Segment::create(name, size, perms)?;
        Self::from_created_segment(segment, name, max_queue_size, max_message_size, slot_stride)
    }

    /// Create the queue, or open it if it already exists. When opening,
    /// the caller's `max_queue_size`/`max_message_size` are ignored and
    /// the values stored in the segment header prevail.
    pub fn open_or_create(
        name: &str,
        max_queue_size: u32,
        max_message_size: u32,
        perms: &Permissions,
    ) -> Result<Self> {
        name::validate(name)?;
        assert!(max_queue_size > 0, "max_queue_size must be at least 1");

        let slot_stride = header::slot_stride(max_message_size);
        let size = header::segment_size(max_queue_size, slot_stride);
        let (segment, created) = Segment::open_or_create(name, size, perms)?;
        if created {
            Self::from_created_segment(segment, name, max_queue_size, max_message_size, slot_stride)
        } else {
            Self::from_opened_segment(segment, name)
        }
    }

    /// Open an existing queue, failing if it does not exist.
    pub fn open(name: &str) -> Result<Self> {
        name::validate(name)?;
        let segment = Segment::open(name)?;
        Self::from_opened_segment(segment, name)
    }

    fn from_created_segment(
        segment: Segment,
        name: &str,
        max_queue_size: u32,
        max_message_size: u32,
        slot_stride: u32,
    ) -> Result<Self> {
        let hdr = segment.base() as *mut QueueHeader;
        let sync = unsafe {
            match init_header(hdr, name, max_queue_size, max_message_size, slot_stride) {
                Ok(sync) => sync,
                Err(e) => {
                    segment.unlink();
                    return Err(e.into());
                }
            }
        };
        debug!(name, max_queue_size, max_message_size, "created message queue");
        Ok(Self {
            inner: Some(Inner {
                sync,
                segment,
                name: name.to_string(),
                max_queue_size,
                max_message_size,
                slot_stride,
            }),
        })
    }

    fn from_opened_segment(segment: Segment, name: &str) -> Result<Self> {
        if segment.size() < mem::size_of::<QueueHeader>() {
            return Err(Error::Incompatible("segment smaller than a queue header"));
        }
        let hdr = segment.base() as *mut QueueHeader;
        unsafe {
            wait_for_magic(hdr)?;
            if ptr::addr_of!((*hdr).version).read() != VERSION {
                return Err(Error::Incompatible("unsupported layout version"));
            }
            let max_queue_size = ptr::addr_of!((*hdr).max_queue_size).read();
            let max_message_size = ptr::addr_of!((*hdr).max_message_size).read();
            let slot_stride = ptr::addr_of!((*hdr).slot_stride).read();
            if max_queue_size == 0
                || max_message_size > header::MAX_MESSAGE_SIZE_LIMIT
                || slot_stride != header::slot_stride(max_message_size)
            {
                return Err(Error::Incompatible("inconsistent header geometry"));
            }
            if segment.size() < header::segment_size(max_queue_size, slot_stride) {
                return Err(Error::Incompatible("segment smaller than its header claims"));
            }

            // Join the segment's reference count, refusing to revive a
            // queue whose last handle is concurrently tearing it down.
            let mut refs = (*hdr).ref_count.load(Ordering::Acquire);
            loop {
                if refs == REF_TOMBSTONE || refs == 0 {
                    return Err(Error::NotFound);
                }
                match (*hdr).ref_count.compare_exchange(
                    refs,
                    refs + 1,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => break,
                    Err(cur) => refs = cur,
                }
            }

            let sync = match QueueSync::attach(name, ptr::addr_of_mut!((*hdr).sync)) {
                Ok(sync) => sync,
                Err(e) => {
                    (*hdr).ref_count.fetch_sub(1, Ordering::AcqRel);
                    return Err(e.into());
                }
            };
            debug!(name, max_queue_size, max_message_size, "opened message queue");
            Ok(Self {
                inner: Some(Inner {
                    sync,
                    segment,
                    name: name.to_string(),
                    max_queue_size,
                    max_message_size,
                    slot_stride,
                }),
            })
        }
    }

    /// Whether this handle is associated with a queue.
    pub fn is_open(&self) -> bool {
        self.inner.is_some()
    }

    /// Name the queue was created or opened with.
    pub fn name(&self) -> &str {
        &self.inner().name
    }

    /// Maximum number of messages the queue can hold. For an opened queue
    /// this is the creator's value, not the one passed to
    /// [`open_or_create`](MessageQueue::open_or_create).
    pub fn max_queue_size(&self) -> u32 {
        self.inner().max_queue_size
    }

    /// Maximum message size in bytes allowed by the queue.
    pub fn max_message_size(&self) -> u32 {
        self.inner().max_message_size
    }

    /// Send a message, blocking while the queue is full.
    ///
    /// Returns `Ok(true)` on success and `Ok(false)` when interrupted:
    /// once [`stop`](MessageQueue::stop) has been called (by any handle in
    /// any process), blocked senders return `false` and subsequent calls
    /// return `false` immediately until [`reset`](MessageQueue::reset).
    /// An empty message is valid.
    ///
    /// # Panics
    /// If the handle is not open, or `msg.len()` exceeds
    /// [`max_message_size`](MessageQueue::max_message_size).
    pub fn send(&self, msg: &[u8]) -> Result<bool> {
        let inner = self.inner();
        assert!(
            msg.len() <= inner.max_message_size as usize,
            "message of {} bytes exceeds max_message_size {}",
            msg.len(),
            inner.max_message_size
        );
        inner.enqueue(msg, true)
    }

    /// Send without blocking. Returns `Ok(false)` when the queue is full
    /// or stopped.
    ///
    /// # Panics
    /// As [`send`](MessageQueue::send).
    pub fn try_send(&self, msg: &[u8]) -> Result<bool> {
        let inner = self.inner();
        assert!(
            msg.len() <= inner.max_message_size as usize,
            "message of {} bytes exceeds max_message_size {}",
            msg.len(),
            inner.max_message_size
        );
        inner.enqueue(msg, false)
    }

    /// Receive a message into `buf`, blocking while the queue is empty.
    ///
    /// Returns `Ok(Some(n))` with the message size on success (the first
    /// `n` bytes of `buf` hold the payload; `n` may be 0) and `Ok(None)`
    /// when interrupted by [`stop`](MessageQueue::stop).
    ///
    /// # Panics
    /// If the handle is not open, or `buf.len()` is smaller than
    /// [`max_message_size`](MessageQueue::max_message_size).
    pub fn receive(&self, buf: &mut [u8]) -> Result<Option<usize>> {
        let inner = self.inner();
        assert!(
            buf.len() >= inner.max_message_size as usize,
            "receive buffer of {} bytes is smaller than max_message_size {}",
            buf.len(),
            inner.max_message_size
        );
        inner.dequeue(buf, true)
    }

    /// Receive without blocking. Returns `Ok(None)` when the queue is
    /// empty or stopped.
    ///
    /// # Panics
    /// As [`receive`](MessageQueue::receive).
    pub fn try_receive(&self, buf: &mut [u8]) -> Result<Option<usize>> {
        let inner = self.inner();
        assert!(
            buf.len() >= inner.max_message_size as usize,
            "receive buffer of {} bytes is smaller than max_message_size {}",
            buf.len(),
            inner.max_message_size
        );
        inner.dequeue(buf, false)
    }

    /// Discard all queued messages and wake blocked senders.
    ///
    /// # Panics
    /// If the handle is not open.
    pub fn clear(&self) -> Result<()> {
        let inner = self.inner();
        let hdr = inner.hdr();
        inner.sync.lock()?;
        unsafe {
            (*hdr).count = 0;
            (*hdr).head = 0;
            (*hdr).tail = 0;
        }
        let woken = inner.sync.broadcast_not_full();
        inner.sync.unlock()?;
        woken?;
        trace!(name = %inner.name, "cleared message queue");
        Ok(())
    }

    /// Put the queue in stopped state: every blocked sender and receiver
    /// wakes up and returns unsuccessfully, and subsequent blocking calls
    /// return unsuccessfully right away. Does not wait for the woken
    /// threads to actually return. Undone by [`reset`](MessageQueue::reset).
    ///
    /// # Panics
    /// If the handle is not open.
    pub fn stop(&self) -> Result<()> {
        let inner = self.inner();
        let hdr = inner.hdr();
        inner.sync.lock()?;
        unsafe {
            (*hdr).stopped = 1;
        }
        let senders = inner.sync.broadcast_not_full();
        let receivers = inner.sync.broadcast_not_empty();
        inner.sync.unlock()?;
        senders?;
        receivers?;
        trace!(name = %inner.name, "stopped message queue");
        Ok(())
    }

    /// Put the queue back in running state, re-enabling blocking.
    ///
    /// # Panics
    /// If the handle is not open.
    pub fn reset(&self) -> Result<()> {
        let inner = self.inner();
        let hdr = inner.hdr();
        inner.sync.lock()?;
        unsafe {
            (*hdr).stopped = 0;
        }
        inner.sync.unlock()?;
        trace!(name = %inner.name, "reset message queue");
        Ok(())
    }

    /// Disassociate from the queue. The queue itself is destroyed when the
    /// last handle across all processes closes. Safe to call on an already
    /// closed handle; also runs on `Drop`.
    ///
    /// No thread may be inside a blocking call on this handle; use
    /// [`stop`](MessageQueue::stop) and join them first.
    pub fn close(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.close();
        }
    }

    fn inner(&self) -> &Inner {
        self.inner
            .as_ref()
            .expect("message queue handle is not open")
    }
}

impl Drop for MessageQueue {
    fn drop(&mut self) {
        self.close();
    }
}

impl Inner {
    fn hdr(&self) -> *mut QueueHeader {
        self.segment.base() as *mut QueueHeader
    }

    fn enqueue(&self, msg: &[u8], block: bool) -> Result<bool> {
        let hdr = self.hdr();
        self.sync.lock()?;
        unsafe {
            if block {
                while (*hdr).count == self.max_queue_size && (*hdr).stopped == 0 {
                    if let Err(e) = self.sync.wait_not_full() {
                        let _ = self.sync.unlock();
                        return Err(e.into());
                    }
                }
            } else if (*hdr).count == self.max_queue_size {
                self.sync.unlock()?;
                return Ok(false);
            }
            if (*hdr).stopped != 0 {
                self.sync.unlock()?;
                return Ok(false);
            }

            let slot = header::slot_ptr(self.segment.base(), (*hdr).tail, self.slot_stride);
            let len = (msg.len() as u32).to_le_bytes();
            ptr::copy_nonoverlapping(len.as_ptr(), slot, SLOT_SIZE_PREFIX);
            if !msg.is_empty() {
                ptr::copy_nonoverlapping(msg.as_ptr(), slot.add(SLOT_SIZE_PREFIX), msg.len());
            }
            (*hdr).tail = next_index((*hdr).tail, self.max_queue_size);
            (*hdr).count += 1;
        }
        let signalled = self.sync.signal_not_empty();
        self.sync.unlock()?;
        signalled?;
        Ok(true)
    }

    fn dequeue(&self, buf: &mut [u8], block: bool) -> Result<Option<usize>> {
        let hdr = self.hdr();
        self.sync.lock()?;
        let len = unsafe {
            if block {
                while (*hdr).count == 0 && (*hdr).stopped == 0 {
                    if let Err(e) = self.sync.wait_not_empty() {
                        let _ = self.sync.unlock();
                        return Err(e.into());
                    }
                }
            } else if (*hdr).count == 0 {
                self.sync.unlock()?;
                return Ok(None);
            }
            if (*hdr).stopped != 0 {
                self.sync.unlock()?;
                return Ok(None);
            }

            let slot = header::slot_ptr(self.segment.base(), (*hdr).head, self.slot_stride);
            let mut len_bytes = [0u8; SLOT_SIZE_PREFIX];
            ptr::copy_nonoverlapping(slot, len_bytes.as_mut_ptr(), SLOT_SIZE_PREFIX);
            // A corrupt size prefix must not run past the caller's buffer.
            let len = (u32::from_le_bytes(len_bytes) as usize).min(self.max_message_size as usize);
            if len > 0 {
                ptr::copy_nonoverlapping(slot.add(SLOT_SIZE_PREFIX), buf.as_mut_ptr(), len);
            }
            (*hdr).head = next_index((*hdr).head, self.max_queue_size);
            (*hdr).count -= 1;
            len
        };
        let signalled = self.sync.signal_not_full();
        self.sync.unlock()?;
        signalled?;
        Ok(Some(len))
    }

    fn close(self) {
        let hdr = self.hdr();
        // Swinging the last reference to the tombstone keeps a racing open
        // from reviving the segment between our decrement and the unlink.
        let mut refs = unsafe { (*hdr).ref_count.load(Ordering::Acquire) };
        let last = loop {
            let (next, last) = if refs == 1 {
                (REF_TOMBSTONE, true)
            } else {
                (refs - 1, false)
            };
            match unsafe {
                (*hdr)
                    .ref_count
                    .compare_exchange(refs, next, Ordering::AcqRel, Ordering::Acquire)
            } {
                Ok(_) => break last,
                Err(cur) => refs = cur,
            }
        };
        if last {
            // Retire the name first so new opens miss, then tear down the
            // primitives while the mapping is still ours.
            self.segment.unlink();
            unsafe { QueueSync::destroy(ptr::addr_of_mut!((*hdr).sync)) };
            debug!(name = %self.name, "destroyed message queue");
        } else {
            debug!(name = %self.name, "closed message queue handle");
        }
    }
}

#[inline]
fn next_index(index: u32, capacity: u32) -> u32 {
    let next = index + 1;
    if next == capacity {
        0
    } else {
        next
    }
}

/// Write the header of a freshly created segment. The magic goes last with
/// release ordering so a concurrent opener that observes it sees fully
/// constructed primitives.
unsafe fn init_header(
    hdr: *mut QueueHeader,
    name: &str,
    max_queue_size: u32,
    max_message_size: u32,
    slot_stride: u32,
) -> std::io::Result<QueueSync> {
    ptr::addr_of_mut!((*hdr).version).write(VERSION);
    ptr::addr_of_mut!((*hdr).max_queue_size).write(max_queue_size);
    ptr::addr_of_mut!((*hdr).max_message_size).write(max_message_size);
    ptr::addr_of_mut!((*hdr).slot_stride).write(slot_stride);
    ptr::addr_of_mut!((*hdr).count).write(0);
    ptr::addr_of_mut!((*hdr).head).write(0);
    ptr::addr_of_mut!((*hdr).tail).write(0);
    ptr::addr_of_mut!((*hdr).stopped).write(0);
    QueueSync::init(ptr::addr_of_mut!((*hdr).sync))?;
    let sync = QueueSync::attach(name, ptr::addr_of_mut!((*hdr).sync))?;
    (*hdr).ref_count.store(1, Ordering::Relaxed);
    (*hdr).magic.store(MAGIC, Ordering::Release);
    Ok(sync)
}

/// Spin with backoff until the creator publishes the magic, bounded.
unsafe fn wait_for_magic(hdr: *const QueueHeader) -> Result<()> {
    let mut k = 0u32;
    for _ in 0..MAGIC_WAIT_SPINS {
        match (*hdr).magic.load(Ordering::Acquire) {
            MAGIC => return Ok(()),
            0 => adaptive_yield(&mut k),
            _ => return Err(Error::Incompatible("not a message queue segment")),
        }
    }
    Err(Error::Incompatible("queue header was never published"))
}
