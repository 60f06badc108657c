// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// POSIX implementation of the segment manager and the process-shared
// synchronization primitives embedded in the queue header.
// Built on shm_open/mmap and pthread mutex/condvar with
// PTHREAD_PROCESS_SHARED (mutex additionally PTHREAD_MUTEX_ROBUST where
// the OS provides it).

use std::collections::HashMap;
use std::ffi::CString;
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use crate::error::{Error, Result};
use crate::perms::Permissions;
use crate::platform::adaptive_yield;

// ---------------------------------------------------------------------------
// Robust mutex symbols — not exposed by the `libc` crate on all platforms.
// macOS has no robust mutexes; a holder crashing there can wedge the queue.
// ---------------------------------------------------------------------------

#[cfg(not(target_os = "macos"))]
const EOWNERDEAD: i32 = libc::EOWNERDEAD;

#[cfg(not(target_os = "macos"))]
extern "C" {
    fn pthread_mutexattr_setrobust(
        attr: *mut libc::pthread_mutexattr_t,
        robustness: libc::c_int,
    ) -> libc::c_int;
    fn pthread_mutex_consistent(mutex: *mut libc::pthread_mutex_t) -> libc::c_int;
}

#[cfg(not(target_os = "macos"))]
const PTHREAD_MUTEX_ROBUST: libc::c_int = 1;

// ---------------------------------------------------------------------------
// SyncBlock — the primitives that live inside the queue header
// ---------------------------------------------------------------------------

#[repr(C)]
pub(crate) struct SyncBlock {
    mutex: libc::pthread_mutex_t,
    not_full: libc::pthread_cond_t,
    not_empty: libc::pthread_cond_t,
}

// ---------------------------------------------------------------------------
// Process-local mapping cache.
// All handles within the same process that open the same named segment MUST
// share a single mmap. macOS's pthread implementation stores internal
// pointers relative to the virtual address used for pthread_mutex_init, so
// a second mmap of the same physical page at a different address causes
// EINVAL on pthread_mutex_lock.
// ---------------------------------------------------------------------------

pub(crate) struct MappedSegment {
    mem: *mut u8,
    size: usize,
    os_name: String,
    local_ref: AtomicUsize,
}

// Safety: the mapping is process-shared by design; all mutable queue state
// inside it is guarded by the embedded primitives.
unsafe impl Send for MappedSegment {}
unsafe impl Sync for MappedSegment {}

impl Drop for MappedSegment {
    fn drop(&mut self) {
        if !self.mem.is_null() {
            unsafe { libc::munmap(self.mem as *mut libc::c_void, self.size) };
        }
    }
}

struct SegmentCache {
    map: HashMap<String, Arc<MappedSegment>>,
}

fn segment_cache() -> &'static Mutex<SegmentCache> {
    static CACHE: OnceLock<Mutex<SegmentCache>> = OnceLock::new();
    CACHE.get_or_init(|| {
        Mutex::new(SegmentCache {
            map: HashMap::new(),
        })
    })
}

// ---------------------------------------------------------------------------
// PlatformSegment — one handle's reference to a (shared) mapping
// ---------------------------------------------------------------------------

pub(crate) struct PlatformSegment {
    cached: Arc<MappedSegment>,
}

fn create_error(e: io::Error) -> Error {
    match e.raw_os_error() {
        Some(libc::EEXIST) => Error::AlreadyExists,
        Some(libc::EACCES) => Error::PermissionDenied(e),
        _ => Error::Os(e),
    }
}

fn open_error(e: io::Error) -> Error {
    match e.raw_os_error() {
        Some(libc::ENOENT) => Error::NotFound,
        Some(libc::EACCES) => Error::PermissionDenied(e),
        _ => Error::Os(e),
    }
}

impl PlatformSegment {
    /// Exclusively create a named segment of exactly `size` bytes.
    ///
    /// The cache lock is held for the whole acquisition so a concurrent
    /// in-process open cannot produce a second mapping of the same pages.
    pub(crate) fn create(os_name: &str, size: usize, perms: &Permissions) -> Result<Self> {
        let mut cache = segment_cache().lock().unwrap();
        let c_name = c_name(os_name)?;
        let mode = perms.mode as libc::mode_t;

        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                mode as libc::c_uint,
            )
        };
        if fd == -1 {
            return Err(create_error(io::Error::last_os_error()));
        }

        // shm_open honors the umask; force the requested bits.
        unsafe { libc::fchmod(fd, mode) };

        if let Some((uid, gid)) = perms.owner {
            let ret = unsafe { libc::fchown(fd, uid as libc::uid_t, gid as libc::gid_t) };
            if ret != 0 {
                let err = io::Error::last_os_error();
                unsafe {
                    libc::close(fd);
                    libc::shm_unlink(c_name.as_ptr());
                }
                return Err(Error::PermissionDenied(err));
            }
        }

        let ret = unsafe { libc::ftruncate(fd, size as libc::off_t) };
        if ret != 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(fd);
                libc::shm_unlink(c_name.as_ptr());
            }
            return Err(Error::Os(err));
        }

        let mapped = match mmap_segment(fd, size, os_name) {
            Ok(m) => m,
            Err(e) => {
                unsafe { libc::shm_unlink(c_name.as_ptr()) };
                return Err(Error::Os(e));
            }
        };

        let entry = Arc::new(mapped);
        cache.map.insert(os_name.to_string(), Arc::clone(&entry));
        Ok(Self { cached: entry })
    }

    /// Open an existing named segment, mapping its full current size.
    pub(crate) fn open(os_name: &str) -> Result<Self> {
        let mut cache = segment_cache().lock().unwrap();
        if let Some(entry) = cache.map.get(os_name) {
            entry.local_ref.fetch_add(1, Ordering::Relaxed);
            return Ok(Self {
                cached: Arc::clone(entry),
            });
        }

        let c_name = c_name(os_name)?;
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };
        if fd == -1 {
            return Err(open_error(io::Error::last_os_error()));
        }

        // A concurrent creator may not have sized the object yet; give it a
        // bounded chance to finish before declaring the segment unusable.
        let mut size = 0usize;
        let mut k = 0u32;
        for _ in 0..SIZE_WAIT_SPINS {
            let mut st: libc::stat = unsafe { std::mem::zeroed() };
            if unsafe { libc::fstat(fd, &mut st) } != 0 {
                let err = io::Error::last_os_error();
                unsafe { libc::close(fd) };
                return Err(Error::Os(err));
            }
            size = st.st_size as usize;
            if size > 0 {
                break;
            }
            adaptive_yield(&mut k);
        }
        if size == 0 {
            unsafe { libc::close(fd) };
            return Err(Error::Incompatible("segment was never sized"));
        }

        let mapped = mmap_segment(fd, size, os_name).map_err(Error::Os)?;
        let entry = Arc::new(mapped);
        cache.map.insert(os_name.to_string(), Arc::clone(&entry));
        Ok(Self { cached: entry })
    }

    /// Pointer to the start of the mapped region.
    pub(crate) fn base(&self) -> *mut u8 {
        self.cached.mem
    }

    /// Mapped size in bytes.
    pub(crate) fn size(&self) -> usize {
        self.cached.size
    }

    /// Remove the OS name. Existing mappings stay valid until unmapped.
    pub(crate) fn unlink(&self) {
        if let Ok(c_name) = CString::new(self.cached.os_name.as_bytes()) {
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
        }
    }
}

impl Drop for PlatformSegment {
    fn drop(&mut self) {
        // Last local reference removes the cache entry; the mapping itself
        // goes away when the final Arc drops. A recreate may have replaced
        // the entry under the same name, so only remove our own.
        let mut cache = segment_cache().lock().unwrap();
        let prev = self.cached.local_ref.fetch_sub(1, Ordering::AcqRel);
        if prev <= 1 {
            if let Some(entry) = cache.map.get(&self.cached.os_name) {
                if Arc::ptr_eq(entry, &self.cached) {
                    cache.map.remove(&self.cached.os_name);
                }
            }
        }
    }
}

const SIZE_WAIT_SPINS: u32 = 1024;

fn c_name(os_name: &str) -> Result<CString> {
    CString::new(os_name.as_bytes())
        .map_err(|_| Error::InvalidName(os_name.to_string()))
}

fn mmap_segment(fd: i32, size: usize, os_name: &str) -> io::Result<MappedSegment> {
    let mem = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    unsafe { libc::close(fd) };

    if mem == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }

    Ok(MappedSegment {
        mem: mem as *mut u8,
        size,
        os_name: os_name.to_string(),
        local_ref: AtomicUsize::new(1),
    })
}

// ---------------------------------------------------------------------------
// QueueSync — lock/wait/signal over the embedded primitives
// ---------------------------------------------------------------------------

pub(crate) struct QueueSync {
    sync: *mut SyncBlock,
}

// Safety: every operation funnels through the process-shared primitives the
// pointer refers to.
unsafe impl Send for QueueSync {}
unsafe impl Sync for QueueSync {}

impl QueueSync {
    /// Initialize the embedded primitives. Creator only, before the header
    /// magic is published.
    ///
    /// # Safety
    /// `sync` must point into a freshly created, exclusively owned mapping.
    pub(crate) unsafe fn init(sync: *mut SyncBlock) -> io::Result<()> {
        ptr::write_bytes(sync, 0, 1);

        let mut mattr: libc::pthread_mutexattr_t = std::mem::zeroed();
        let mut eno = libc::pthread_mutexattr_init(&mut mattr);
        if eno != 0 {
            return Err(io::Error::from_raw_os_error(eno));
        }
        eno = libc::pthread_mutexattr_setpshared(&mut mattr, libc::PTHREAD_PROCESS_SHARED);
        if eno != 0 {
            libc::pthread_mutexattr_destroy(&mut mattr);
            return Err(io::Error::from_raw_os_error(eno));
        }
        #[cfg(not(target_os = "macos"))]
        {
            eno = pthread_mutexattr_setrobust(&mut mattr, PTHREAD_MUTEX_ROBUST);
            if eno != 0 {
                libc::pthread_mutexattr_destroy(&mut mattr);
                return Err(io::Error::from_raw_os_error(eno));
            }
        }
        eno = libc::pthread_mutex_init(ptr::addr_of_mut!((*sync).mutex), &mattr);
        libc::pthread_mutexattr_destroy(&mut mattr);
        if eno != 0 {
            return Err(io::Error::from_raw_os_error(eno));
        }

        let mut cattr: libc::pthread_condattr_t = std::mem::zeroed();
        eno = libc::pthread_condattr_init(&mut cattr);
        if eno != 0 {
            return Err(io::Error::from_raw_os_error(eno));
        }
        eno = libc::pthread_condattr_setpshared(&mut cattr, libc::PTHREAD_PROCESS_SHARED);
        if eno != 0 {
            libc::pthread_condattr_destroy(&mut cattr);
            return Err(io::Error::from_raw_os_error(eno));
        }
        for cond in [
            ptr::addr_of_mut!((*sync).not_full),
            ptr::addr_of_mut!((*sync).not_empty),
        ] {
            eno = libc::pthread_cond_init(cond, &cattr);
            if eno != 0 {
                libc::pthread_condattr_destroy(&mut cattr);
                return Err(io::Error::from_raw_os_error(eno));
            }
        }
        libc::pthread_condattr_destroy(&mut cattr);
        Ok(())
    }

    /// Attach to already-initialized primitives.
    ///
    /// # Safety
    /// `sync` must point to a `SyncBlock` initialized by `init` in this or
    /// another process, inside a mapping that outlives the returned value.
    pub(crate) unsafe fn attach(_name: &str, sync: *mut SyncBlock) -> io::Result<Self> {
        Ok(Self { sync })
    }

    /// Destroy the embedded primitives. Last closer only, while the mapping
    /// is still valid.
    ///
    /// # Safety
    /// No other process may hold a reference to the segment.
    pub(crate) unsafe fn destroy(sync: *mut SyncBlock) {
        libc::pthread_cond_destroy(ptr::addr_of_mut!((*sync).not_empty));
        libc::pthread_cond_destroy(ptr::addr_of_mut!((*sync).not_full));
        libc::pthread_mutex_destroy(ptr::addr_of_mut!((*sync).mutex));
    }

    fn mutex_ptr(&self) -> *mut libc::pthread_mutex_t {
        unsafe { ptr::addr_of_mut!((*self.sync).mutex) }
    }

    fn not_full_ptr(&self) -> *mut libc::pthread_cond_t {
        unsafe { ptr::addr_of_mut!((*self.sync).not_full) }
    }

    fn not_empty_ptr(&self) -> *mut libc::pthread_cond_t {
        unsafe { ptr::addr_of_mut!((*self.sync).not_empty) }
    }

    /// Lock the queue mutex. A dead previous owner is recovered via
    /// `pthread_mutex_consistent` where robust mutexes exist.
    pub(crate) fn lock(&self) -> io::Result<()> {
        let eno = unsafe { libc::pthread_mutex_lock(self.mutex_ptr()) };
        match eno {
            0 => Ok(()),
            #[cfg(not(target_os = "macos"))]
            EOWNERDEAD => {
                let eno2 = unsafe { pthread_mutex_consistent(self.mutex_ptr()) };
                if eno2 != 0 {
                    return Err(io::Error::from_raw_os_error(eno2));
                }
                Ok(())
            }
            _ => Err(io::Error::from_raw_os_error(eno)),
        }
    }

    pub(crate) fn unlock(&self) -> io::Result<()> {
        let eno = unsafe { libc::pthread_mutex_unlock(self.mutex_ptr()) };
        if eno != 0 {
            return Err(io::Error::from_raw_os_error(eno));
        }
        Ok(())
    }

    fn wait(&self, cond: *mut libc::pthread_cond_t) -> io::Result<()> {
        let eno = unsafe { libc::pthread_cond_wait(cond, self.mutex_ptr()) };
        if eno != 0 {
            return Err(io::Error::from_raw_os_error(eno));
        }
        Ok(())
    }

    fn signal(&self, cond: *mut libc::pthread_cond_t) -> io::Result<()> {
        let eno = unsafe { libc::pthread_cond_signal(cond) };
        if eno != 0 {
            return Err(io::Error::from_raw_os_error(eno));
        }
        Ok(())
    }

    fn broadcast(&self, cond: *mut libc::pthread_cond_t) -> io::Result<()> {
        let eno = unsafe { libc::pthread_cond_broadcast(cond) };
        if eno != 0 {
            return Err(io::Error::from_raw_os_error(eno));
        }
        Ok(())
    }

    /// Wait for space. Caller must hold the lock; the mutex is atomically
    /// released and re-acquired around the wait.
    pub(crate) fn wait_not_full(&self) -> io::Result<()> {
        self.wait(self.not_full_ptr())
    }

    /// Wait for a message. Caller must hold the lock.
    pub(crate) fn wait_not_empty(&self) -> io::Result<()> {
        self.wait(self.not_empty_ptr())
    }

    pub(crate) fn signal_not_full(&self) -> io::Result<()> {
        self.signal(self.not_full_ptr())
    }

    pub(crate) fn signal_not_empty(&self) -> io::Result<()> {
        self.signal(self.not_empty_ptr())
    }

    pub(crate) fn broadcast_not_full(&self) -> io::Result<()> {
        self.broadcast(self.not_full_ptr())
    }

    pub(crate) fn broadcast_not_empty(&self) -> io::Result<()> {
        self.broadcast(self.not_empty_ptr())
    }
}
