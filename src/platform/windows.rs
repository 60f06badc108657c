// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Windows implementation of the segment manager and queue synchronization.
// The segment is a named pagefile-backed file mapping. Windows has no
// process-shared pthread primitives, so the condition variables are
// emulated: a named kernel mutex serializes the queue, and each condition
// is a named kernel semaphore plus a waiter counter kept in the shared
// header and mutated only under the mutex. Waiters re-test their predicate
// after every wake, so a stolen wakeup degrades to a spurious one.

use std::io;
use std::ptr;

use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, ERROR_ACCESS_DENIED, ERROR_ALREADY_EXISTS, ERROR_FILE_NOT_FOUND,
    FALSE, HANDLE, INVALID_HANDLE_VALUE, WAIT_ABANDONED, WAIT_OBJECT_0,
};
use windows_sys::Win32::System::Memory::{
    CreateFileMappingW, MapViewOfFile, OpenFileMappingW, UnmapViewOfFile, VirtualQuery,
    FILE_MAP_ALL_ACCESS, MEMORY_BASIC_INFORMATION, MEMORY_MAPPED_VIEW_ADDRESS, PAGE_READWRITE,
    SEC_COMMIT,
};
use windows_sys::Win32::System::Threading::{
    CreateMutexW, CreateSemaphoreW, ReleaseMutex, ReleaseSemaphore, WaitForSingleObject, INFINITE,
};

use crate::error::{Error, Result};
use crate::perms::Permissions;

/// Encode a name as a null-terminated wide string for Win32 APIs.
fn to_wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

fn view_of(mem: *mut u8) -> MEMORY_MAPPED_VIEW_ADDRESS {
    MEMORY_MAPPED_VIEW_ADDRESS {
        Value: mem as *mut _,
    }
}

// ---------------------------------------------------------------------------
// SyncBlock — shared waiter counters (kernel objects are per-handle)
// ---------------------------------------------------------------------------

#[repr(C)]
pub(crate) struct SyncBlock {
    not_full_waiters: u32,
    not_empty_waiters: u32,
}

// ---------------------------------------------------------------------------
// PlatformSegment — named file mapping
// ---------------------------------------------------------------------------

pub(crate) struct PlatformSegment {
    handle: HANDLE,
    mem: *mut u8,
    size: usize,
}

// Safety: the mapping is process-shared by design; all mutable queue state
// inside it is guarded by the kernel mutex.
unsafe impl Send for PlatformSegment {}
unsafe impl Sync for PlatformSegment {}

impl PlatformSegment {
    /// Exclusively create a named mapping of exactly `size` bytes.
    /// The kernel object gets the default security descriptor; `Permissions`
    /// carries no data on Windows.
    pub(crate) fn create(os_name: &str, size: usize, _perms: &Permissions) -> Result<Self> {
        let wide_name = to_wide(os_name);
        let high = ((size as u64) >> 32) as u32;
        let low = size as u32;

        let handle = unsafe {
            CreateFileMappingW(
                INVALID_HANDLE_VALUE,
                ptr::null(),
                PAGE_READWRITE | SEC_COMMIT,
                high,
                low,
                wide_name.as_ptr(),
            )
        };
        let err = unsafe { GetLastError() };
        if !handle.is_null() && err == ERROR_ALREADY_EXISTS {
            unsafe { CloseHandle(handle) };
            return Err(Error::AlreadyExists);
        }
        if handle.is_null() {
            let e = io::Error::last_os_error();
            return Err(match err {
                ERROR_ACCESS_DENIED => Error::PermissionDenied(e),
                _ => Error::Os(e),
            });
        }

        let view = unsafe { MapViewOfFile(handle, FILE_MAP_ALL_ACCESS, 0, 0, 0) };
        if view.Value.is_null() {
            let e = io::Error::last_os_error();
            unsafe { CloseHandle(handle) };
            return Err(Error::Os(e));
        }

        Ok(Self {
            handle,
            mem: view.Value as *mut u8,
            size,
        })
    }

    /// Open an existing named mapping, discovering its size from the view.
    pub(crate) fn open(os_name: &str) -> Result<Self> {
        let wide_name = to_wide(os_name);

        let handle = unsafe { OpenFileMappingW(FILE_MAP_ALL_ACCESS, FALSE, wide_name.as_ptr()) };
        if handle.is_null() {
            let err = unsafe { GetLastError() };
            let e = io::Error::last_os_error();
            return Err(match err {
                ERROR_FILE_NOT_FOUND => Error::NotFound,
                ERROR_ACCESS_DENIED => Error::PermissionDenied(e),
                _ => Error::Os(e),
            });
        }

        let view = unsafe { MapViewOfFile(handle, FILE_MAP_ALL_ACCESS, 0, 0, 0) };
        if view.Value.is_null() {
            let e = io::Error::last_os_error();
            unsafe { CloseHandle(handle) };
            return Err(Error::Os(e));
        }

        let mut info: MEMORY_BASIC_INFORMATION = unsafe { std::mem::zeroed() };
        let ret = unsafe {
            VirtualQuery(
                view.Value,
                &mut info,
                std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
            )
        };
        if ret == 0 {
            let e = io::Error::last_os_error();
            unsafe {
                UnmapViewOfFile(view);
                CloseHandle(handle);
            }
            return Err(Error::Os(e));
        }

        Ok(Self {
            handle,
            mem: view.Value as *mut u8,
            size: info.RegionSize,
        })
    }

    pub(crate) fn base(&self) -> *mut u8 {
        self.mem
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    /// No-op: Windows kernel objects disappear with their last handle.
    pub(crate) fn unlink(&self) {}
}

impl Drop for PlatformSegment {
    fn drop(&mut self) {
        if !self.mem.is_null() {
            unsafe { UnmapViewOfFile(view_of(self.mem)) };
        }
        if !self.handle.is_null() {
            unsafe { CloseHandle(self.handle) };
        }
    }
}

// ---------------------------------------------------------------------------
// QueueSync — kernel mutex + two semaphore-emulated condition variables
// ---------------------------------------------------------------------------

pub(crate) struct QueueSync {
    sync: *mut SyncBlock,
    mutex: HANDLE,
    not_full_sem: HANDLE,
    not_empty_sem: HANDLE,
}

unsafe impl Send for QueueSync {}
unsafe impl Sync for QueueSync {}

impl QueueSync {
    /// Zero the waiter counters. Creator only.
    ///
    /// # Safety
    /// `sync` must point into a freshly created, exclusively owned mapping.
    pub(crate) unsafe fn init(sync: *mut SyncBlock) -> io::Result<()> {
        ptr::write_bytes(sync, 0, 1);
        Ok(())
    }

    /// Create or open the kernel objects backing this queue's lock and
    /// condition variables. Names derive from the queue name, so the
    /// caller's namespace prefix (e.g. "Global\") carries over.
    ///
    /// # Safety
    /// `sync` must point to a `SyncBlock` inside a mapping that outlives
    /// the returned value.
    pub(crate) unsafe fn attach(name: &str, sync: *mut SyncBlock) -> io::Result<Self> {
        let mutex_name = to_wide(&format!("{name}__mq_mtx"));
        let mutex = CreateMutexW(ptr::null(), FALSE, mutex_name.as_ptr());
        if mutex.is_null() {
            return Err(io::Error::last_os_error());
        }

        let nf_name = to_wide(&format!("{name}__mq_nf"));
        let not_full_sem = CreateSemaphoreW(ptr::null(), 0, i32::MAX, nf_name.as_ptr());
        if not_full_sem.is_null() {
            let e = io::Error::last_os_error();
            CloseHandle(mutex);
            return Err(e);
        }

        let ne_name = to_wide(&format!("{name}__mq_ne"));
        let not_empty_sem = CreateSemaphoreW(ptr::null(), 0, i32::MAX, ne_name.as_ptr());
        if not_empty_sem.is_null() {
            let e = io::Error::last_os_error();
            CloseHandle(mutex);
            CloseHandle(not_full_sem);
            return Err(e);
        }

        Ok(Self {
            sync,
            mutex,
            not_full_sem,
            not_empty_sem,
        })
    }

    /// No-op: the kernel reclaims the named objects with their last handle.
    ///
    /// # Safety
    /// Exists for signature parity with the POSIX implementation.
    pub(crate) unsafe fn destroy(_sync: *mut SyncBlock) {}

    /// Lock the queue mutex. A wait that returns `WAIT_ABANDONED` means the
    /// previous owner died while holding it; ownership still transfers.
    pub(crate) fn lock(&self) -> io::Result<()> {
        match unsafe { WaitForSingleObject(self.mutex, INFINITE) } {
            WAIT_OBJECT_0 | WAIT_ABANDONED => Ok(()),
            _ => Err(io::Error::last_os_error()),
        }
    }

    pub(crate) fn unlock(&self) -> io::Result<()> {
        if unsafe { ReleaseMutex(self.mutex) } == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn wait(&self, sem: HANDLE, waiters: *mut u32) -> io::Result<()> {
        unsafe { *waiters += 1 };
        self.unlock()?;
        let ret = unsafe { WaitForSingleObject(sem, INFINITE) };
        let wait_err = if ret == WAIT_OBJECT_0 {
            None
        } else {
            Some(io::Error::last_os_error())
        };
        self.lock()?;
        if let Some(e) = wait_err {
            unsafe { *waiters = (*waiters).saturating_sub(1) };
            return Err(e);
        }
        Ok(())
    }

    fn signal(&self, sem: HANDLE, waiters: *mut u32) -> io::Result<()> {
        unsafe {
            if *waiters > 0 {
                if ReleaseSemaphore(sem, 1, ptr::null_mut()) == 0 {
                    return Err(io::Error::last_os_error());
                }
                *waiters -= 1;
            }
        }
        Ok(())
    }

    fn broadcast(&self, sem: HANDLE, waiters: *mut u32) -> io::Result<()> {
        unsafe {
            let n = *waiters;
            if n > 0 {
                if ReleaseSemaphore(sem, n as i32, ptr::null_mut()) == 0 {
                    return Err(io::Error::last_os_error());
                }
                *waiters = 0;
            }
        }
        Ok(())
    }

    fn not_full_waiters(&self) -> *mut u32 {
        unsafe { ptr::addr_of_mut!((*self.sync).not_full_waiters) }
    }

    fn not_empty_waiters(&self) -> *mut u32 {
        unsafe { ptr::addr_of_mut!((*self.sync).not_empty_waiters) }
    }

    /// Wait for space. Caller must hold the lock; the mutex is released and
    /// re-acquired around the wait.
    pub(crate) fn wait_not_full(&self) -> io::Result<()> {
        self.wait(self.not_full_sem, self.not_full_waiters())
    }

    /// Wait for a message. Caller must hold the lock.
    pub(crate) fn wait_not_empty(&self) -> io::Result<()> {
        self.wait(self.not_empty_sem, self.not_empty_waiters())
    }

    pub(crate) fn signal_not_full(&self) -> io::Result<()> {
        self.signal(self.not_full_sem, self.not_full_waiters())
    }

    pub(crate) fn signal_not_empty(&self) -> io::Result<()> {
        self.signal(self.not_empty_sem, self.not_empty_waiters())
    }

    pub(crate) fn broadcast_not_full(&self) -> io::Result<()> {
        self.broadcast(self.not_full_sem, self.not_full_waiters())
    }

    pub(crate) fn broadcast_not_empty(&self) -> io::Result<()> {
        self.broadcast(self.not_empty_sem, self.not_empty_waiters())
    }
}

impl Drop for QueueSync {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.not_empty_sem);
            CloseHandle(self.not_full_sem);
            CloseHandle(self.mutex);
        }
    }
}
