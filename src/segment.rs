// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Cross-platform segment manager.
// Delegates to platform::PlatformSegment (POSIX or Windows).

use crate::error::{Error, Result};
use crate::name;
use crate::perms::Permissions;
use crate::platform::PlatformSegment;

/// A named, inter-process shared memory segment holding one queue.
pub(crate) struct Segment {
    inner: PlatformSegment,
}

impl Segment {
    /// Exclusively create a segment of exactly `size` bytes.
    pub(crate) fn create(queue_name: &str, size: usize, perms: &Permissions) -> Result<Self> {
        let os_name = name::object_name(queue_name);
        let inner = PlatformSegment::create(&os_name, size, perms)?;
        tracing::debug!(name = queue_name, size, "created shared memory segment");
        Ok(Self { inner })
    }

    /// Open an existing segment, mapping its full current size.
    pub(crate) fn open(queue_name: &str) -> Result<Self> {
        let os_name = name::object_name(queue_name);
        let inner = PlatformSegment::open(&os_name)?;
        tracing::debug!(
            name = queue_name,
            size = inner.size(),
            "opened shared memory segment"
        );
        Ok(Self { inner })
    }

    /// Create the segment, or open it when it already exists. Loops so that
    /// losing either race (created under us, unlinked under us) retries;
    /// either outcome is acceptable. Returns whether we created it.
    pub(crate) fn open_or_create(
        queue_name: &str,
        size: usize,
        perms: &Permissions,
    ) -> Result<(Self, bool)> {
        loop {
            match Self::create(queue_name, size, perms) {
                Ok(seg) => return Ok((seg, true)),
                Err(Error::AlreadyExists) => {}
                Err(e) => return Err(e),
            }
            match Self::open(queue_name) {
                Ok(seg) => return Ok((seg, false)),
                Err(Error::NotFound) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Pointer to the start of the mapped region.
    pub(crate) fn base(&self) -> *mut u8 {
        self.inner.base()
    }

    /// Observed size of the mapping. At least the requested size; some
    /// platforms round up to page granularity.
    pub(crate) fn size(&self) -> usize {
        self.inner.size()
    }

    /// Remove the OS name. The mapping stays valid until all handles drop.
    pub(crate) fn unlink(&self) {
        self.inner.unlink();
    }
}
