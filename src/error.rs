// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Error types for queue lifecycle and operation failures.
//
// Precondition violations (sending through a closed handle, oversized
// messages, undersized receive buffers) are programmer errors and panic;
// they are deliberately not represented here.

use std::io;

/// Errors reported by queue lifecycle operations and by the operating
/// system during send/receive.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The queue name is not a valid identifier.
    #[error("invalid message queue name {0:?}")]
    InvalidName(String),

    /// Exclusive creation found an existing queue with the same name.
    #[error("message queue already exists")]
    AlreadyExists,

    /// Open of a non-existing queue.
    #[error("message queue does not exist")]
    NotFound,

    /// The OS object exists but is not usable as a message queue: wrong
    /// magic or version, or a segment smaller than its header claims.
    #[error("shared memory segment is incompatible: {0}")]
    Incompatible(&'static str),

    /// Access to the underlying OS object was denied.
    #[error("permission denied")]
    PermissionDenied(#[source] io::Error),

    /// Any other operating system failure.
    #[error("operating system error")]
    Os(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
