// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Queue name validation and mapping to host OS object names.
//
// A queue name must be usable as an identifier: letters, digits and
// underscores, not starting with a digit. On Windows a backslash-separated
// kernel namespace prefix (e.g. "Global\") is additionally allowed and the
// name is passed to the kernel verbatim. On POSIX the name gains a leading
// '/' and, where the OS caps shm name length, overlong names are shortened
// to a prefix plus an FNV-1a hash.

use crate::error::{Error, Result};

/// FNV-1a 64-bit hash.
pub(crate) fn fnv1a_64(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in data {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Convert a 64-bit value to a fixed-width 16-char lowercase hex string.
fn to_hex(val: u64) -> [u8; 16] {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut buf = [0u8; 16];
    let mut v = val;
    for i in (0..16).rev() {
        buf[i] = DIGITS[(v & 0xf) as usize];
        v >>= 4;
    }
    buf
}

/// Maximum length for POSIX shm names. Set to 0 to disable truncation.
///
/// On macOS `PSHMNAMLEN` is 31. On Linux the limit is typically 255.
#[cfg(target_os = "macos")]
pub(crate) const SHM_NAME_MAX: usize = 31;

#[cfg(not(target_os = "macos"))]
pub(crate) const SHM_NAME_MAX: usize = 0; // 0 = no truncation

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Check that `name` is a valid queue name.
///
/// Each backslash-separated component must be a non-empty identifier; the
/// backslash form exists for Windows kernel namespaces ("Global\name").
pub fn validate(name: &str) -> Result<()> {
    if !name.is_empty() && name.split('\\').all(is_identifier) {
        Ok(())
    } else {
        Err(Error::InvalidName(name.to_string()))
    }
}

/// Map a validated queue name to the OS object name.
#[cfg(windows)]
pub(crate) fn object_name(name: &str) -> String {
    // Used verbatim; callers choose their kernel namespace prefix.
    name.to_string()
}

/// Map a validated queue name to the OS object name.
///
/// Produces a POSIX shm name with a leading '/'. When `SHM_NAME_MAX > 0`,
/// names whose POSIX form would exceed that limit are shortened to
/// `/<prefix>_<16-hex-FNV-1a-hash>`, keeping a truncated portion of the
/// original name for debuggability.
#[cfg(unix)]
pub(crate) fn object_name(name: &str) -> String {
    let result = format!("/{name}");

    if SHM_NAME_MAX == 0 || result.len() <= SHM_NAME_MAX {
        return result;
    }

    // 1 (underscore) + 16 (hex hash)
    const HASH_SUFFIX_LEN: usize = 1 + 16;
    let prefix_len = if SHM_NAME_MAX > HASH_SUFFIX_LEN + 1 {
        SHM_NAME_MAX - HASH_SUFFIX_LEN - 1 // -1 for leading '/'
    } else {
        0
    };

    let hash = fnv1a_64(result.as_bytes());
    let hex = to_hex(hash);
    let hex_str = std::str::from_utf8(&hex).unwrap();

    let mut shortened = String::with_capacity(SHM_NAME_MAX);
    shortened.push('/');
    if prefix_len > 0 {
        let take = prefix_len.min(name.len());
        shortened.push_str(&name[..take]);
    }
    shortened.push('_');
    shortened.push_str(hex_str);
    shortened
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_known_value() {
        // FNV-1a of empty string
        assert_eq!(fnv1a_64(b""), 0xcbf29ce484222325);
    }

    #[test]
    fn identifiers_accepted() {
        for name in ["q", "queue_1", "_hidden", "UPPER_lower_09"] {
            assert!(validate(name).is_ok(), "{name} should be valid");
        }
    }

    #[test]
    fn namespace_prefix_accepted() {
        assert!(validate("Global\\my_queue").is_ok());
    }

    #[test]
    fn bad_names_rejected() {
        for name in ["", "9starts_with_digit", "has space", "has-dash", "\\", "a\\"] {
            assert!(validate(name).is_err(), "{name:?} should be invalid");
        }
    }

    #[cfg(unix)]
    #[test]
    fn object_name_prepends_slash() {
        let name = object_name("foo");
        assert!(name.starts_with('/'));
        assert!(name.contains("foo"));
    }

    #[test]
    fn to_hex_roundtrip() {
        let hex = to_hex(0x0123456789abcdef);
        assert_eq!(&hex, b"0123456789abcdef");
    }
}
