// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A minimalist fixed-size string, used anywhere spec.md calls for a
//! "bounded string" (service names, event-type names, app manifest fields).
//!
//! Unlike a heap-allocated `String`, a `BoundedString` has a size known at
//! compile time, so it can sit inside a `#[repr(C)]` struct shared with
//! loaded apps without an allocator on either side of the boundary.

use core::fmt;
use core::ops::Deref;

use crate::Error;

/// An owned string with a fixed maximum byte length `MAX`.
#[derive(Copy, Clone)]
pub struct BoundedString<const MAX: usize> {
    buf: [u8; MAX],
    len: usize,
}

impl<const MAX: usize> BoundedString<MAX> {
    pub const fn empty() -> Self {
        Self {
            buf: [0; MAX],
            len: 0,
        }
    }

    pub fn try_from_str(s: &str) -> Result<Self, Error> {
        let bytes = s.as_bytes();
        if bytes.len() > MAX {
            return Err(Error::InvalidArg);
        }
        let mut buf = [0u8; MAX];
        buf[..bytes.len()].copy_from_slice(bytes);
        Ok(Self {
            buf,
            len: bytes.len(),
        })
    }

    pub fn as_str(&self) -> &str {
        // Safety of this unwrap: the only constructor that can fail is
        // `try_from_str`, which only ever stores valid UTF-8.
        core::str::from_utf8(&self.buf[..self.len]).unwrap_or("")
    }
}

impl<const MAX: usize> Deref for BoundedString<MAX> {
    type Target = str;

    fn deref(&self) -> &str {
        self.as_str()
    }
}

impl<const MAX: usize> PartialEq for BoundedString<MAX> {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl<const MAX: usize> Eq for BoundedString<MAX> {}

impl<const MAX: usize> fmt::Debug for BoundedString<MAX> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl<const MAX: usize> fmt::Display for BoundedString<MAX> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.as_str(), f)
    }
}

impl<const MAX: usize> Default for BoundedString<MAX> {
    fn default() -> Self {
        Self::empty()
    }
}
