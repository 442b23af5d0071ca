// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The frozen app ABI: `AppManifest` (spec.md §3) and `AppContext`
//! (spec.md §4.M.1 / §6).
//!
//! `AppContext` is a `#[repr(C)]` table of function pointers in a fixed
//! order, led by a version integer, exactly as §6 requires: "An app
//! compiled against version `V` must refuse to run under a host advertising
//! version `!= V`." Bump `ABI_VERSION` on any layout change.

use core::ffi::c_void;

use crate::BoundedString;

/// Current `AppContext` ABI version. An app compiled against a different
/// version must refuse to run (enforced by `apps/loader`'s app manager
/// before it ever calls `entry`).
pub const ABI_VERSION: u32 = 1;

pub type AppEntryFn = extern "C" fn(*mut AppContext) -> i32;
pub type AppExitFn = extern "C" fn(*mut AppContext) -> i32;
pub type EventHandlerFn =
    extern "C" fn(event_type: u16, sender: u16, data: *const u8, data_len: u32, user_data: *mut c_void);

/// Statically-linked or dynamically-loaded app description (spec.md §3).
#[derive(Clone)]
pub struct AppManifest {
    pub name: BoundedString<31>,
    pub version: BoundedString<15>,
    pub author: BoundedString<31>,
    pub entry: Option<AppEntryFn>,
    pub exit: Option<AppExitFn>,
    /// Opaque value handed back to `entry`/`exit` unchanged; owned by
    /// whichever side constructed the manifest.
    pub user_data: usize,
}

/// On-image layout of the `_app_manifest` export inside a loaded ELF: four
/// bounded strings' worth of bytes followed by two function offsets and an
/// opaque user-data word, as spec.md §6 describes ("four bounded strings
/// followed by two function pointers and an opaque `user_data` pointer").
/// `entry_rva`/`exit_rva` are ELF-virtual-address offsets, not yet mapped
/// through the section map; the loader resolves them after relocation.
#[derive(Copy, Clone, Debug, zerocopy::FromBytes, zerocopy::IntoBytes)]
#[repr(C)]
pub struct RawAppManifest {
    pub name: [u8; 32],
    pub version: [u8; 16],
    pub author: [u8; 32],
    pub entry_rva: u32,
    pub exit_rva: u32,
    pub user_data: u32,
}

impl RawAppManifest {
    fn field_str(bytes: &[u8]) -> &str {
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        core::str::from_utf8(&bytes[..end]).unwrap_or("")
    }

    pub fn name_str(&self) -> &str {
        Self::field_str(&self.name)
    }

    pub fn version_str(&self) -> &str {
        Self::field_str(&self.version)
    }

    pub fn author_str(&self) -> &str {
        Self::field_str(&self.author)
    }
}

/// The frozen host<->app ABI (spec.md §4.M.1 / §6): a version integer
/// followed by ten function pointers in a fixed order. This struct is
/// `repr(C)` and must never be reordered; add new capabilities by bumping
/// `ABI_VERSION` and defining a new struct, never by editing this one.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct AppContext {
    pub abi_version: u32,
    pub service_id: u16,
    pub fns: AppContextFnTable,
    /// Opaque handle into the owning `System`; never interpreted by apps.
    pub system_handle: *mut c_void,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct AppContextFnTable {
    pub register_service: extern "C" fn(*mut AppContext, *const u8, u32, *mut u16) -> i32,
    pub unregister_service: extern "C" fn(*mut AppContext, u16) -> i32,
    pub set_state: extern "C" fn(*mut AppContext, u16, u8) -> i32,
    pub heartbeat: extern "C" fn(*mut AppContext, u16) -> i32,
    pub post: extern "C" fn(*mut AppContext, u16, u8, *const u8, u32) -> i32,
    pub subscribe:
        extern "C" fn(*mut AppContext, u16, u16, EventHandlerFn, *mut c_void) -> i32,
    pub unsubscribe: extern "C" fn(*mut AppContext, u16, u16) -> i32,
    pub register_event_type: extern "C" fn(*mut AppContext, *const u8, u32, *mut u16) -> i32,
    pub get_type_name: extern "C" fn(*mut AppContext, u16, *mut u8, u32, *mut u32) -> i32,
    pub send_request:
        extern "C" fn(*mut AppContext, u16, *const u8, u32, *mut u8, u32, *mut u32, u32) -> i32,
}
