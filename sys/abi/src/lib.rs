// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

#![cfg_attr(not(feature = "std"), no_std)]

//! Wire types shared between the service runtime and the apps it hosts.
//!
//! Everything in this crate is part of the frozen surface between the host
//! and a dynamically loaded app: ids, the system-wide `Error` enumeration,
//! and the `AppManifest`/`AppContext` ABI described in the app loader spec.

pub mod bounded_string;
pub mod error;
pub mod ids;
pub mod manifest;
pub mod reloc;

pub use bounded_string::BoundedString;
pub use error::Error;
pub use ids::{AppSlotId, EventTypeId, ServiceId};
pub use manifest::{
    AppContext, AppContextFnTable, AppEntryFn, AppExitFn, AppManifest, EventHandlerFn,
    RawAppManifest, ABI_VERSION,
};
pub use reloc::RelocType;

/// Absolute cap on an event payload, independent of any per-service quota.
pub const MAX_EVENT_PAYLOAD: usize = 512;

/// Default number of service registry slots.
pub const SYSTEM_SERVICE_MAX_SERVICES: usize = 16;

/// Default number of app manager slots.
pub const APP_MAX_APPS: usize = 16;

/// Relative "how important" ordering used by the priority queue and
/// dispatcher. Declared `Critical > High > Normal > Low`, matching the
/// lane ordering in spec.md §4.C.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(u8)]
pub enum Priority {
    Low = 0,
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl Priority {
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    pub fn is_more_important_than(self, other: Priority) -> bool {
        self > other
    }
}

/// Lifecycle state of a registered service (spec.md §3 "Service").
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ServiceState {
    Registered,
    Running,
    Paused,
    Stopping,
    Error,
}

/// Lifecycle state of an app slot (spec.md §3 "AppInfo").
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AppState {
    Loaded,
    Running,
    Paused,
    Error,
}

/// Where an app's code came from (spec.md §3 "AppInfo").
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AppSource {
    Internal,
    Storage,
}

/// Reason a restart was attempted, recorded on the `AppInfo` so introspection
/// can tell a watchdog-triggered restart from an operator-requested one.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RestartCause {
    WatchdogTimeout,
    Requested,
}

/// Sticky, process-lifetime reason the system entered safe mode
/// (spec.md §4.I, glossary entry "Safe mode").
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SafeModeReason {
    pub service: ServiceId,
    pub elapsed_ms: u64,
}
