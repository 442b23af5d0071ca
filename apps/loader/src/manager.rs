// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The app manager (spec.md §4.M): owns the `AppInfo` table, drives app
//! lifecycle through the task spawner, and is the restart hook the watchdog
//! calls for app services (spec.md §4.M.5).
//!
//! `AppContext::system_handle` is how the ten ABI trampolines below reach a
//! live [`System`] without any global state: each `AppContext` carries a
//! strong reference to the owning system, stashed as a raw pointer at
//! registration and dropped at uninstall.

use core::ffi::c_void;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rt_abi::{
    AppContext, AppContextFnTable, AppManifest, AppSlotId, AppSource, AppState, Error,
    EventHandlerFn, EventTypeId, Priority, RestartCause, ServiceId, ServiceState, ABI_VERSION,
};
use rt_hal::{FlashPartitionReader, TaskHandle, TaskSpawner, TaskSpec};
use rt_runtime::subscriptions::{ExternUserData, Handler};
use rt_runtime::watchdog::RestartHook;
use rt_runtime::System;

use crate::elf::{ElfLoader, LoadedImage};

/// Request/response events posted through `send_request` carry this 4-byte
/// request id prefix ahead of the caller's payload; a responder decodes the
/// prefix and answers through `System::send_response`.
fn encode_request(id: u32, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + data.len());
    buf.extend_from_slice(&id.to_le_bytes());
    buf.extend_from_slice(data);
    buf
}

struct SendPtr<T>(*mut T);
unsafe impl<T> Send for SendPtr<T> {}

struct AppSlot {
    manifest: AppManifest,
    state: AppState,
    source: AppSource,
    service_id: ServiceId,
    load_time_ms: u64,
    task: Option<Box<dyn TaskHandle>>,
    context: Box<AppContext>,
    image: Option<LoadedImage>,
    system_handle: *mut c_void,
    last_restart_cause: Option<RestartCause>,
}

// `system_handle` only ever identifies an `Arc<System>` this slot owns a
// strong reference to; access to it is serialized by the manager's mutex.
unsafe impl Send for AppSlot {}

pub struct AppManager {
    system: Arc<System>,
    slots: Arc<Mutex<Vec<Option<AppSlot>>>>,
    app_priority: u8,
}

impl AppManager {
    pub fn new(system: Arc<System>, capacity: usize, app_priority: u8) -> Arc<Self> {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Arc::new(AppManager {
            system,
            slots: Arc::new(Mutex::new(slots)),
            app_priority,
        })
    }

    fn find_by_service(slots: &[Option<AppSlot>], service: ServiceId) -> Option<usize> {
        slots
            .iter()
            .position(|s| matches!(s, Some(slot) if slot.service_id == service))
    }

    /// Validates the name, allocates a slot, registers with the service
    /// registry and builds the `AppContext` (spec.md §4.M.2).
    pub fn register(&self, manifest: AppManifest) -> Result<AppSlotId, Error> {
        if manifest.name.as_str().is_empty() {
            return Err(Error::InvalidArg);
        }
        let mut slots = self.slots.lock().unwrap();
        if slots
            .iter()
            .any(|s| matches!(s, Some(slot) if slot.manifest.name == manifest.name))
        {
            return Err(Error::AlreadyExists);
        }
        let index = slots.iter().position(|s| s.is_none()).ok_or(Error::RegistryFull)?;

        let service_id = self.system.register_service(manifest.name.as_str(), index)?;

        let system_handle = Arc::into_raw(self.system.clone()) as *mut c_void;
        let context = Box::new(AppContext {
            abi_version: ABI_VERSION,
            service_id: service_id.index() as u16,
            fns: FN_TABLE,
            system_handle,
        });

        slots[index] = Some(AppSlot {
            manifest,
            state: AppState::Loaded,
            source: AppSource::Internal,
            service_id,
            load_time_ms: self.system.timebase().now_ms(),
            task: None,
            context,
            image: None,
            system_handle,
            last_restart_cause: None,
        });

        Ok(AppSlotId::from_index(index))
    }

    /// Reads the image through the partition abstraction, loads it, and
    /// registers the manifest found inside (spec.md §4.M.6).
    pub fn load_from_storage(
        &self,
        reader: &dyn FlashPartitionReader,
        label: &str,
        loader: &ElfLoader,
    ) -> Result<AppSlotId, Error> {
        let handle = reader.find_first(label).ok_or(Error::NotFound)?;
        let size = reader.size(handle)?;
        let mut bytes = vec![0u8; size];
        reader.read(handle, 0, &mut bytes)?;

        let image = loader.load(&bytes)?;
        let manifest_addr = image.manifest_addr.ok_or(Error::ElfInvalid)?;
        let raw = read_raw_manifest(&image, manifest_addr)?;

        let manifest = AppManifest {
            name: rt_abi::BoundedString::try_from_str(raw.name_str())?,
            version: rt_abi::BoundedString::try_from_str(raw.version_str())?,
            author: rt_abi::BoundedString::try_from_str(raw.author_str())?,
            entry: None,
            exit: None,
            user_data: raw.user_data as usize,
        };

        let slot_id = self.register(manifest)?;
        let mut slots = self.slots.lock().unwrap();
        let slot = slots[slot_id.index() as usize].as_mut().ok_or(Error::NotFound)?;
        slot.source = AppSource::Storage;
        slot.image = Some(image);
        Ok(slot_id)
    }

    /// Requires `Loaded` or `Paused`; spawns the app task (spec.md §4.M.3).
    ///
    /// The slot lock is held from before the task is spawned until its
    /// handle is stored, so the spawned task's own completion handler (which
    /// takes the same lock to report `Loaded`/`Error`) can never race ahead
    /// of this function recording that the task is `Running`.
    pub fn start(&self, slot_id: AppSlotId) -> Result<(), Error> {
        let index = slot_id.index() as usize;
        let mut slots = self.slots.lock().unwrap();
        let slot = slots.get_mut(index).and_then(|s| s.as_mut()).ok_or(Error::NotFound)?;
        if !matches!(slot.state, AppState::Loaded | AppState::Paused) {
            return Err(Error::InvalidState);
        }
        let ctx_ptr = SendPtr(slot.context.as_mut() as *mut AppContext);
        let entry_fn = slot.manifest.entry;
        let service_id = slot.service_id;

        self.system.set_state(service_id, ServiceState::Running)?;

        let system = self.system.clone();
        let entry = entry_fn;
        let ctx = ctx_ptr;
        let slots_handle = self.slots.clone();
        let handle = self.system.spawner().spawn(TaskSpec {
            name: format!("app-{index}"),
            stack_size: 4096,
            priority: self.app_priority,
            entry: Box::new(move || {
                let ctx = ctx;
                let rc = entry.map(|f| f(ctx.0)).unwrap_or(0);
                let (service_state, app_state) = if rc == 0 {
                    (ServiceState::Registered, AppState::Loaded)
                } else {
                    (ServiceState::Error, AppState::Error)
                };
                let _ = system.set_state(service_id, service_state);
                let mut slots = slots_handle.lock().unwrap();
                if let Some(slot) = slots.get_mut(index).and_then(|s| s.as_mut()) {
                    slot.state = app_state;
                    slot.task = None;
                }
            }),
        })?;

        if let Some(slot) = slots.get_mut(index).and_then(|s| s.as_mut()) {
            slot.task = Some(handle);
            slot.state = AppState::Running;
        }
        Ok(())
    }

    pub fn pause(&self, slot_id: AppSlotId) -> Result<(), Error> {
        let mut slots = self.slots.lock().unwrap();
        let slot = slots
            .get_mut(slot_id.index() as usize)
            .and_then(|s| s.as_mut())
            .ok_or(Error::NotFound)?;
        if slot.state != AppState::Running {
            return Err(Error::InvalidState);
        }
        if let Some(task) = &slot.task {
            task.suspend()?;
        }
        slot.state = AppState::Paused;
        self.system.set_state(slot.service_id, ServiceState::Paused)
    }

    pub fn resume(&self, slot_id: AppSlotId) -> Result<(), Error> {
        let mut slots = self.slots.lock().unwrap();
        let slot = slots
            .get_mut(slot_id.index() as usize)
            .and_then(|s| s.as_mut())
            .ok_or(Error::NotFound)?;
        if slot.state != AppState::Paused {
            return Err(Error::InvalidState);
        }
        if let Some(task) = &slot.task {
            task.resume()?;
        }
        slot.state = AppState::Running;
        self.system.set_state(slot.service_id, ServiceState::Running)
    }

    /// Calls `manifest.exit` outside the slot lock, then kills the task and
    /// returns the service to `Registered` (spec.md §4.M.4).
    pub fn stop(&self, slot_id: AppSlotId) -> Result<(), Error> {
        let (exit_fn, ctx_ptr, service_id);
        {
            let slots = self.slots.lock().unwrap();
            let slot = slots
                .get(slot_id.index() as usize)
                .and_then(|s| s.as_ref())
                .ok_or(Error::NotFound)?;
            exit_fn = slot.manifest.exit;
            ctx_ptr = SendPtr(slot.context.as_ref() as *const AppContext as *mut AppContext);
            service_id = slot.service_id;
        }
        if let Some(exit) = exit_fn {
            exit(ctx_ptr.0);
        }

        let mut slots = self.slots.lock().unwrap();
        let slot = slots
            .get_mut(slot_id.index() as usize)
            .and_then(|s| s.as_mut())
            .ok_or(Error::NotFound)?;
        if let Some(task) = slot.task.take() {
            task.kill()?;
        }
        slot.state = AppState::Loaded;
        self.system.set_state(service_id, ServiceState::Registered)
    }

    /// Stops if running, unregisters, and releases the slot (spec.md §4.M.4).
    pub fn uninstall(&self, slot_id: AppSlotId) -> Result<(), Error> {
        if matches!(self.state_of(slot_id)?, AppState::Running | AppState::Paused) {
            self.stop(slot_id)?;
        }
        let mut slots = self.slots.lock().unwrap();
        let slot = slots
            .get_mut(slot_id.index() as usize)
            .and_then(|s| s.take())
            .ok_or(Error::NotFound)?;
        self.system.unregister_service(slot.service_id)?;
        unsafe {
            // SAFETY: this reverses the `Arc::into_raw` performed in `register`.
            drop(Arc::from_raw(slot.system_handle as *const System));
        }
        Ok(())
    }

    pub fn state_of(&self, slot_id: AppSlotId) -> Result<AppState, Error> {
        self.slots
            .lock()
            .unwrap()
            .get(slot_id.index() as usize)
            .and_then(|s| s.as_ref())
            .map(|s| s.state)
            .ok_or(Error::NotFound)
    }

    /// Reason the last restart of this slot was attempted, or `None` if it
    /// has never been restarted.
    pub fn restart_cause_of(&self, slot_id: AppSlotId) -> Result<Option<RestartCause>, Error> {
        self.slots
            .lock()
            .unwrap()
            .get(slot_id.index() as usize)
            .and_then(|s| s.as_ref())
            .map(|s| s.last_restart_cause)
            .ok_or(Error::NotFound)
    }

    /// Operator-requested restart (as opposed to a watchdog-triggered one),
    /// e.g. from a management console or CLI.
    pub fn restart_slot(&self, slot_id: AppSlotId) -> Result<(), Error> {
        self.restart_with_cause(slot_id, RestartCause::Requested)
    }

    fn restart_with_cause(&self, slot_id: AppSlotId, cause: RestartCause) -> Result<(), Error> {
        self.stop(slot_id)?;
        self.start(slot_id)?;
        if let Some(slot) = self
            .slots
            .lock()
            .unwrap()
            .get_mut(slot_id.index() as usize)
            .and_then(|s| s.as_mut())
        {
            slot.last_restart_cause = Some(cause);
        }
        Ok(())
    }
}

impl RestartHook for AppManager {
    /// Stop -> Start for apps, per spec.md §4.M.5.
    fn restart(&self, service: ServiceId, cause: RestartCause) -> Result<(), Error> {
        let slot_id = {
            let slots = self.slots.lock().unwrap();
            let index = Self::find_by_service(&slots, service).ok_or(Error::NotFound)?;
            AppSlotId::from_index(index)
        };
        self.restart_with_cause(slot_id, cause)
    }
}

/// Decodes the fixed 92-byte `_app_manifest` layout by hand rather than
/// trusting a particular zerocopy point release's `read_from*` naming.
fn read_raw_manifest(image: &LoadedImage, addr: usize) -> Result<rt_abi::RawAppManifest, Error> {
    const SIZE: usize = core::mem::size_of::<rt_abi::RawAppManifest>();
    let regions = [&image.code_region, &image.data_region, &image.bss_region];
    for region in regions {
        if addr >= region.base && addr + SIZE <= region.base + region.len() {
            let off = addr - region.base;
            let bytes = &region.as_slice()[off..off + SIZE];
            let mut name = [0u8; 32];
            let mut version = [0u8; 16];
            let mut author = [0u8; 32];
            name.copy_from_slice(&bytes[0..32]);
            version.copy_from_slice(&bytes[32..48]);
            author.copy_from_slice(&bytes[48..80]);
            let entry_rva = u32::from_le_bytes(bytes[80..84].try_into().unwrap());
            let exit_rva = u32::from_le_bytes(bytes[84..88].try_into().unwrap());
            let user_data = u32::from_le_bytes(bytes[88..92].try_into().unwrap());
            return Ok(rt_abi::RawAppManifest {
                name,
                version,
                author,
                entry_rva,
                exit_rva,
                user_data,
            });
        }
    }
    Err(Error::ElfInvalid)
}

// -- AppContextFnTable trampolines --
//
// Each function recovers its `System` from `AppContext::system_handle`
// without consuming the stored strong reference (increment-then-reconstruct,
// the standard "peek clone" pattern for a raw pointer owned elsewhere).

unsafe fn system_from_ctx(ctx: *mut AppContext) -> Arc<System> {
    let raw = (*ctx).system_handle as *const System;
    Arc::increment_strong_count(raw);
    Arc::from_raw(raw)
}

fn error_code(e: Error) -> i32 {
    use Error::*;
    -(match e {
        InvalidArg => 1,
        InvalidState => 2,
        NoMemory => 3,
        Timeout => 4,
        NotFound => 5,
        AlreadyExists => 6,
        RegistryFull => 7,
        SubscriptionFull => 8,
        PayloadTooLarge => 9,
        QuotaEventsExceeded => 10,
        QuotaSubscriptionsExceeded => 11,
        QuotaDataSizeExceeded => 12,
        CircularDependency => 13,
        DependencyNotReady => 14,
        SecurityInvalidKey => 15,
        UnresolvedSymbol => 16,
        ElfInvalid => 17,
        ElfUnsupported => 18,
        NoMemoryForCode => 19,
        RestartFailed => 20,
    })
}

fn service_state_code(state: ServiceState) -> u8 {
    match state {
        ServiceState::Registered => 0,
        ServiceState::Running => 1,
        ServiceState::Paused => 2,
        ServiceState::Stopping => 3,
        ServiceState::Error => 4,
    }
}

fn service_state_from_code(code: u8) -> Result<ServiceState, Error> {
    Ok(match code {
        0 => ServiceState::Registered,
        1 => ServiceState::Running,
        2 => ServiceState::Paused,
        3 => ServiceState::Stopping,
        4 => ServiceState::Error,
        _ => return Err(Error::InvalidArg),
    })
}

fn priority_from_code(code: u8) -> Result<Priority, Error> {
    Ok(match code {
        0 => Priority::Low,
        1 => Priority::Normal,
        2 => Priority::High,
        3 => Priority::Critical,
        _ => return Err(Error::InvalidArg),
    })
}

extern "C" fn ffi_register_service(
    ctx: *mut AppContext,
    name: *const u8,
    name_len: u32,
    out_id: *mut u16,
) -> i32 {
    unsafe {
        let system = system_from_ctx(ctx);
        let name = std::slice::from_raw_parts(name, name_len as usize);
        let Ok(name) = core::str::from_utf8(name) else {
            return error_code(Error::InvalidArg);
        };
        match system.register_service(name, 0) {
            Ok(id) => {
                *out_id = id.index() as u16;
                0
            }
            Err(e) => error_code(e),
        }
    }
}

extern "C" fn ffi_unregister_service(ctx: *mut AppContext, id: u16) -> i32 {
    unsafe {
        let system = system_from_ctx(ctx);
        match system.unregister_service(ServiceId::from_index(id as usize)) {
            Ok(()) => 0,
            Err(e) => error_code(e),
        }
    }
}

extern "C" fn ffi_set_state(ctx: *mut AppContext, id: u16, state: u8) -> i32 {
    unsafe {
        let system = system_from_ctx(ctx);
        let Ok(state) = service_state_from_code(state) else {
            return error_code(Error::InvalidArg);
        };
        match system.set_state(ServiceId::from_index(id as usize), state) {
            Ok(()) => 0,
            Err(e) => error_code(e),
        }
    }
}

extern "C" fn ffi_heartbeat(ctx: *mut AppContext, id: u16) -> i32 {
    unsafe {
        let system = system_from_ctx(ctx);
        match system.heartbeat(ServiceId::from_index(id as usize)) {
            Ok(()) => 0,
            Err(e) => error_code(e),
        }
    }
}

extern "C" fn ffi_post(
    ctx: *mut AppContext,
    event_type: u16,
    priority: u8,
    data: *const u8,
    data_len: u32,
) -> i32 {
    unsafe {
        let system = system_from_ctx(ctx);
        let sender = ServiceId::from_index((*ctx).service_id as usize);
        let Ok(priority) = priority_from_code(priority) else {
            return error_code(Error::InvalidArg);
        };
        let data = std::slice::from_raw_parts(data, data_len as usize);
        match system.post(sender, EventTypeId::from_index(event_type as usize), priority, data) {
            Ok(_) => 0,
            Err(e) => error_code(e),
        }
    }
}

extern "C" fn ffi_subscribe(
    ctx: *mut AppContext,
    service: u16,
    event_type: u16,
    handler: EventHandlerFn,
    user_data: *mut c_void,
) -> i32 {
    unsafe {
        let system = system_from_ctx(ctx);
        let handler = Handler::Extern {
            func: handler,
            user_data: ExternUserData(user_data),
        };
        match system.subscribe(ServiceId::from_index(service as usize), EventTypeId::from_index(event_type as usize), handler) {
            Ok(()) => 0,
            Err(e) => error_code(e),
        }
    }
}

extern "C" fn ffi_unsubscribe(ctx: *mut AppContext, service: u16, event_type: u16) -> i32 {
    unsafe {
        let system = system_from_ctx(ctx);
        match system.unsubscribe(ServiceId::from_index(service as usize), EventTypeId::from_index(event_type as usize)) {
            Ok(()) => 0,
            Err(e) => error_code(e),
        }
    }
}

extern "C" fn ffi_register_event_type(
    ctx: *mut AppContext,
    name: *const u8,
    name_len: u32,
    out_id: *mut u16,
) -> i32 {
    unsafe {
        let system = system_from_ctx(ctx);
        let name = std::slice::from_raw_parts(name, name_len as usize);
        let Ok(name) = core::str::from_utf8(name) else {
            return error_code(Error::InvalidArg);
        };
        match system.register_type(name) {
            Ok(id) => {
                *out_id = id.index() as u16;
                0
            }
            Err(e) => error_code(e),
        }
    }
}

extern "C" fn ffi_get_type_name(
    ctx: *mut AppContext,
    id: u16,
    out_buf: *mut u8,
    out_cap: u32,
    out_len: *mut u32,
) -> i32 {
    unsafe {
        let system = system_from_ctx(ctx);
        match system.get_type_name(EventTypeId::from_index(id as usize)) {
            Ok(name) => {
                let bytes = name.as_bytes();
                if bytes.len() > out_cap as usize {
                    return error_code(Error::InvalidArg);
                }
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), out_buf, bytes.len());
                *out_len = bytes.len() as u32;
                0
            }
            Err(e) => error_code(e),
        }
    }
}

extern "C" fn ffi_send_request(
    ctx: *mut AppContext,
    target_event_type: u16,
    req: *const u8,
    req_len: u32,
    resp_buf: *mut u8,
    resp_cap: u32,
    out_resp_len: *mut u32,
    timeout_ms: u32,
) -> i32 {
    unsafe {
        let system = system_from_ctx(ctx);
        let sender = ServiceId::from_index((*ctx).service_id as usize);
        let req = std::slice::from_raw_parts(req, req_len as usize).to_vec();
        let event_type = EventTypeId::from_index(target_event_type as usize);

        let mut scratch = vec![0u8; resp_cap as usize];
        let posting_system = system.clone();
        let post = move |request_id: rt_runtime::reqresp::RequestId| {
            let payload = encode_request(request_id.get(), &req);
            posting_system.post(sender, event_type, Priority::Normal, &payload).map(|_| ())
        };
        match system.send_sync(sender, post, &mut scratch, Duration::from_millis(timeout_ms as u64)) {
            Ok(len) => {
                let len = len.min(resp_cap as usize);
                std::ptr::copy_nonoverlapping(scratch.as_ptr(), resp_buf, len);
                *out_resp_len = len as u32;
                0
            }
            Err(e) => error_code(e),
        }
    }
}

const FN_TABLE: AppContextFnTable = AppContextFnTable {
    register_service: ffi_register_service,
    unregister_service: ffi_unregister_service,
    set_state: ffi_set_state,
    heartbeat: ffi_heartbeat,
    post: ffi_post,
    subscribe: ffi_subscribe,
    unsubscribe: ffi_unsubscribe,
    register_event_type: ffi_register_event_type,
    get_type_name: ffi_get_type_name,
    send_request: ffi_send_request,
};
