// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The C ABI: `ompt_start_tool`, callback registration and the extern
//! shims.
//!
//! Everything here is glue. The runtime discovers the tool through the
//! `ompt_start_tool` symbol, calls the returned initializer with its lookup
//! function, and from then on invokes the registered extern callbacks,
//! which convert raw integers into the `sys` types and forward to the
//! process-global [`Adapter`]. Events carrying enum values this adapter
//! does not know are skipped with a warning instead of being
//! misinterpreted.
//!
//! The measurement substrate must be installed via [`install`] before the
//! runtime initializes; otherwise `ompt_start_tool` declines and the
//! runtime runs without a tool.

use crate::macros::warn_once;
use crate::mgmt::{Adapter, RuntimeEntryPoints, TaskInfo};
use crate::substrate::Substrate;
use crate::sys::{
    CallbackKind, DispatchKind, MutexKind, OmptData, ParallelFlags, ScopeEndpoint, SetResult,
    SyncRegionKind, TaskFlags, TaskStatus, ThreadKind, WorkKind,
};
use core::ffi::{CStr, c_char, c_int, c_uint, c_void};
use core::num::NonZeroUsize;
use core::ptr;
use std::sync::{Arc, OnceLock};

/// Opaque runtime frame information; never dereferenced by the adapter.
#[repr(C)]
pub struct OmptFrame {
    _private: [u8; 0],
}

/// `ompt_callback_t`: the type-erased callback pointer `ompt_set_callback`
/// accepts.
pub type CallbackFn = Option<unsafe extern "C" fn()>;

/// `ompt_interface_fn_t` / `ompt_function_lookup_t`.
pub type InterfaceFn = Option<unsafe extern "C" fn()>;
pub type LookupFn = unsafe extern "C" fn(*const c_char) -> InterfaceFn;

/// `ompt_set_callback`.
pub type SetCallbackFn = unsafe extern "C" fn(c_int, CallbackFn) -> c_int;
/// `ompt_get_task_info`.
pub type GetTaskInfoFn = unsafe extern "C" fn(
    c_int,
    *mut c_int,
    *mut *mut OmptData,
    *mut *mut OmptFrame,
    *mut *mut OmptData,
    *mut c_int,
) -> c_int;
/// `ompt_finalize_tool`.
pub type FinalizeToolFn = unsafe extern "C" fn();

/// `ompt_start_tool_result_t`.
#[repr(C)]
pub struct StartToolResult {
    pub initialize: unsafe extern "C" fn(LookupFn, c_int, *mut OmptData) -> c_int,
    pub finalize: unsafe extern "C" fn(*mut OmptData),
    pub tool_data: OmptData,
}

struct SyncStatic<T>(T);
// Safety: the descriptor is immutable after construction; the raw data slot
// is never read or written by the adapter.
unsafe impl<T> Sync for SyncStatic<T> {}

static TOOL: SyncStatic<StartToolResult> = SyncStatic(StartToolResult {
    initialize: initialize_tool,
    finalize: finalize_tool,
    tool_data: OmptData::NONE,
});

static ADAPTER: OnceLock<Adapter> = OnceLock::new();

/// Installs the measurement substrate behind the C entry point. Must run
/// before the OpenMP runtime initializes; later calls return the adapter
/// installed first.
pub fn install(substrate: Arc<dyn Substrate>) -> &'static Adapter {
    ADAPTER.get_or_init(|| Adapter::new(substrate))
}

/// The process-global adapter, if a substrate was installed.
pub fn adapter() -> Option<&'static Adapter> {
    ADAPTER.get()
}

/// The runtime's entry into the tool. Everything starts from here.
///
/// # Safety
///
/// Called by the OpenMP runtime with a valid `runtime_version` string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ompt_start_tool(
    omp_version: c_uint,
    runtime_version: *const c_char,
) -> *mut StartToolResult {
    // Safety: the runtime passes a NUL-terminated version string.
    let version = unsafe {
        if runtime_version.is_null() {
            None
        } else {
            CStr::from_ptr(runtime_version).to_str().ok()
        }
    };
    tracing::debug!(omp_version, runtime_version = version, "ompt_start_tool");

    if adapter().is_none() {
        tracing::debug!("no measurement substrate installed, declining tool activation");
        return ptr::null_mut();
    }
    ptr::from_ref(&TOOL.0).cast_mut()
}

unsafe extern "C" fn initialize_tool(
    lookup: LookupFn,
    initial_device_num: c_int,
    _tool_data: *mut OmptData,
) -> c_int {
    tracing::debug!(initial_device_num, "initialize tool");
    let Some(adapter) = adapter() else {
        return 0;
    };

    // OpenMP only allows calling ompt_set_callback from the tool's
    // initializer; events outside the measurement window are filtered by
    // the record-events gate instead of (de)registration.
    // Safety: the runtime's lookup function resolves its own entry points.
    let (set_callback, get_task_info, finalize) = unsafe {
        let set_callback = lookup(c"ompt_set_callback".as_ptr());
        let get_task_info = lookup(c"ompt_get_task_info".as_ptr());
        let finalize = lookup(c"ompt_finalize_tool".as_ptr());
        let (Some(set_callback), Some(get_task_info), Some(finalize)) =
            (set_callback, get_task_info, finalize)
        else {
            tracing::warn!("runtime lacks required entry points, tool disabled");
            return 0;
        };
        // Safety: entry points looked up by name have the documented
        // signatures.
        (
            core::mem::transmute::<unsafe extern "C" fn(), SetCallbackFn>(set_callback),
            core::mem::transmute::<unsafe extern "C" fn(), GetTaskInfoFn>(get_task_info),
            core::mem::transmute::<unsafe extern "C" fn(), FinalizeToolFn>(finalize),
        )
    };

    adapter.initialize_tool(RuntimeEntryPoints {
        get_task_info: Box::new(move |ancestor_level| {
            let mut task_data: *mut OmptData = ptr::null_mut();
            let mut thread_num: c_int = 0;
            // Safety: valid out-pointers; unused outputs may be null.
            let ret = unsafe {
                get_task_info(
                    ancestor_level as c_int,
                    ptr::null_mut(),
                    &raw mut task_data,
                    ptr::null_mut(),
                    ptr::null_mut(),
                    &raw mut thread_num,
                )
            };
            // 2 means the task exists and the information is available.
            (ret == 2).then_some(TaskInfo {
                task_data,
                thread_num: thread_num.unsigned_abs(),
            })
        }),
        finalize_tool: Box::new(move || {
            // Safety: runtime entry point, callable after initialization.
            unsafe { finalize() }
        }),
    });

    // Safety: registration from the initializer, as required.
    unsafe {
        register_host_callbacks(set_callback);
        register_device_callbacks(set_callback);
    }

    // Non-zero indicates success.
    1
}

unsafe extern "C" fn finalize_tool(_tool_data: *mut OmptData) {
    tracing::debug!("tool finalize");
}

/// Registers one callback and logs the runtime's answer.
///
/// # Safety
///
/// Only callable from the tool initializer.
unsafe fn register(set_callback: SetCallbackFn, kind: CallbackKind, callback: CallbackFn) {
    // Safety: per the function contract.
    let status = unsafe { set_callback(kind as c_int, callback) };
    match SetResult::try_from(status) {
        Ok(result) => tracing::debug!(?kind, ?result, "registered callback"),
        Err(raw) => tracing::debug!(?kind, raw, "registered callback (unknown status)"),
    }
}

macro_rules! callback {
    ($f:expr) => {
        // Safety: the runtime calls the callback with the signature
        // belonging to the kind it was registered for.
        Some(unsafe {
            core::mem::transmute::<*const (), unsafe extern "C" fn()>($f as *const ())
        })
    };
}

/// # Safety
///
/// Only callable from the tool initializer.
unsafe fn register_host_callbacks(set_callback: SetCallbackFn) {
    // Safety: forwarded contract.
    unsafe {
        register(set_callback, CallbackKind::ImplicitTask, callback!(cb_implicit_task));
        register(set_callback, CallbackKind::ParallelBegin, callback!(cb_parallel_begin));
        register(set_callback, CallbackKind::ParallelEnd, callback!(cb_parallel_end));
        register(set_callback, CallbackKind::SyncRegion, callback!(cb_sync_region));
        register(set_callback, CallbackKind::TaskCreate, callback!(cb_task_create));
        register(set_callback, CallbackKind::TaskSchedule, callback!(cb_task_schedule));
        register(set_callback, CallbackKind::ThreadBegin, callback!(cb_thread_begin));
        register(set_callback, CallbackKind::ThreadEnd, callback!(cb_thread_end));
        register(set_callback, CallbackKind::Work, callback!(cb_work));
        register(set_callback, CallbackKind::Masked, callback!(cb_masked));
        register(set_callback, CallbackKind::MutexAcquire, callback!(cb_mutex_acquire));
        register(set_callback, CallbackKind::MutexAcquired, callback!(cb_mutex_acquired));
        register(set_callback, CallbackKind::MutexReleased, callback!(cb_mutex_released));
        register(set_callback, CallbackKind::LockInit, callback!(cb_lock_init));
        register(set_callback, CallbackKind::LockDestroy, callback!(cb_lock_destroy));
        register(set_callback, CallbackKind::NestLock, callback!(cb_nest_lock));
        register(set_callback, CallbackKind::Dispatch, callback!(cb_dispatch));
        register(set_callback, CallbackKind::Flush, callback!(cb_flush));
    }
}

/// # Safety
///
/// Only callable from the tool initializer.
unsafe fn register_device_callbacks(set_callback: SetCallbackFn) {
    // Safety: forwarded contract.
    unsafe {
        register(
            set_callback,
            CallbackKind::DeviceInitialize,
            callback!(cb_device_initialize),
        );
    }
}

fn codeptr(raw: *const c_void) -> Option<NonZeroUsize> {
    NonZeroUsize::new(raw.addr())
}

macro_rules! unknown_value {
    ($what:literal, $raw:expr) => {{
        warn_once!("unknown {} value {}, event skipped", $what, $raw);
        return;
    }};
}

unsafe extern "C" fn cb_thread_begin(thread_kind: c_int, thread_data: *mut OmptData) {
    let Some(adapter) = adapter() else { return };
    let Ok(kind) = ThreadKind::try_from(thread_kind) else {
        unknown_value!("ompt_thread_t", thread_kind)
    };
    // Safety: runtime-provided slot.
    unsafe { adapter.thread_begin(kind, thread_data) }
}

unsafe extern "C" fn cb_thread_end(thread_data: *mut OmptData) {
    let Some(adapter) = adapter() else { return };
    // Safety: runtime-provided slot.
    unsafe { adapter.thread_end(thread_data) }
}

unsafe extern "C" fn cb_parallel_begin(
    encountering_task_data: *mut OmptData,
    _encountering_task_frame: *const OmptFrame,
    parallel_data: *mut OmptData,
    requested_parallelism: c_uint,
    flags: c_int,
    codeptr_ra: *const c_void,
) {
    let Some(adapter) = adapter() else { return };
    // Safety: runtime-provided slots.
    unsafe {
        adapter.parallel_begin(
            encountering_task_data,
            parallel_data,
            requested_parallelism,
            ParallelFlags::from_bits_retain(flags as u32),
            codeptr(codeptr_ra),
        );
    }
}

unsafe extern "C" fn cb_parallel_end(
    parallel_data: *mut OmptData,
    encountering_task_data: *mut OmptData,
    flags: c_int,
    codeptr_ra: *const c_void,
) {
    let Some(adapter) = adapter() else { return };
    // Safety: runtime-provided slots.
    unsafe {
        adapter.parallel_end(
            parallel_data,
            encountering_task_data,
            ParallelFlags::from_bits_retain(flags as u32),
            codeptr(codeptr_ra),
        );
    }
}

unsafe extern "C" fn cb_implicit_task(
    endpoint: c_int,
    parallel_data: *mut OmptData,
    task_data: *mut OmptData,
    actual_parallelism: c_uint,
    index: c_uint,
    flags: c_int,
) {
    let Some(adapter) = adapter() else { return };
    let Ok(endpoint) = ScopeEndpoint::try_from(endpoint) else {
        unknown_value!("ompt_scope_endpoint_t", endpoint)
    };
    // Safety: runtime-provided slots.
    unsafe {
        adapter.implicit_task(
            endpoint,
            parallel_data,
            task_data,
            actual_parallelism,
            index,
            TaskFlags::from_bits_retain(flags as u32),
        );
    }
}

unsafe extern "C" fn cb_sync_region(
    kind: c_int,
    endpoint: c_int,
    parallel_data: *mut OmptData,
    task_data: *mut OmptData,
    codeptr_ra: *const c_void,
) {
    let Some(adapter) = adapter() else { return };
    let Ok(kind) = SyncRegionKind::try_from(kind) else {
        unknown_value!("ompt_sync_region_t", kind)
    };
    let Ok(endpoint) = ScopeEndpoint::try_from(endpoint) else {
        unknown_value!("ompt_scope_endpoint_t", endpoint)
    };
    // Safety: runtime-provided slots.
    unsafe { adapter.sync_region(kind, endpoint, parallel_data, task_data, codeptr(codeptr_ra)) }
}

unsafe extern "C" fn cb_work(
    work_type: c_int,
    endpoint: c_int,
    parallel_data: *mut OmptData,
    task_data: *mut OmptData,
    count: u64,
    codeptr_ra: *const c_void,
) {
    let Some(adapter) = adapter() else { return };
    let Ok(kind) = WorkKind::try_from(work_type) else {
        unknown_value!("ompt_work_t", work_type)
    };
    let Ok(endpoint) = ScopeEndpoint::try_from(endpoint) else {
        unknown_value!("ompt_scope_endpoint_t", endpoint)
    };
    // Safety: runtime-provided slots.
    unsafe {
        adapter.work(kind, endpoint, parallel_data, task_data, count, codeptr(codeptr_ra));
    }
}

unsafe extern "C" fn cb_masked(
    endpoint: c_int,
    parallel_data: *mut OmptData,
    task_data: *mut OmptData,
    codeptr_ra: *const c_void,
) {
    let Some(adapter) = adapter() else { return };
    let Ok(endpoint) = ScopeEndpoint::try_from(endpoint) else {
        unknown_value!("ompt_scope_endpoint_t", endpoint)
    };
    // Safety: runtime-provided slots.
    unsafe { adapter.masked(endpoint, parallel_data, task_data, codeptr(codeptr_ra)) }
}

unsafe extern "C" fn cb_task_create(
    encountering_task_data: *mut OmptData,
    _encountering_task_frame: *const OmptFrame,
    new_task_data: *mut OmptData,
    flags: c_int,
    has_dependences: c_int,
    codeptr_ra: *const c_void,
) {
    let Some(adapter) = adapter() else { return };
    // Safety: runtime-provided slots.
    unsafe {
        adapter.task_create(
            encountering_task_data,
            new_task_data,
            TaskFlags::from_bits_retain(flags as u32),
            has_dependences != 0,
            codeptr(codeptr_ra),
        );
    }
}

unsafe extern "C" fn cb_task_schedule(
    prior_task_data: *mut OmptData,
    prior_task_status: c_int,
    next_task_data: *mut OmptData,
) {
    let Some(adapter) = adapter() else { return };
    let Ok(status) = TaskStatus::try_from(prior_task_status) else {
        unknown_value!("ompt_task_status_t", prior_task_status)
    };
    // Safety: runtime-provided slots.
    unsafe { adapter.task_schedule(prior_task_data, status, next_task_data) }
}

unsafe extern "C" fn cb_mutex_acquire(
    kind: c_int,
    hint: c_uint,
    impl_: c_uint,
    wait_id: u64,
    codeptr_ra: *const c_void,
) {
    let Some(adapter) = adapter() else { return };
    let Ok(kind) = MutexKind::try_from(kind) else {
        unknown_value!("ompt_mutex_t", kind)
    };
    // Safety: callback context per the runtime.
    unsafe { adapter.mutex_acquire(kind, hint, impl_, wait_id, codeptr(codeptr_ra)) }
}

unsafe extern "C" fn cb_mutex_acquired(kind: c_int, wait_id: u64, codeptr_ra: *const c_void) {
    let Some(adapter) = adapter() else { return };
    let Ok(kind) = MutexKind::try_from(kind) else {
        unknown_value!("ompt_mutex_t", kind)
    };
    // Safety: callback context per the runtime.
    unsafe { adapter.mutex_acquired(kind, wait_id, codeptr(codeptr_ra)) }
}

unsafe extern "C" fn cb_mutex_released(kind: c_int, wait_id: u64, codeptr_ra: *const c_void) {
    let Some(adapter) = adapter() else { return };
    let Ok(kind) = MutexKind::try_from(kind) else {
        unknown_value!("ompt_mutex_t", kind)
    };
    // Safety: callback context per the runtime.
    unsafe { adapter.mutex_released(kind, wait_id, codeptr(codeptr_ra)) }
}

unsafe extern "C" fn cb_lock_init(
    kind: c_int,
    hint: c_uint,
    impl_: c_uint,
    wait_id: u64,
    codeptr_ra: *const c_void,
) {
    let Some(adapter) = adapter() else { return };
    let Ok(kind) = MutexKind::try_from(kind) else {
        unknown_value!("ompt_mutex_t", kind)
    };
    // Safety: callback context per the runtime.
    unsafe { adapter.lock_init(kind, hint, impl_, wait_id, codeptr(codeptr_ra)) }
}

unsafe extern "C" fn cb_lock_destroy(kind: c_int, wait_id: u64, codeptr_ra: *const c_void) {
    let Some(adapter) = adapter() else { return };
    let Ok(kind) = MutexKind::try_from(kind) else {
        unknown_value!("ompt_mutex_t", kind)
    };
    // Safety: callback context per the runtime.
    unsafe { adapter.lock_destroy(kind, wait_id, codeptr(codeptr_ra)) }
}

unsafe extern "C" fn cb_nest_lock(endpoint: c_int, wait_id: u64, codeptr_ra: *const c_void) {
    let Some(adapter) = adapter() else { return };
    let Ok(endpoint) = ScopeEndpoint::try_from(endpoint) else {
        unknown_value!("ompt_scope_endpoint_t", endpoint)
    };
    // Safety: callback context per the runtime.
    unsafe { adapter.nest_lock(endpoint, wait_id, codeptr(codeptr_ra)) }
}

unsafe extern "C" fn cb_dispatch(
    parallel_data: *mut OmptData,
    task_data: *mut OmptData,
    kind: c_int,
    instance: OmptData,
) {
    let Some(adapter) = adapter() else { return };
    let Ok(kind) = DispatchKind::try_from(kind) else {
        unknown_value!("ompt_dispatch_t", kind)
    };
    // Safety: runtime-provided slots.
    unsafe { adapter.dispatch(parallel_data, task_data, kind, instance) }
}

unsafe extern "C" fn cb_flush(thread_data: *mut OmptData, codeptr_ra: *const c_void) {
    let Some(adapter) = adapter() else { return };
    // Safety: runtime-provided slot.
    unsafe { adapter.flush(thread_data, codeptr(codeptr_ra)) }
}

unsafe extern "C" fn cb_device_initialize(
    device_num: c_int,
    device_type: *const c_char,
    _device: *mut c_void,
    _lookup: LookupFn,
    _documentation: *const c_char,
) {
    let Some(adapter) = adapter() else { return };
    // Safety: the runtime passes a NUL-terminated type string.
    let device_type = unsafe {
        if device_type.is_null() {
            ""
        } else {
            CStr::from_ptr(device_type).to_str().unwrap_or("")
        }
    };
    adapter.device_initialize(device_num, device_type);
}
