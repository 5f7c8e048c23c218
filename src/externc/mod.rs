//! C entry points for the instrumentation host. The host calls these from
//! its own callbacks; they all forward into one process-wide tracer.

use std::{
    ffi::{c_char, CStr},
    slice,
};

use libc::{c_int, c_uint, size_t};
use once_cell::sync::OnceCell;

use crate::{
    config::TraceOptions,
    engine::HeapTracer,
    error::Result,
    event::OperationKind,
    fault::ExceptionRecord,
    host::ProcessHost,
    Address,
};

static TRACER: OnceCell<HeapTracer<ProcessHost>> = OnceCell::new();

pub const HEAPLOG_ALLOCATE: c_uint = 0;
pub const HEAPLOG_REALLOCATE: c_uint = 1;
pub const HEAPLOG_VIRTUALALLOC: c_uint = 2;

fn kind_from_raw(kind: c_uint) -> Option<OperationKind> {
    match kind {
        HEAPLOG_ALLOCATE => Some(OperationKind::Allocate),
        HEAPLOG_REALLOCATE => Some(OperationKind::Reallocate),
        HEAPLOG_VIRTUALALLOC => Some(OperationKind::VirtualAlloc),
        _ => None,
    }
}

/// # Safety
///
/// `s` must be null or a valid nul-terminated string
unsafe fn lossy(s: *const c_char) -> String {
    if s.is_null() {
        String::new()
    } else {
        // SAFETY: requirement passed to caller
        unsafe { CStr::from_ptr(s) }.to_string_lossy().into_owned()
    }
}

fn with_tracer<F>(f: F) -> c_int
where
    F: FnOnce(&HeapTracer<ProcessHost>) -> Result<()>,
{
    let Some(tracer) = TRACER.get() else {
        log::warn!("heaplog notification before heaplog_init()");
        return -1;
    };
    match f(tracer) {
        Ok(()) => 0,
        Err(e) => {
            log::error!("{e}");
            -1
        }
    }
}

/// Start tracing. `config_path` names a JSON options file, or is null to read
/// the `HEAPLOG_*` environment. Returns 0 on success.
///
/// # Safety
///
/// `config_path` must be null or a valid nul-terminated string
#[no_mangle]
pub unsafe extern "C" fn heaplog_init(config_path: *const c_char) -> c_int {
    let _ = env_logger::try_init();
    let options = if config_path.is_null() {
        TraceOptions::from_env()
    } else {
        // SAFETY: requirement passed to caller
        TraceOptions::from_json_file(unsafe { lossy(config_path) })
    };
    let result = TRACER.get_or_try_init(|| HeapTracer::open(options?, ProcessHost));
    match result {
        Ok(_) => 0,
        Err(e) => {
            log::error!("could not start tracing: {e}");
            -1
        }
    }
}

/// # Safety
///
/// `name` must be null or a valid nul-terminated string
#[no_mangle]
pub unsafe extern "C" fn heaplog_image_loaded(
    name: *const c_char,
    base: Address,
    end: Address,
) -> c_int {
    // SAFETY: requirement passed to caller
    let name = unsafe { lossy(name) };
    with_tracer(|t| t.on_image_loaded(&name, base, end).map(|_| ()))
}

/// # Safety
///
/// `function` must be null or a valid nul-terminated string
#[no_mangle]
pub unsafe extern "C" fn heaplog_hook_installed(
    function: *const c_char,
    address: Address,
) -> c_int {
    // SAFETY: requirement passed to caller
    let function = unsafe { lossy(function) };
    with_tracer(|t| t.on_hook_installed(&function, address))
}

#[no_mangle]
pub extern "C" fn heaplog_call_entry(thread: c_uint, kind: c_uint, size: u64) -> c_int {
    let Some(kind) = kind_from_raw(kind) else {
        return -1;
    };
    with_tracer(|t| {
        t.on_call_entry(thread, kind, size);
        Ok(())
    })
}

#[no_mangle]
pub extern "C" fn heaplog_call_exit(
    thread: c_uint,
    kind: c_uint,
    result: Address,
    caller: Address,
) -> c_int {
    let Some(kind) = kind_from_raw(kind) else {
        return -1;
    };
    with_tracer(|t| t.on_call_exit(thread, kind, result, caller).map(|_| ()))
}

#[no_mangle]
pub extern "C" fn heaplog_free(address: Address, caller: Address) -> c_int {
    with_tracer(|t| t.on_free(address, caller).map(|_| ()))
}

/// Report an exception. `names` and `values` hold `count` registers. Fatal
/// codes never return: the process is terminated once the logs are closed.
///
/// # Safety
///
/// - `names` must point to `count` valid nul-terminated strings
/// - `values` must point to `count` addresses
/// - either may be null when `count` is 0
#[no_mangle]
pub unsafe extern "C" fn heaplog_exception(
    thread: c_uint,
    fault_address: Address,
    fault_code: u32,
    names: *const *const c_char,
    values: *const Address,
    count: size_t,
) -> c_int {
    let registers = if count == 0 || names.is_null() || values.is_null() {
        Vec::new()
    } else {
        // SAFETY: requirement passed to caller
        let (names, values) = unsafe {
            (
                slice::from_raw_parts(names, count),
                slice::from_raw_parts(values, count),
            )
        };
        names
            .iter()
            .zip(values)
            // SAFETY: requirement passed to caller
            .map(|(&name, &value)| (unsafe { lossy(name) }, value))
            .collect()
    };
    let record = ExceptionRecord {
        thread_id: thread,
        fault_address,
        fault_code,
        registers,
    };
    with_tracer(|t| t.on_exception(&record).map(|_| ()))
}

#[no_mangle]
pub extern "C" fn heaplog_thread_start(thread: c_uint) -> c_int {
    with_tracer(|t| {
        t.on_thread_start(thread);
        Ok(())
    })
}

#[no_mangle]
pub extern "C" fn heaplog_thread_stop(thread: c_uint) -> c_int {
    with_tracer(|t| {
        t.on_thread_stop(thread);
        Ok(())
    })
}

/// Returns 1 to follow the child, 0 not to, -1 on error
#[no_mangle]
pub extern "C" fn heaplog_child_process(child: c_uint) -> c_int {
    let mut follow = false;
    match with_tracer(|t| {
        follow = t.on_child_process(child)?;
        Ok(())
    }) {
        0 => c_int::from(follow),
        err => err,
    }
}

/// Write the footer and close the logs. Safe to call more than once.
#[no_mangle]
pub extern "C" fn heaplog_fini() -> c_int {
    with_tracer(|t| t.finish())
}
