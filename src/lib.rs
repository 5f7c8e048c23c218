//! Heap operation tracing for an instrumented target process.
//!
//! The instrumentation host reports image loads, call entries and exits of
//! the target's allocation functions, frees and exceptions. [`HeapTracer`]
//! pairs those notifications up per thread, keeps track of live chunks and
//! writes one line per heap operation to a buffered log.

pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod externc;
pub mod fault;
pub mod host;
pub mod registry;
pub mod resolve;
pub mod serialize;
pub mod sink;
mod util;

/// An address in the target's address space
pub type Address = u64;

/// Thread id as assigned by the instrumentation host
pub type ThreadId = u32;

pub use crate::{
    config::TraceOptions,
    engine::HeapTracer,
    error::{Result, TraceError},
    event::{HeapEvent, OperationKind},
    host::{Host, ProcessHost},
    sink::{BufferedLogSink, Destination},
};
