//! Heap operation records and the rule that turns them into log lines.
//!
//! Rendering is a pure function of a [`HeapEvent`] and its
//! [`RenderOptions`]: no lookups happen here, the caller module has already
//! been resolved by the time the event exists.

use std::{
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

use crate::{serialize::serde_hex, Address};

pub mod history;

pub use self::history::EventLog;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Allocate,
    Reallocate,
    VirtualAlloc,
    Free,
}

impl OperationKind {
    /// Does a completed operation of this kind leave a live chunk behind?
    pub const fn creates_chunk(self) -> bool {
        !matches!(self, Self::Free)
    }

    /// Raw page allocations legitimately land anywhere in the address space,
    /// so they skip the noise filter.
    pub const fn is_noise_filtered(self) -> bool {
        !matches!(self, Self::VirtualAlloc)
    }

    /// The name used in rendered lines and address descriptions
    pub const fn label(self) -> &'static str {
        match self {
            Self::Allocate => "alloc",
            Self::Reallocate => "realloc",
            Self::VirtualAlloc => "virtualalloc",
            Self::Free => "free",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapEvent {
    pub kind: OperationKind,
    #[serde(with = "serde_hex")]
    pub chunk_start: Address,
    pub size: u64,
    #[serde(with = "serde_hex")]
    pub chunk_end: Address,
    /// Return address of the call site
    #[serde(with = "serde_hex")]
    pub caller: Address,
    /// May be empty if nothing owns `caller`
    pub caller_module: String,
    /// Seconds since the unix epoch
    pub timestamp: u64,
}

impl HeapEvent {
    pub fn new(
        kind: OperationKind,
        chunk_start: Address,
        size: u64,
        caller: Address,
        caller_module: String,
        timestamp: u64,
    ) -> Self {
        Self {
            kind,
            chunk_start,
            size,
            chunk_end: chunk_start.saturating_add(size),
            caller,
            caller_module,
            timestamp,
        }
    }

    /// Does `[chunk_start, chunk_end]` contain `address`? Both ends are
    /// inclusive.
    pub fn contains(&self, address: Address) -> bool {
        self.chunk_start <= address && address <= self.chunk_end
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RenderOptions {
    /// Process id printed at the start of every line
    pub pid: u32,
    pub show_timestamps: bool,
    pub silent: bool,
}

/// Render `event` as a single log line (without the trailing newline).
/// Returns `None` in silent mode.
pub fn render(event: &HeapEvent, options: &RenderOptions) -> Option<String> {
    if options.silent {
        return None;
    }
    let prefix = if options.show_timestamps {
        format!("PID: {} | {} | ", options.pid, event.timestamp)
    } else {
        format!("PID: {} | ", options.pid)
    };
    let HeapEvent {
        kind,
        chunk_start,
        size,
        caller,
        caller_module,
        ..
    } = event;
    let body = match kind {
        OperationKind::Allocate => {
            format!("alloc({size:#x}) = {chunk_start:#x} from {caller:#x} ({caller_module})")
        }
        OperationKind::Reallocate | OperationKind::VirtualAlloc => {
            format!("{kind}({size:#x}) at {chunk_start:#x} from {caller:#x} ({caller_module})")
        }
        OperationKind::Free => format!(
            "free({chunk_start:#x}) from {caller:#x} (size was {size:#x}) ({caller_module})"
        ),
    };
    Some(prefix + &body)
}

/// Current wall-clock time in whole seconds since the unix epoch
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
