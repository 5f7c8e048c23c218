use std::sync::Mutex;

use ahash::RandomState;
use hashbrown::HashMap;

use crate::{event::OperationKind, util::sync::lock, ThreadId};

#[derive(Clone, Copy, Debug)]
struct Slot {
    size: u64,
    consumed: bool,
}

/// A size handed back by [`PendingCallStore::take`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingSize {
    pub size: u64,
    /// Nothing was staged since the previous take, so `size` is left over
    /// from an earlier call (or 0 if the slot was never used)
    pub stale: bool,
}

/// Requested sizes captured at call entry, keyed by the calling thread and
/// the kind of call, waiting for the matching exit.
///
/// Entry and exit of one call always run on the same thread and the hooked
/// functions do not nest, so one slot per `(thread, kind)` is enough.
#[derive(Default)]
pub struct PendingCallStore {
    slots: Mutex<HashMap<(ThreadId, OperationKind), Slot, RandomState>>,
}

impl PendingCallStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember `size` for the next exit of `kind` on `thread`, overwriting
    /// anything staged before
    pub fn stage(&self, thread: ThreadId, kind: OperationKind, size: u64) {
        lock(&self.slots).insert(
            (thread, kind),
            Slot {
                size,
                consumed: false,
            },
        );
    }

    /// The most recently staged size. The value stays in the slot, so an exit
    /// whose entry was missed reads the previous call's size.
    pub fn take(&self, thread: ThreadId, kind: OperationKind) -> PendingSize {
        match lock(&self.slots).get_mut(&(thread, kind)) {
            Some(slot) => {
                let stale = slot.consumed;
                slot.consumed = true;
                PendingSize {
                    size: slot.size,
                    stale,
                }
            }
            None => PendingSize {
                size: 0,
                stale: true,
            },
        }
    }

    /// Drop every slot belonging to `thread`
    pub fn forget_thread(&self, thread: ThreadId) {
        lock(&self.slots).retain(|&(owner, _), _| owner != thread);
    }

    pub fn len(&self) -> usize {
        lock(&self.slots).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
