//! Turning a bare address into something a person can read: the image that
//! owns it, or the heap chunks it has fallen inside over the whole run.

use crate::{event::EventLog, registry::ModuleRegistry, Address};

/// Names whatever an address points into: a loaded image if one owns it,
/// otherwise every chunk (live or long freed) it ever fell inside.
pub struct AddressResolver<'a> {
    modules: &'a ModuleRegistry,
    events: &'a EventLog,
}

impl<'a> AddressResolver<'a> {
    pub fn new(modules: &'a ModuleRegistry, events: &'a EventLog) -> Self {
        Self { modules, events }
    }

    /// `[module]`, or `alloc(size=0x20) realloc(size=0x40)` style fragments,
    /// or an empty string when nothing matches. Walks the whole event log, so
    /// keep this off the allocation path.
    pub fn describe(&self, address: Address) -> String {
        if address == 0 {
            return String::new();
        }
        if let Some(image) = self.modules.find_owner(address) {
            return format!("[{}]", image.name);
        }
        self.events
            .chunks_containing(address)
            .iter()
            .map(|event| format!("{}(size={:#x})", event.kind, event.size))
            .collect::<Vec<_>>()
            .join(" ")
    }
}
