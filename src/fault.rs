//! Exception reports for the exception log.

use crate::{resolve::AddressResolver, Address, ThreadId};

const RULE: &str = "===========================================";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExceptionRecord {
    pub thread_id: ThreadId,
    pub fault_address: Address,
    pub fault_code: u32,
    /// Register name and value, in the order the host captured them
    pub registers: Vec<(String, Address)>,
}

impl ExceptionRecord {
    /// The full block written to the exception log. Every address is run
    /// through `resolver`, which is what makes this slow.
    pub fn render(&self, pid: u32, timestamp: u64, resolver: &AddressResolver<'_>) -> String {
        let mut lines = Vec::with_capacity(self.registers.len() + 5);
        lines.push(RULE.to_owned());
        lines.push(
            format!(
                "Exception {:#010x} in thread {} at {:#x} {}",
                self.fault_code,
                self.thread_id,
                self.fault_address,
                resolver.describe(self.fault_address)
            )
            .trim_end()
            .to_owned(),
        );
        lines.push(format!("Timestamp: {timestamp}"));
        lines.push(format!("PID: {pid}"));
        for (name, value) in &self.registers {
            lines.push(
                format!("{name}: {value:#010x} {}", resolver.describe(*value))
                    .trim_end()
                    .to_owned(),
            );
        }
        lines.push(RULE.to_owned());
        lines.join("\n")
    }
}
