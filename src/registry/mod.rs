//! Shared state mutated by every thread of the target: loaded images, live
//! chunks, and sizes staged between a call's entry and exit.

pub mod chunk;
pub mod module;
pub mod pending;

pub use self::{
    chunk::ChunkRegistry,
    module::{ModuleImage, ModuleRegistry},
    pending::{PendingCallStore, PendingSize},
};
