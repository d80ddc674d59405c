//! gatesync store: fans the watches of several kinds and namespaces into
//! one hash-deduplicated stream of immutable snapshots.

#![forbid(unsafe_code)]

mod emitter;
mod mux;
mod supervisor;

pub use emitter::{CurrentSnapshot, EmitterError, ForceEmit, SnapshotEmitter, SnapshotStream};
pub use mux::Multiplexer;
pub use supervisor::Supervisor;
