//! Core data model for the Stratus workload-placement and
//! deployment-orchestration engine.
//!
//! This crate owns the canonical Node/Task/Placement model, the typed
//! configuration tree, and the event envelope shared by every subsystem.
//! It has no runtime dependencies beyond serialization so that search
//! engines and coordinators can share types without pulling in I/O.

pub mod config;
pub mod events;
pub mod model;

pub use config::*;
pub use events::*;
pub use model::*;
