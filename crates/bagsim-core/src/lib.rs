//! Device simulation engine for bagsimd
//!
//! This crate is the heart of bagsimd, containing:
//! - Per-device state machine (Idle, Running, Off, Depleted)
//! - Simulation handles: one supervised tick task per device
//! - The registry of running handles (at most one per device)
//! - The engine: boot recovery, control surface, graceful shutdown

mod client;
mod engine;
mod handle;
mod machine;
mod registry;

pub use client::*;
pub use engine::*;
pub use handle::*;
pub use machine::*;
pub use registry::*;
