//! Shared state between the scan worker and its observers
//!
//! The worker publishes immutable [`DebugSnapshot`]s; callers on other
//! threads read them without waiting on pipeline work.

pub mod state;

pub use state::{DebugSnapshot, FrameCounters, LogRing, WorkerState};
