//! Kernel performance-event plumbing
//!
//! - **`sys`** - raw `perf_event_open` surface: attribute struct, constants,
//!   the syscall and its ioctls
//! - **`ring`** - one memory-mapped ring buffer and its record framing
//! - **`records`** - typed parsing of the record kinds the capture consumes
//! - **`manager`** - the per-CPU ring fleet, descriptor budget and the
//!   unified poll consumer

pub mod manager;
pub mod records;
pub mod ring;
pub mod sys;

pub use manager::{plan_probe_coverage, PerfRingManager, RingBudget, RingKind};
pub use records::PerfRecord;
pub use ring::PerfRing;
