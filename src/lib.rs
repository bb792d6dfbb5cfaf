// Expose modules for testing
pub mod attach;
pub mod callstack;
pub mod capture;
pub mod cli;
pub mod domain;
pub mod inspect;
pub mod perf;
pub mod probes;
pub mod sampling;
pub mod sinks;
pub mod symbols;
