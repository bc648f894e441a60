//! Top-level orchestration: CLI parsing, wiring, and the run loop (§6, §7).

pub mod runtime;

pub use runtime::run;
