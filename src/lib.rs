//! bpforge: blueprint expansion and validation.
//!
//! Loads a multi-group deployment blueprint, wires modules to each other
//! through `use` lists and `$(...)` references, and runs structural and
//! cloud preflight validators before the expanded blueprint is exported.

pub mod cli;
pub mod config;
pub mod core;
pub mod modules;
pub mod validators;
