//! CLI command implementations.

pub mod runs;
pub mod setup;
pub mod worker;
pub mod workflows;
