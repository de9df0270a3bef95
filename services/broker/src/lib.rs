//! Herald notification server.
//!
//! # Purpose
//! Wires the broker crates into a runnable service: configuration, observability
//! and the process lifecycle. Used by the `herald-server` binary and its tests.
pub mod config;
pub mod observability;
pub mod server;

#[cfg(test)]
// Env guards and HTTP helpers shared by the unit tests.
mod test_support;
