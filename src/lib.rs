//! Purpose: Library crate behind the `relaybuf` binary and its tests.
//! Exports: `core` (framing, queue, sources, destinations, delivery), `api`, `endpoint`.
//! Role: Everything except argument parsing, signals, and the pidfile.
//! Invariants: Pipeline components take their configuration explicitly; there is no global state.
pub mod api;
pub mod core;
pub mod endpoint;
