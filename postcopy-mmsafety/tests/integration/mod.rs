//! Integration tests for the postcopy migration run.
//!
//! The orchestrator is driven end to end against scripted in-memory
//! instances (see `emulator`), so no emulator binary or userfaultfd support
//! is needed.
//!
//! Run with: `cargo test --test integration`

mod emulator;
mod migration;
