//! Integration test entry point for ethspv-node.
//!
//! Run with: cargo test --test integration

mod harness;
mod sessions;
mod sync;
