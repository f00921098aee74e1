//! # Muxfile Testkit
//!
//! Test utilities for the muxfile engine.
//!
//! This crate provides:
//! - A fault-injecting storage backend for rollback and crash tests
//! - Storage fixtures with automatic cleanup
//! - Property-based test generators using proptest

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fault;
pub mod fixtures;
pub mod ops;

pub use fault::{FaultBackend, FaultControls};
pub use fixtures::TestStorage;
pub use ops::{ops_strategy, payload_strategy, StorageOp};
