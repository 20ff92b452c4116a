//! Shared test utilities for listing-engine integration tests.
//!
//! This module provides:
//! - `TestHarness` for isolated engines on a temp SQLite file
//! - Scripted phase executors with call accounting

pub mod executors;
pub mod harness;

pub use executors::*;
pub use harness::TestHarness;
