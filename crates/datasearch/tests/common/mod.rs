//! Shared test utilities for datasearch integration tests.
//!
//! This module provides:
//! - `TestHarness` for isolated tests against an on-disk database
//! - Builders for datasets, executors and configuration JSON

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::{t0, TestHarness};
