//! Shared test utilities for mapsched integration tests.
//!
//! This module provides:
//! - `TestHarness` for isolated runs against a temporary output directory
//!   and an in-memory job database
//! - Fake renderer, geocoder and notifier collaborators

pub mod harness;

pub use harness::*;
