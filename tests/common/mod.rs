//! Shared test utilities for ehci-hcd tests
//!
//! This module provides the simulated controller, callback recorder and
//! descriptor helpers used across multiple test files.

#![allow(dead_code)]

pub mod mock_hardware;

// Re-export commonly used items
pub use mock_hardware::{
    advance_queue, async_ring, complete_all, complete_descriptor, descriptor, fire_interrupt,
    queue_chain, reset_delay, test_bed, Controller, MockDelay, Pool, Recorder, TestBed,
};
