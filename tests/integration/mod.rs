//! Integration test suite for reconflow.
//!
//! These tests exercise whole workflows from target to final report,
//! plus the scheduler, budget router and event stream through their
//! public APIs. They verify that all components work together correctly.
//!
//! # Test Categories
//!
//! - `workflow_e2e`: Full workflow execution tests
//! - `scheduling`: Dependency ordering, propagation and determinism
//! - `budget`: Tier routing and the spend ceiling
//! - `streaming`: Event sequencing and resumable consumers
//!
//! # CI Compatibility
//!
//! Task runners and reasoning providers are scripted; nothing touches the
//! network, making these tests safe to run in CI environments.


mod budget;
mod scheduling;
mod streaming;
mod workflow_e2e;
