//! Integration tests for testbed
//!
//! Scenarios run real processes: shell commands for the process runner and a
//! fake docker script for whole deployer lifecycles.

pub mod infrastructure;
pub mod scenarios;

pub use infrastructure::{fake_runtime, FakeDockerHarness, PackageFixture};
