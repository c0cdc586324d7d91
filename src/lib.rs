//! Ephemeral service environments for integration package testing.
//!
//! A deployer is selected from the package's `_dev/deploy` directory, drives
//! Docker Compose, kind/kubectl or Terraform through a set-up, health-wait,
//! network-attach and teardown lifecycle, and reports the resulting
//! [`deployer::ServiceInfo`] back to the caller.

pub type Result<T> = color_eyre::eyre::Result<T>;

pub mod cli;
pub mod compose;
pub mod config;
pub mod deployer;
pub mod docker;
pub mod environment;
pub mod files;
pub mod imagesgc;
pub mod kind;
pub mod kubectl;
pub mod retry;
pub mod runner;
pub mod signals;
pub mod stack;
pub mod units;
pub mod variants;
pub mod wait;

pub use environment::Environment;
