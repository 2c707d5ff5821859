//! End-to-end tests running several nodes over loopback TCP.

mod harness;
mod integration_tests;

pub use harness::{node_config, HarnessConfig, TestHarness};
