//! Integration test binary: all integration tests in one binary to keep link
//! time down.
//!
//! See the matklad pattern: <https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html>

// Allow unwrap/expect in test code
#![allow(clippy::unwrap_used, clippy::expect_used)]

mod helpers;

mod barge_in;
mod config_roundtrip;
mod conversation_flow;
mod openai_contract;
