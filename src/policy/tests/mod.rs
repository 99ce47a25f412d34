// src/policy/tests/mod.rs
//! Tests for the policy engine

mod watch_tests;
