// src/config/tests/mod.rs
//! Tests for configuration parsing and validation

mod serde_tests;
