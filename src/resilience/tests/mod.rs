// src/resilience/tests/mod.rs
//! Tests for the protective components
