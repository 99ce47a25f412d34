// src/tests/mod.rs
//! End-to-end tests of the composed pipeline
