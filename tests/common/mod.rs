//! Shared fixtures for command bus integration tests.

#![allow(dead_code)]

pub mod harness;

pub use harness::*;
