//! Shared fixtures for the integration tests
//!
//! Each test binary compiles this module separately and uses a subset of it.

#![allow(dead_code)]

pub mod config;
pub mod mock_llm;
