//! Test helpers for capgate integration tests.
//!
//! - Mock capability backend (axum) that records what the gateway sends
//! - Gateway construction and request/response shortcuts

#![allow(unused_imports)] // Not every test file uses every helper
#![allow(dead_code)]

pub mod gateway;
pub mod mock_backend;

pub use gateway::*;
pub use mock_backend::*;
