//! PROPBOOK: odds and settlement engine for over/under prop parlays.
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod config;
pub mod types;
pub mod odds;
pub mod storage;
pub mod engine;
pub mod api;
