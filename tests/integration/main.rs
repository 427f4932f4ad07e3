//! Integration tests: full prop → parlay → settlement lifecycle against a
//! real SQLite store.

mod concurrency;
mod fixtures;
mod lifecycle;
