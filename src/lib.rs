// src/lib.rs

//! Website best practice scanner.
//!
//! The interesting parts are the analyzer orchestration in [`core::analyzer`]
//! and [`core::scanner`], and the cache stack in [`cache`] guarded by the
//! breaker in [`resilience`].

pub mod cache;
pub mod concurrency;
pub mod config;
pub mod core;
pub mod logging;
pub mod monitoring;
pub mod resilience;
