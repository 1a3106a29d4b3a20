// src/core/mod.rs

/// The analyzer contract and the group that fans analyzers out.
pub mod analyzer;

/// HTTP, TLS and DNS capabilities consumed by analyzers.
pub mod client;

/// Result model, rule catalogue and the scan report.
pub mod models;

/// Scan orchestration and the built-in analyzers.
pub mod scanner;

/// The scanned host and the per-scan options.
pub mod target;
