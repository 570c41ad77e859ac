//! # AlbumKit Common
//!
//! Logging configuration and small shared helpers for the AlbumKit offline
//! cache and mutation-replay layer.
//!
//! ## Features
//!
//! - Logging configuration and setup (`tracing-subscriber`)
//! - Wall-clock helpers used to stamp durable records

pub mod clock;
pub mod logging;

pub use clock::now_millis;
pub use logging::{init_logging, LogConfig, LogFormat, LogInitError};
