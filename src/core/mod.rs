//! Core infrastructure.
//!
//! - [`config`] - Configuration parsing and validation
//! - [`runtime`] - Node startup and shutdown
//! - [`time`] - Millisecond ticks and clocks
//! - [`error`] - Engine error types and front-end mapping

pub mod config;
pub mod error;
pub mod runtime;
pub mod time;
