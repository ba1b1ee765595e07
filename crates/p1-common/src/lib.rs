//! P1 Common Library
//!
//! Shared error handling and logging setup for the P1 meter workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`P1Error`] and the [`Result`] alias
//! - **Logging**: [`logging::init_logging`] configured from a [`logging::LogConfig`]
//!
//! # Example
//!
//! ```no_run
//! use p1_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = LogConfig::from_env()?;
//!     init_logging(&config)?;
//!     tracing::info!("meter poller starting");
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{P1Error, Result};
