//! # vmctl Common
//!
//! Shared utilities for the vmctl components.
//!
//! ## Logging
//!
//! ```rust,ignore
//! use vmctl_common::{init_logging_with_format, LogFormat};
//!
//! init_logging_with_format("info", LogFormat::Pretty).unwrap();
//! tracing::info!(vm_id = "vm-1", "VM created");
//! ```

pub mod logging;

pub use logging::{init_logging, init_logging_json, init_logging_with_format, LogFormat};
