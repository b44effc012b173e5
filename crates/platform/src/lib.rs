//! # Kestrel Platform
//!
//! Core platform types shared by the Kestrel crates.
//!
//! This crate provides:
//! - Unified error types (`KestrelError`, `KestrelResult`)
//! - The `Clock` abstraction used for every time-based decision
//!
//! # Examples
//!
//! ```
//! use kestrel_platform::{KestrelError, KestrelResult};
//!
//! fn example_function() -> KestrelResult<String> {
//!     Ok("Hello, Kestrel!".to_string())
//! }
//!
//! # fn main() -> KestrelResult<()> {
//! let result = example_function()?;
//! assert_eq!(result, "Hello, Kestrel!");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;
pub mod traits;

pub use error::{KestrelError, KestrelResult};
pub use traits::{system_clock, Clock, ManualClock, SystemClock};

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
