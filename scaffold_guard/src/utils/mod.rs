//! # Utility Modules
//!
//! - **`logging`**: Initializes the `tracing` subscriber (stderr or rolling file).
//! - **`time`**: Serde helpers that store durations as integer milliseconds.

pub mod logging;
pub mod time;
