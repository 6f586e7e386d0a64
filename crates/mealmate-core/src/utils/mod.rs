//! Display helpers for status output.

pub mod format;

pub use format::{format_age, format_bytes, truncate_string};
