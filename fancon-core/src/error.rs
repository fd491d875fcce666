//! Re-export of the shared error type so the rest of the crate can write
//! `crate::error::Result` / `crate::error::FanconError` uniformly.

pub use fancon_error::{FanconError, Result};
