//! Environment variable utilities
//!
//! Used by configuration types to apply `CHANIO_*` overrides on top of
//! compiled-in defaults.
//!
//! ```ignore
//! use chanio_core::env::{env_get, env_get_opt};
//!
//! let threads: usize = env_get("CHANIO_THREADS", 4);
//! let model: Option<String> = env_get_opt("CHANIO_THREAD_MODEL");
//! ```

use std::str::FromStr;

/// Get environment variable parsed as type T, or return default
///
/// Unset and unparsable values both fall back to `default`.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Get environment variable as optional value
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
