//! Environment variable helpers used by `EngineConfig::from_env()`.
//!
//! Every knob of the engine can be overridden with a `TPC_*` variable.
//! Unset or unparsable values fall back to the supplied default.
//!
//! ```ignore
//! use tpc_core::env::{env_get, env_get_bool, env_get_millis, env_get_size};
//!
//! let reactors: usize = env_get("TPC_REACTORS", 4);
//! let spin = env_get_bool("TPC_SPIN", false);
//! let timeout = env_get_millis("TPC_CONNECT_TIMEOUT_MS", Duration::from_secs(5));
//! let buf = env_get_size("TPC_READ_BUFFER", 64 * 1024); // accepts "64K", "16M"
//! ```

use std::str::FromStr;
use std::time::Duration;

/// Parse `key` as `T`, or return `default`.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// `Some(T)` if `key` is set and parses.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Boolean: "1", "true", "yes", "on" (case-insensitive) are true, anything
/// else that is set is false. Unset returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(
            val.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Milliseconds as a `Duration`.
#[inline]
pub fn env_get_millis(key: &str, default: Duration) -> Duration {
    env_get_opt::<u64>(key)
        .map(Duration::from_millis)
        .unwrap_or(default)
}

/// Byte size with an optional `K`, `M` or `G` suffix (powers of 1024).
pub fn env_get_size(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| parse_size(&v))
        .unwrap_or(default)
}

fn parse_size(raw: &str) -> Option<usize> {
    let raw = raw.trim();
    let (digits, shift) = match raw.chars().last()?.to_ascii_uppercase() {
        'K' => (&raw[..raw.len() - 1], 10),
        'M' => (&raw[..raw.len() - 1], 20),
        'G' => (&raw[..raw.len() - 1], 30),
        _ => (raw, 0),
    };
    let n: usize = digits.trim().parse().ok()?;
    n.checked_mul(1usize << shift)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let val: usize = env_get("__TPC_TEST_UNSET_12345__", 42);
        assert_eq!(val, 42);
        let val: Option<u16> = env_get_opt("__TPC_TEST_UNSET_12345__");
        assert!(val.is_none());
        assert_eq!(env_get_str("__TPC_TEST_UNSET_12345__", "x"), "x");
    }

    #[test]
    fn test_env_get_with_set_var() {
        std::env::set_var("__TPC_TEST_NUM__", " 123 ");
        let val: usize = env_get("__TPC_TEST_NUM__", 0);
        assert_eq!(val, 123);
        std::env::remove_var("__TPC_TEST_NUM__");
    }

    #[test]
    fn test_env_get_invalid_parse() {
        std::env::set_var("__TPC_TEST_INVALID__", "not_a_number");
        let val: usize = env_get("__TPC_TEST_INVALID__", 99);
        assert_eq!(val, 99);
        std::env::remove_var("__TPC_TEST_INVALID__");
    }

    #[test]
    fn test_env_get_bool_variants() {
        for (raw, expect) in [("1", true), ("TRUE", true), ("on", true), ("0", false), ("junk", false)] {
            std::env::set_var("__TPC_TEST_BOOL__", raw);
            assert_eq!(env_get_bool("__TPC_TEST_BOOL__", !expect), expect, "{raw}");
        }
        std::env::remove_var("__TPC_TEST_BOOL__");
        assert!(env_get_bool("__TPC_TEST_BOOL__", true));
    }

    #[test]
    fn test_env_get_millis() {
        std::env::set_var("__TPC_TEST_MS__", "250");
        assert_eq!(
            env_get_millis("__TPC_TEST_MS__", Duration::ZERO),
            Duration::from_millis(250)
        );
        std::env::remove_var("__TPC_TEST_MS__");
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("4096"), Some(4096));
        assert_eq!(parse_size("64K"), Some(64 * 1024));
        assert_eq!(parse_size("16m"), Some(16 << 20));
        assert_eq!(parse_size("1G"), Some(1 << 30));
        assert_eq!(parse_size("K"), None);
        assert_eq!(parse_size(""), None);
        assert_eq!(parse_size("12Q"), None);
    }
}
