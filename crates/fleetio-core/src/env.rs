//! Environment variable helpers used by `EngineConfig::from_env`.
//!
//! ```ignore
//! use fleetio_core::env::{env_get, env_get_bool, env_get_millis};
//!
//! let workers: usize = env_get("FLEETIO_WORKERS", 8);
//! let nodelay = env_get_bool("FLEETIO_NODELAY", true);
//! // "0" disables, unset keeps the default
//! let sweep = env_get_millis("FLEETIO_LIVENESS_MS", Some(Duration::from_secs(5)));
//! ```

use std::str::FromStr;
use std::time::Duration;

/// Parse `key` as `T`, falling back to `default` when unset or malformed.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// `Some(T)` only when `key` is set and parses.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// "1", "true", "yes", "on" (any case) are true. Any other set value is
/// false. Unset returns `default`.
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

/// Millisecond interval where `0` means "disabled".
///
/// Unset or unparsable keeps `default`.
pub fn env_get_millis(key: &str, default: Option<Duration>) -> Option<Duration> {
    match env_get_opt::<u64>(key) {
        Some(0) => None,
        Some(ms) => Some(Duration::from_millis(ms)),
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Each test owns its variable names; the test harness runs in parallel.

    #[test]
    fn unset_returns_default() {
        let v: usize = env_get("__FLEETIO_TEST_UNSET__", 42);
        assert_eq!(v, 42);
        assert!(env_get_opt::<u16>("__FLEETIO_TEST_UNSET__").is_none());
        assert!(env_get_bool("__FLEETIO_TEST_UNSET__", true));
    }

    #[test]
    fn parses_with_whitespace() {
        std::env::set_var("__FLEETIO_TEST_NUM__", " 123 ");
        let v: usize = env_get("__FLEETIO_TEST_NUM__", 0);
        assert_eq!(v, 123);
        std::env::remove_var("__FLEETIO_TEST_NUM__");
    }

    #[test]
    fn malformed_falls_back() {
        std::env::set_var("__FLEETIO_TEST_BAD__", "eight");
        let v: usize = env_get("__FLEETIO_TEST_BAD__", 8);
        assert_eq!(v, 8);
        std::env::remove_var("__FLEETIO_TEST_BAD__");
    }

    #[test]
    fn bool_variants() {
        for (raw, want) in [("1", true), ("TRUE", true), ("on", true), ("0", false), ("off", false)] {
            std::env::set_var("__FLEETIO_TEST_BOOL__", raw);
            assert_eq!(env_get_bool("__FLEETIO_TEST_BOOL__", !want), want, "{raw}");
        }
        std::env::remove_var("__FLEETIO_TEST_BOOL__");
    }

    #[test]
    fn millis_zero_disables() {
        let dflt = Some(Duration::from_secs(5));
        assert_eq!(env_get_millis("__FLEETIO_TEST_MS_UNSET__", dflt), dflt);

        std::env::set_var("__FLEETIO_TEST_MS__", "0");
        assert_eq!(env_get_millis("__FLEETIO_TEST_MS__", dflt), None);
        std::env::set_var("__FLEETIO_TEST_MS__", "250");
        assert_eq!(
            env_get_millis("__FLEETIO_TEST_MS__", dflt),
            Some(Duration::from_millis(250))
        );
        std::env::remove_var("__FLEETIO_TEST_MS__");
    }
}
