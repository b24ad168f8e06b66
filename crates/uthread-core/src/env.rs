//! Environment variable helpers used by the `from_env()` config builders
//!
//! ```ignore
//! use uthread_core::env::{env_get, env_get_bool};
//!
//! let port: u16 = env_get("UTHREAD_PORT", 8080);
//! let protect = env_get_bool("UTHREAD_STACK_PROTECT", false);
//! ```

use std::str::FromStr;

/// Parse `key` as `T`, falling back to `default` when unset or unparsable
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Parse `key` as `T` if it is set and well-formed
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Boolean flag: "1", "true", "yes", "on" (any case) are true, "0", "false",
/// "no", "off" are false, anything else yields `default`
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => match val.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

/// String value or `default`
#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_unset_uses_default() {
        let val: usize = env_get("__UTHREAD_TEST_UNSET__", 42);
        assert_eq!(val, 42);
        assert!(env_get_opt::<u16>("__UTHREAD_TEST_UNSET__").is_none());
        assert_eq!(env_get_str("__UTHREAD_TEST_UNSET__", "x"), "x");
    }

    #[test]
    fn test_env_get_parses_and_trims() {
        std::env::set_var("__UTHREAD_TEST_NUM__", " 123 ");
        let val: u64 = env_get("__UTHREAD_TEST_NUM__", 0);
        assert_eq!(val, 123);

        std::env::set_var("__UTHREAD_TEST_NUM__", "abc");
        let val: u64 = env_get("__UTHREAD_TEST_NUM__", 9);
        assert_eq!(val, 9);
        std::env::remove_var("__UTHREAD_TEST_NUM__");
    }

    #[test]
    fn test_env_get_bool_variants() {
        let key = "__UTHREAD_TEST_BOOL__";
        for v in ["1", "true", "YES", "on"] {
            std::env::set_var(key, v);
            assert!(env_get_bool(key, false), "{}", v);
        }
        for v in ["0", "false", "No", "off"] {
            std::env::set_var(key, v);
            assert!(!env_get_bool(key, true), "{}", v);
        }
        std::env::set_var(key, "maybe");
        assert!(env_get_bool(key, true));
        assert!(!env_get_bool(key, false));
        std::env::remove_var(key);
    }
}
