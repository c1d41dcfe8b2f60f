//! Common helper functions for Maple.

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a previous holder panicked.
///
/// Session state stays usable after a panicking callback; the panic itself is
/// reported by the task that raised it.
pub fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Read a boolean flag from the environment.
///
/// `1`, `true`, `yes` and `on` (any case) are truthy; any other value is false.
/// Returns `default` when the variable is unset.
pub fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => parse_bool(&value),
        Err(_) => default,
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool_truthy() {
        assert!(parse_bool("1"));
        assert!(parse_bool("TRUE"));
        assert!(parse_bool(" yes "));
        assert!(parse_bool("On"));
    }

    #[test]
    fn test_parse_bool_falsy() {
        assert!(!parse_bool("0"));
        assert!(!parse_bool(""));
        assert!(!parse_bool("enabled"));
    }

    #[test]
    fn test_lock_unpoisoned_recovers_after_panic() {
        let mutex = std::sync::Arc::new(Mutex::new(5));
        let poisoner = mutex.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.lock().unwrap();
            panic!("poison");
        })
        .join();
        assert!(mutex.is_poisoned());
        assert_eq!(*lock_unpoisoned(&mutex), 5);
    }

    #[test]
    fn test_env_bool_default_when_unset() {
        assert!(env_bool("MAPLE_TEST_SURELY_UNSET_FLAG", true));
        assert!(!env_bool("MAPLE_TEST_SURELY_UNSET_FLAG", false));
    }
}
