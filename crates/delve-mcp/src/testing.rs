//! Test-only helpers.

// Env vars are process-global; serialize tests that mutate them.
static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

/// Clears the given keys for the life of the guard and restores them on drop.
pub(crate) struct EnvGuard {
    _lock: std::sync::MutexGuard<'static, ()>,
    saved: Vec<(String, Option<String>)>,
}

impl EnvGuard {
    pub(crate) fn new(keys: &[&str]) -> Self {
        // A panicking test must not poison every later one.
        let lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let saved: Vec<(String, Option<String>)> = keys
            .iter()
            .map(|k| (k.to_string(), std::env::var(k).ok()))
            .collect();
        for (k, _) in &saved {
            std::env::remove_var(k);
        }
        Self { _lock: lock, saved }
    }

    pub(crate) fn set(&self, k: &str, v: &str) {
        std::env::set_var(k, v);
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (k, v) in self.saved.drain(..) {
            match v {
                Some(val) => std::env::set_var(k, val),
                None => std::env::remove_var(k),
            }
        }
    }
}
