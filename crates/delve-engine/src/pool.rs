use crate::health::{ConnectionHealth, HealthLimits};
use delve_core::{Backend, Result};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};

type Connector = Box<dyn Fn() -> Result<Arc<dyn Backend>> + Send + Sync>;

struct Slot {
    conn: Arc<dyn Backend>,
    health: ConnectionHealth,
    generation: u64,
}

#[derive(Default)]
struct State {
    slot: Option<Slot>,
    generations: u64,
}

/// A connection handed out by [`ConnectionPool::get`].
///
/// Outcomes are reported back with the lease, so a run that started on a connection that has
/// since been rotated cannot touch the health of its replacement.
#[derive(Clone)]
pub struct Lease {
    conn: Arc<dyn Backend>,
    generation: u64,
}

impl Lease {
    pub fn backend(&self) -> &dyn Backend {
        self.conn.as_ref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Point-in-time view of the pooled connection, for diagnostics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolSnapshot {
    pub generation: u64,
    pub age_s: u64,
    pub idle_s: u64,
    pub request_count: u64,
    pub consecutive_failures: u32,
}

/// Holds at most one live connection and replaces it when its health says so.
///
/// Shared by every concurrent run; all state sits behind one mutex that is never held across
/// an await.
pub struct ConnectionPool {
    connector: Connector,
    limits: HealthLimits,
    state: Mutex<State>,
}

impl ConnectionPool {
    pub fn new<F>(limits: HealthLimits, connector: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn Backend>> + Send + Sync + 'static,
    {
        Self {
            connector: Box::new(connector),
            limits,
            state: Mutex::new(State::default()),
        }
    }

    /// Pool over a fixed backend; "rotation" hands out the same object under a new generation.
    pub fn with_backend(limits: HealthLimits, backend: Arc<dyn Backend>) -> Self {
        Self::new(limits, move || Ok(backend.clone()))
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn limits(&self) -> &HealthLimits {
        &self.limits
    }

    /// Current connection, creating a fresh one first when there is none or it needs refresh.
    pub fn get(&self) -> Result<Lease> {
        let mut st = self.lock();
        if let Some(slot) = &st.slot {
            match slot.health.refresh_reason(&self.limits) {
                None => {
                    return Ok(Lease {
                        conn: slot.conn.clone(),
                        generation: slot.generation,
                    })
                }
                Some(reason) => {
                    info!(generation = slot.generation, %reason, "rotating connection");
                }
            }
        }
        let conn = (self.connector)()?;
        st.generations += 1;
        let generation = st.generations;
        info!(generation, backend = conn.name(), "opened connection");
        st.slot = Some(Slot {
            conn: conn.clone(),
            health: ConnectionHealth::new(),
            generation,
        });
        Ok(Lease { conn, generation })
    }

    pub fn record_success(&self, lease: &Lease) {
        let mut st = self.lock();
        if let Some(slot) = st.slot.as_mut().filter(|s| s.generation == lease.generation) {
            slot.health.record_success();
        }
    }

    pub fn record_failure(&self, lease: &Lease) {
        let mut st = self.lock();
        if let Some(slot) = st.slot.as_mut().filter(|s| s.generation == lease.generation) {
            slot.health.record_failure();
        }
    }

    /// Drop the current connection; the next `get` builds a new one.
    pub fn force_invalidate(&self) {
        let mut st = self.lock();
        if let Some(slot) = st.slot.take() {
            warn!(
                generation = slot.generation,
                failures = slot.health.consecutive_failures(),
                "connection invalidated"
            );
        }
    }

    pub fn snapshot(&self) -> Option<PoolSnapshot> {
        let st = self.lock();
        st.slot.as_ref().map(|s| PoolSnapshot {
            generation: s.generation,
            age_s: s.health.age().as_secs(),
            idle_s: s.health.idle().as_secs(),
            request_count: s.health.request_count(),
            consecutive_failures: s.health.consecutive_failures(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_pool(limits: HealthLimits) -> (ConnectionPool, Arc<AtomicUsize>) {
        let opened = Arc::new(AtomicUsize::new(0));
        let n = opened.clone();
        let pool = ConnectionPool::new(limits, move || {
            n.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(ScriptedBackend::default()) as Arc<dyn Backend>)
        });
        (pool, opened)
    }

    #[test]
    fn healthy_connection_is_reused() {
        let (pool, opened) = counting_pool(HealthLimits::default());
        let a = pool.get().unwrap();
        pool.record_success(&a);
        let b = pool.get().unwrap();
        assert_eq!(a.generation(), b.generation());
        assert_eq!(opened.load(Ordering::SeqCst), 1);
        assert_eq!(pool.snapshot().unwrap().request_count, 1);
    }

    #[test]
    fn failures_rotate_the_connection() {
        let (pool, opened) = counting_pool(HealthLimits::default());
        let a = pool.get().unwrap();
        for _ in 0..3 {
            pool.record_failure(&a);
        }
        let b = pool.get().unwrap();
        assert_ne!(a.generation(), b.generation());
        assert_eq!(opened.load(Ordering::SeqCst), 2);
        assert_eq!(pool.snapshot().unwrap().consecutive_failures, 0);
    }

    #[test]
    fn stale_lease_cannot_touch_new_connection() {
        let (pool, _) = counting_pool(HealthLimits::default());
        let old = pool.get().unwrap();
        pool.force_invalidate();
        assert!(pool.snapshot().is_none());
        let fresh = pool.get().unwrap();
        pool.record_failure(&old);
        pool.record_failure(&old);
        pool.record_failure(&old);
        let again = pool.get().unwrap();
        assert_eq!(fresh.generation(), again.generation());
    }

    #[test]
    fn request_cap_forces_new_generation() {
        let limits = HealthLimits {
            max_requests: 2,
            ..HealthLimits::default()
        };
        let (pool, opened) = counting_pool(limits);
        let a = pool.get().unwrap();
        pool.record_success(&a);
        pool.record_success(&a);
        let b = pool.get().unwrap();
        assert_eq!(b.generation(), a.generation() + 1);
        assert_eq!(opened.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn connector_error_surfaces() {
        let pool = ConnectionPool::new(HealthLimits::default(), || {
            Err(delve_core::Error::NotConfigured("no key".into()))
        });
        assert!(matches!(
            pool.get(),
            Err(delve_core::Error::NotConfigured(_))
        ));
    }
}
