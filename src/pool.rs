//! Connection pool.
//!
//! The pool owns every live transport. Callers borrow one through an
//! exclusive [`Lease`] keyed by endpoint (`"modbus_tcp://host:502/1"`),
//! which serialises access per device: while one lease is out for a key,
//! further acquires for that key wait for its release.
//!
//! Lock discipline: one internal mutex over the pool state with short
//! critical sections and no I/O under the lock. Connecting, disconnecting
//! and health probing all happen outside it; waiters park on a notifier.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::core::error::{GatewayError, Result};
use crate::core::state::{ConnectionState, RetryPolicy, StateMachine};
use crate::core::traits::Transport;
use crate::events::{Event, EventBus};

/// Connection pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of live transports across all keys.
    pub max_size: usize,

    /// Minimum number of transports the pool keeps warm (informational;
    /// the pool never pre-connects on its own).
    pub min_size: usize,

    /// An available entry idle longer than this is evicted.
    pub max_idle_time: Duration,

    /// An entry older than this is evicted even if kept warm.
    pub max_lifetime: Duration,

    /// Interval between background health cycles.
    pub health_check_interval: Duration,

    /// Deadline for a single `acquire` call.
    pub acquire_timeout: Duration,

    /// Backoff policy for reconnecting entries that saw a wire error.
    pub retry: RetryPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 10,
            min_size: 0,
            max_idle_time: Duration::from_secs(300),
            max_lifetime: Duration::from_secs(3600),
            health_check_interval: Duration::from_secs(60),
            acquire_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

impl PoolConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(GatewayError::invalid_request("pool max_size must be >= 1"));
        }
        if self.min_size > self.max_size {
            return Err(GatewayError::invalid_request(
                "pool min_size must not exceed max_size",
            ));
        }
        Ok(())
    }
}

/// Pool statistics snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    /// Total live entries (available + borrowed).
    pub size: usize,
    /// Entries ready for acquisition.
    pub available: usize,
    /// Entries currently leased out.
    pub borrowed: usize,
    /// Configured capacity.
    pub max_size: usize,
    /// Whether `close()` was called.
    pub closed: bool,
}

struct Entry {
    key: String,
    /// `None` while the transport is out on a lease or a health probe.
    transport: Option<Box<dyn Transport>>,
    sm: StateMachine,
    created_at: Instant,
    last_used_at: Instant,
    use_count: u64,
    borrowed: bool,
}

impl Entry {
    fn age(&self, now: Instant) -> Duration {
        now.duration_since(self.created_at)
    }

    fn idle(&self, now: Instant) -> Duration {
        now.duration_since(self.last_used_at)
    }
}

struct PoolInner {
    entries: HashMap<u64, Entry>,
    /// Keys with a creation in flight (single-flight guard).
    creating: std::collections::HashSet<String>,
    next_id: u64,
    closed: bool,
    health_task: Option<JoinHandle<()>>,
}

struct PoolShared {
    config: PoolConfig,
    bus: Arc<EventBus>,
    inner: Mutex<PoolInner>,
    /// Signalled on every release, eviction, creation or close.
    changed: Notify,
}

impl PoolShared {
    fn lock(&self) -> std::sync::MutexGuard<'_, PoolInner> {
        self.inner.lock().expect("pool lock poisoned")
    }
}

/// Multiplexing connection pool with idle/lifetime eviction and health checks.
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

impl ConnectionPool {
    /// Create a pool with the given configuration and event bus.
    ///
    /// Fails with `InvalidRequest` on an inconsistent configuration.
    pub fn new(config: PoolConfig, bus: Arc<EventBus>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(PoolShared {
                config,
                bus,
                inner: Mutex::new(PoolInner {
                    entries: HashMap::new(),
                    creating: std::collections::HashSet::new(),
                    next_id: 0,
                    closed: false,
                    health_task: None,
                }),
                changed: Notify::new(),
            }),
        })
    }

    /// Create a pool with default configuration on the global bus.
    pub fn with_defaults() -> Self {
        Self::new(PoolConfig::default(), EventBus::global())
            .expect("default pool config is valid")
    }

    /// The pool's configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Acquire an exclusive lease on the transport for `key`.
    ///
    /// When no entry exists the `factory` is invoked to build an unconnected
    /// transport and the pool drives `connect()`; concurrent acquires for the
    /// same key share that single creation. When the key's entry is borrowed
    /// the call waits for its release, bounded by the acquire timeout.
    pub async fn acquire<F, Fut>(&self, key: &str, factory: F) -> Result<Lease>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Box<dyn Transport>>>,
    {
        let deadline = tokio::time::Instant::now() + self.shared.config.acquire_timeout;
        let mut factory = Some(factory);

        // Lazily start the background health loop on first use.
        self.ensure_health_task();

        loop {
            // Register for wakeups before inspecting state so a release
            // between the check and the await is not lost.
            let notified = self.shared.changed.notified();

            enum Action {
                Create,
                Wait,
            }

            let action = {
                let mut inner = self.shared.lock();
                if inner.closed {
                    return Err(GatewayError::PoolClosed);
                }

                // Most-recently-used available entry for this key.
                let best = inner
                    .entries
                    .iter()
                    .filter(|(_, e)| e.key == key && !e.borrowed)
                    .max_by_key(|(_, e)| e.last_used_at)
                    .map(|(id, _)| *id);

                if let Some(id) = best {
                    let entry = inner.entries.get_mut(&id).expect("entry just found");
                    entry.borrowed = true;
                    entry.last_used_at = Instant::now();
                    entry.use_count += 1;
                    let transport = entry.transport.take().expect("available entry has transport");
                    let sm = entry.sm.clone();
                    return Ok(Lease {
                        shared: self.shared.clone(),
                        entry_id: id,
                        key: key.to_string(),
                        transport: Some(transport),
                        sm,
                    });
                }

                let key_exists = inner.entries.values().any(|e| e.key == key);
                if inner.creating.contains(key) || key_exists {
                    Action::Wait
                } else if inner.entries.len() < self.shared.config.max_size {
                    inner.creating.insert(key.to_string());
                    Action::Create
                } else {
                    return Err(GatewayError::PoolExhausted);
                }
            };

            match action {
                Action::Create => {
                    let factory = factory.take().ok_or_else(|| {
                        GatewayError::internal("pool factory consumed twice for one acquire")
                    })?;
                    return self.create_entry(key, factory).await;
                }
                Action::Wait => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(GatewayError::Timeout(self.shared.config.acquire_timeout));
                    }
                }
            }
        }
    }

    /// Build, connect and register a new entry, returning it borrowed.
    async fn create_entry<F, Fut>(&self, key: &str, factory: F) -> Result<Lease>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Box<dyn Transport>>>,
    {
        let sm = StateMachine::new(key, self.shared.bus.clone());

        let result = async {
            let mut transport = factory().await?;
            sm.transition(ConnectionState::Connecting)?;
            match transport.connect().await {
                Ok(()) => {
                    sm.transition(ConnectionState::Connected)?;
                    Ok(transport)
                }
                Err(err) => {
                    sm.transition(ConnectionState::Failed)?;
                    Err(err)
                }
            }
        }
        .await;

        match result {
            Ok(transport) => {
                let now = Instant::now();
                let entry_id = {
                    let mut inner = self.shared.lock();
                    inner.creating.remove(key);
                    let id = inner.next_id;
                    inner.next_id += 1;
                    inner.entries.insert(
                        id,
                        Entry {
                            key: key.to_string(),
                            transport: None,
                            sm: sm.clone(),
                            created_at: now,
                            last_used_at: now,
                            use_count: 1,
                            borrowed: true,
                        },
                    );
                    id
                };
                self.shared.changed.notify_waiters();
                Ok(Lease {
                    shared: self.shared.clone(),
                    entry_id,
                    key: key.to_string(),
                    transport: Some(transport),
                    sm,
                })
            }
            Err(err) => {
                {
                    let mut inner = self.shared.lock();
                    inner.creating.remove(key);
                }
                self.shared.changed.notify_waiters();
                // Transport-level faults surface as the connection family.
                Err(match err {
                    GatewayError::Io(e) => GatewayError::ConnectionFailed(e.to_string()),
                    other => other,
                })
            }
        }
    }

    /// Run one eviction + health pass over the available entries.
    ///
    /// Borrowed entries are skipped; the borrower owns the wire.
    pub async fn health_cycle(&self) {
        let now = Instant::now();
        let config = &self.shared.config;

        // Pull candidates out under the lock, probe outside it.
        let candidates: Vec<(u64, String, Box<dyn Transport>, StateMachine, bool)> = {
            let mut inner = self.shared.lock();
            let ids: Vec<u64> = inner
                .entries
                .iter()
                .filter(|(_, e)| !e.borrowed && e.transport.is_some())
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| {
                    let entry = inner.entries.get_mut(&id)?;
                    let stale = entry.age(now) > config.max_lifetime
                        || entry.idle(now) > config.max_idle_time;
                    let transport = entry.transport.take()?;
                    entry.borrowed = true;
                    Some((id, entry.key.clone(), transport, entry.sm.clone(), stale))
                })
                .collect()
        };

        for (id, key, mut transport, sm, stale) in candidates {
            let evict_reason = if stale {
                Some("stale")
            } else if !transport.is_connected() {
                Some("disconnected")
            } else if !transport.is_healthy().await {
                self.shared
                    .bus
                    .emit(Event::health_check_failed(&key, "health probe failed"));
                tracing::warn!(key = %key, "health probe failed, evicting entry");
                Some("unhealthy")
            } else {
                None
            };

            match evict_reason {
                Some(reason) => {
                    tracing::debug!(key = %key, reason, "evicting pooled entry");
                    self.evict(id, &mut transport, &sm).await;
                }
                None => {
                    let mut inner = self.shared.lock();
                    if let Some(entry) = inner.entries.get_mut(&id) {
                        entry.transport = Some(transport);
                        entry.borrowed = false;
                    }
                }
            }
        }
        self.shared.changed.notify_waiters();
    }

    async fn evict(&self, id: u64, transport: &mut Box<dyn Transport>, sm: &StateMachine) {
        if let Err(err) = transport.disconnect().await {
            tracing::debug!(error = %err, "disconnect during eviction failed");
        }
        let _ = sm.transition(ConnectionState::Disconnected);
        let mut inner = self.shared.lock();
        inner.entries.remove(&id);
    }

    fn ensure_health_task(&self) {
        let mut inner = self.shared.lock();
        if inner.closed || inner.health_task.is_some() {
            return;
        }
        let pool = self.clone();
        let interval = self.shared.config.health_check_interval;
        inner.health_task = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                pool.health_cycle().await;
            }
        }));
    }

    /// Close the pool: available entries are disconnected now, borrowed
    /// entries are disconnected as their leases release.
    pub async fn close(&self) {
        let (task, victims) = {
            let mut inner = self.shared.lock();
            inner.closed = true;
            let task = inner.health_task.take();
            let ids: Vec<u64> = inner
                .entries
                .iter()
                .filter(|(_, e)| !e.borrowed && e.transport.is_some())
                .map(|(id, _)| *id)
                .collect();
            let victims: Vec<(u64, Box<dyn Transport>, StateMachine)> = ids
                .into_iter()
                .filter_map(|id| {
                    let entry = inner.entries.get_mut(&id)?;
                    let transport = entry.transport.take()?;
                    Some((id, transport, entry.sm.clone()))
                })
                .collect();
            (task, victims)
        };

        if let Some(task) = task {
            task.abort();
        }
        for (id, mut transport, sm) in victims {
            if let Err(err) = transport.disconnect().await {
                tracing::debug!(error = %err, "disconnect during close failed");
            }
            let _ = sm.transition(ConnectionState::Disconnected);
            let mut inner = self.shared.lock();
            inner.entries.remove(&id);
        }
        self.shared.changed.notify_waiters();
    }

    /// Current statistics snapshot.
    pub fn stats(&self) -> PoolStats {
        let inner = self.shared.lock();
        let borrowed = inner.entries.values().filter(|e| e.borrowed).count();
        PoolStats {
            size: inner.entries.len(),
            available: inner.entries.len() - borrowed,
            borrowed,
            max_size: self.shared.config.max_size,
            closed: inner.closed,
        }
    }

    /// The connection state of the entry for `key`, if one exists.
    pub fn entry_state(&self, key: &str) -> Option<ConnectionState> {
        let inner = self.shared.lock();
        inner
            .entries
            .values()
            .find(|e| e.key == key)
            .map(|e| e.sm.state())
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool").field("stats", &self.stats()).finish()
    }
}

enum ReleaseAction {
    /// Put the transport back for reuse.
    Return,
    /// Disconnect and remove the entry.
    Evict,
    /// Reconnect with backoff, then return or evict.
    Reconnect,
}

/// Exclusive, scope-bound handle to a pooled transport.
///
/// Dropping the lease releases it; `release()` does the same explicitly and
/// lets the caller await the hand-back. Double release is a no-op.
pub struct Lease {
    shared: Arc<PoolShared>,
    entry_id: u64,
    key: String,
    transport: Option<Box<dyn Transport>>,
    sm: StateMachine,
}

impl Lease {
    /// The pool key this lease belongs to.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The entry's connection state.
    pub fn state(&self) -> ConnectionState {
        self.sm.state()
    }

    /// Mutable access to the borrowed transport.
    pub fn transport(&mut self) -> &mut dyn Transport {
        self.transport
            .as_deref_mut()
            .expect("lease transport already released")
    }

    /// Record an operation error observed through this lease.
    ///
    /// Transport-level faults move the entry to `Reconnecting`; the pool
    /// retries the connection (with backoff) once the lease is released.
    pub fn fault(&mut self, error: &GatewayError) {
        if error.needs_reconnect() && self.sm.state() == ConnectionState::Connected {
            let _ = self.sm.transition(ConnectionState::Reconnecting);
        }
    }

    /// Release the lease back to the pool.
    pub async fn release(mut self) {
        let Some(transport) = self.transport.take() else {
            return;
        };
        release_transport(
            self.shared.clone(),
            self.entry_id,
            self.key.clone(),
            transport,
            self.sm.clone(),
        )
        .await;
    }
}

impl std::ops::Deref for Lease {
    type Target = dyn Transport;

    fn deref(&self) -> &Self::Target {
        self.transport
            .as_deref()
            .expect("lease transport already released")
    }
}

impl std::ops::DerefMut for Lease {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.transport
            .as_deref_mut()
            .expect("lease transport already released")
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let Some(transport) = self.transport.take() else {
            return;
        };
        let shared = self.shared.clone();
        let entry_id = self.entry_id;
        let key = self.key.clone();
        let sm = self.sm.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(release_transport(shared, entry_id, key, transport, sm));
            }
            Err(_) => {
                // No runtime: dropping the transport closes the socket.
                let mut inner = shared.lock();
                inner.entries.remove(&entry_id);
            }
        }
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("key", &self.key)
            .field("state", &self.sm.state())
            .finish()
    }
}

/// Shared release path for explicit release and drop.
async fn release_transport(
    shared: Arc<PoolShared>,
    entry_id: u64,
    key: String,
    mut transport: Box<dyn Transport>,
    sm: StateMachine,
) {
    let now = Instant::now();
    let action = {
        let inner = shared.lock();
        let entry = inner.entries.get(&entry_id);
        match entry {
            None => ReleaseAction::Evict,
            Some(_) if inner.closed => ReleaseAction::Evict,
            Some(_) if sm.state() == ConnectionState::Reconnecting => ReleaseAction::Reconnect,
            Some(_) if !transport.is_connected() => ReleaseAction::Reconnect,
            Some(entry)
                if entry.age(now) > shared.config.max_lifetime
                    || entry.idle(now) > shared.config.max_idle_time =>
            {
                ReleaseAction::Evict
            }
            Some(_) => ReleaseAction::Return,
        }
    };

    match action {
        ReleaseAction::Return => {
            let mut inner = shared.lock();
            if let Some(entry) = inner.entries.get_mut(&entry_id) {
                entry.transport = Some(transport);
                entry.borrowed = false;
                entry.last_used_at = Instant::now();
            }
            drop(inner);
            shared.changed.notify_waiters();
        }
        ReleaseAction::Evict => {
            if let Err(err) = transport.disconnect().await {
                tracing::debug!(error = %err, key = %key, "disconnect on release failed");
            }
            let _ = sm.transition(ConnectionState::Disconnected);
            {
                let mut inner = shared.lock();
                inner.entries.remove(&entry_id);
            }
            shared.changed.notify_waiters();
        }
        ReleaseAction::Reconnect => {
            // Wire error during the borrow: retry with backoff. The entry
            // stays marked borrowed so nobody can lease a dead transport.
            if sm.state() == ConnectionState::Connected {
                let _ = sm.transition(ConnectionState::Reconnecting);
            }
            let mut recovered = false;
            for delay in shared.config.retry.delays() {
                tokio::time::sleep(delay).await;
                {
                    let inner = shared.lock();
                    if inner.closed {
                        break;
                    }
                }
                match transport.connect().await {
                    Ok(()) => {
                        recovered = true;
                        break;
                    }
                    Err(err) => {
                        tracing::debug!(key = %key, error = %err, "reconnect attempt failed");
                    }
                }
            }
            if recovered {
                let _ = sm.transition(ConnectionState::Connected);
                let mut inner = shared.lock();
                if let Some(entry) = inner.entries.get_mut(&entry_id) {
                    entry.transport = Some(transport);
                    entry.borrowed = false;
                    entry.last_used_at = Instant::now();
                }
                drop(inner);
                shared.changed.notify_waiters();
            } else {
                let _ = sm.transition(ConnectionState::Failed);
                if let Err(err) = transport.disconnect().await {
                    tracing::debug!(error = %err, key = %key, "disconnect after reconnect failure");
                }
                let _ = sm.transition(ConnectionState::Disconnected);
                {
                    let mut inner = shared.lock();
                    inner.entries.remove(&entry_id);
                }
                shared.changed.notify_waiters();
            }
        }
    }
}
