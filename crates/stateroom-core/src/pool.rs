//! Stateful instance pool — session storage, eviction ordering, and the
//! persist/restore bridge.
//!
//! One entry per live or restorable session, keyed by [`SessionKey`]. Each
//! key walks a fixed state machine:
//!
//! ```text
//! ABSENT → CHECKED_OUT ⇄ QUEUED → PERSISTED → CHECKED_OUT (restored) → … → REMOVED
//! ```
//!
//! | State | Where | Meaning |
//! |-------|-------|---------|
//! | checked out | index, not queue | held by an in-flight call |
//! | queued | index + queue | idle, evictable, oldest at the head |
//! | persisted | passivation store | serialized out, restorable on demand |
//!
//! # Concurrency contract
//!
//! The index and eviction queue live behind a single mutex; the critical
//! section only moves pointers. Lifecycle callbacks and store I/O always run
//! with the lock released. Per-session exclusivity is enforced logically:
//! a session is either in the queue (free to take) or absent from it
//! (checked out) — absence-from-queue *is* the exclusion mechanism. The one
//! exception is same-transaction re-entry: an entry bound to an open
//! transaction may be obtained again.
//!
//! # Eviction
//!
//! A checkin that pushes the queue past capacity synchronously pops up to
//! `bulk_passivate` entries from the head (oldest first), runs their
//! passivation callbacks, and hands the survivors to the store as a single
//! batch — one `passivate_batch` call per pass. Failures inside the pass are
//! absorbed: logged, counted, never surfaced to the caller whose checkin
//! triggered it.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use tracing::{error, info, warn};

use crate::config::ContainerConfig;
use crate::error::PoolError;
use crate::passivation::{PassivatedSession, PassivationStore};
use crate::session::{SessionComponent, SessionKey};
use crate::transaction::TransactionHandle;

/// A pooled component instance.
///
/// The pool's bookkeeping guarantees a single logical holder; the `Arc`
/// exists so same-transaction re-entry can hand out the same instance, and
/// the `Mutex` makes the aliasing sound if an embedder violates the
/// single-caller contract anyway.
pub type SharedInstance<C> = Arc<Mutex<C>>;

/// Elapsed idle time since `ts`, saturating to zero on clock skew.
fn idle_since(ts: SystemTime) -> Duration {
    SystemTime::now().duration_since(ts).unwrap_or_default()
}

// =============================================================================
// Ancillary state
// =============================================================================

/// Opaque side-channel value attached to a session entry.
///
/// Transaction policies use this slot to retain the session's transaction
/// handle between calls. Setting a transaction-typed value also binds the
/// entry to that transaction (pinning it against eviction); setting `None`
/// clears both the slot and the binding.
#[derive(Default)]
pub enum AncillaryState {
    /// Nothing attached.
    #[default]
    None,
    /// A retained transaction handle; binds the entry to the transaction.
    Transaction(Arc<dyn TransactionHandle>),
    /// Arbitrary policy-private payload; leaves the binding untouched.
    Opaque(Box<dyn Any + Send>),
}

impl std::fmt::Debug for AncillaryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Transaction(handle) => {
                f.debug_tuple("Transaction").field(&handle.id()).finish()
            }
            Self::Opaque(_) => f.write_str("Opaque(..)"),
        }
    }
}

/// Narrow view of the pool that transaction policies program against:
/// the ancillary slot and the transaction binding, nothing else.
pub trait AncillaryAccess: Send + Sync {
    /// Attach a value to the session. Transaction-typed values bind the
    /// entry to that transaction; `None` clears the binding.
    fn set_ancillary(&self, key: &SessionKey, value: AncillaryState) -> Result<(), PoolError>;

    /// Remove and return the session's attached value. The transaction
    /// binding, if any, is left in place.
    fn take_ancillary(&self, key: &SessionKey) -> Result<AncillaryState, PoolError>;

    /// The transaction this session is currently bound to, if any.
    fn bound_transaction(
        &self,
        key: &SessionKey,
    ) -> Result<Option<Arc<dyn TransactionHandle>>, PoolError>;
}

// =============================================================================
// Pool internals
// =============================================================================

/// Counters describing pool traffic since construction.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Sessions registered via `create`.
    pub creates: u64,
    /// Successful `obtain` calls (including restores and re-entries).
    pub checkouts: u64,
    /// Successful `checkin` calls (including pinned ones).
    pub checkins: u64,
    /// Sessions restored from the passivation store.
    pub restores: u64,
    /// Sessions persisted by eviction passes.
    pub evictions: u64,
    /// Sessions destroyed because their idle timeout elapsed.
    pub expirations: u64,
    /// Sessions destroyed for any other reason: explicit `free`, callback
    /// failure in a passivation batch, or a failed bulk persist.
    pub discards: u64,
}

/// One session entry. Never exposed outside the pool.
struct SessionEntry<C> {
    instance: SharedInstance<C>,
    ancillary: AncillaryState,
    bound_transaction: Option<Arc<dyn TransactionHandle>>,
    /// Refreshed on every queue insertion; expiry compares against this,
    /// never against creation time.
    last_activity: SystemTime,
    queued: bool,
}

/// Index + eviction queue, guarded as one unit.
struct PoolState<C> {
    index: HashMap<SessionKey, SessionEntry<C>>,
    queue: VecDeque<SessionKey>,
    stats: PoolStats,
}

impl<C> PoolState<C> {
    fn remove_from_queue(&mut self, key: &SessionKey) {
        if let Some(pos) = self.queue.iter().position(|queued| queued == key) {
            self.queue.remove(pos);
        }
    }
}

/// What `obtain` decided under the lock; acted on after releasing it.
enum Checkout<C> {
    Ready(SharedInstance<C>),
    ExpiredInMemory(SharedInstance<C>),
    TryRestore,
}

// =============================================================================
// InstancePool
// =============================================================================

/// The stateful instance pool.
///
/// Generic over the component type `C` and the passivation store `S`; see
/// the module docs for the state machine and concurrency contract.
pub struct InstancePool<C, S> {
    config: ContainerConfig,
    store: S,
    state: Mutex<PoolState<C>>,
}

impl<C, S> InstancePool<C, S> {
    fn lock(&self) -> MutexGuard<'_, PoolState<C>> {
        // A poisoned guard still holds structurally sound state; every
        // operation re-checks the entry invariants it relies on.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<C, S> std::fmt::Debug for InstancePool<C, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let guard = self.lock();
        f.debug_struct("InstancePool")
            .field("capacity", &self.config.capacity)
            .field("len", &guard.index.len())
            .field("queued", &guard.queue.len())
            .field("stats", &guard.stats)
            .finish()
    }
}

impl<C, S> InstancePool<C, S>
where
    C: SessionComponent,
    S: PassivationStore<C>,
{
    /// Create a pool with the given configuration and passivation store.
    #[must_use]
    pub fn new(config: ContainerConfig, store: S) -> Self {
        Self {
            config,
            store,
            state: Mutex::new(PoolState {
                index: HashMap::new(),
                queue: VecDeque::new(),
                stats: PoolStats::default(),
            }),
        }
    }

    /// The pool's configuration.
    #[must_use]
    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    /// The passivation store backing this pool.
    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Number of sessions resident in memory (checked out or queued).
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().index.len()
    }

    /// True if no sessions are resident.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().index.is_empty()
    }

    /// Number of idle sessions currently eligible for eviction.
    #[must_use]
    pub fn queued_len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Snapshot of the traffic counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.lock().stats.clone()
    }

    /// Register a brand-new session. The entry starts checked out: the
    /// caller holds it until the first [`checkin`](Self::checkin).
    pub fn create(&self, key: SessionKey, instance: C) -> Result<SharedInstance<C>, PoolError> {
        let mut guard = self.lock();
        if guard.index.contains_key(&key) {
            return Err(PoolError::DuplicateKey(key));
        }
        let shared = Arc::new(Mutex::new(instance));
        guard.index.insert(
            key,
            SessionEntry {
                instance: Arc::clone(&shared),
                ancillary: AncillaryState::None,
                bound_transaction: None,
                last_activity: SystemTime::now(),
                queued: false,
            },
        );
        guard.stats.creates += 1;
        Ok(shared)
    }

    /// Check out the session for an in-flight call.
    ///
    /// Queued entries are dequeued and handed out (expired ones are
    /// destroyed instead, with the remove callback invoked and its failure
    /// absorbed). Persisted entries are restored through the store and the
    /// activation callback — unless already expired, in which case they are
    /// discarded *without* the remove callback. An entry checked out by
    /// another call fails with `ConcurrentAccess`, except when it is bound
    /// to a still-open transaction: the same instance is handed out again
    /// for same-transaction re-entry.
    pub fn obtain(&self, key: &SessionKey) -> Result<SharedInstance<C>, PoolError> {
        let checkout = {
            let mut guard = self.lock();
            let state = &mut *guard;
            match state.index.get_mut(key) {
                None => Checkout::TryRestore,
                Some(entry) if entry.queued => {
                    entry.queued = false;
                    let expired = self.config.is_expired(idle_since(entry.last_activity));
                    let instance = Arc::clone(&entry.instance);
                    state.remove_from_queue(key);
                    if expired {
                        state.index.remove(key);
                        state.stats.expirations += 1;
                        Checkout::ExpiredInMemory(instance)
                    } else {
                        state.stats.checkouts += 1;
                        Checkout::Ready(instance)
                    }
                }
                Some(entry) => match &entry.bound_transaction {
                    Some(tx) if tx.status().is_open() => {
                        state.stats.checkouts += 1;
                        Checkout::Ready(Arc::clone(&entry.instance))
                    }
                    Some(_) => {
                        // The pinning transaction completed while the entry
                        // sat idle; the pin lapses lazily here.
                        entry.bound_transaction = None;
                        state.stats.checkouts += 1;
                        Checkout::Ready(Arc::clone(&entry.instance))
                    }
                    None => return Err(PoolError::ConcurrentAccess(key.clone())),
                },
            }
        };

        match checkout {
            Checkout::Ready(instance) => Ok(instance),
            Checkout::ExpiredInMemory(instance) => {
                match instance.lock() {
                    Ok(mut component) => {
                        if let Err(err) = component.pre_remove() {
                            error!(session = %key, error = %err, "remove callback failed on timed-out session");
                        }
                    }
                    Err(_) => {
                        warn!(session = %key, "instance mutex poisoned; skipping remove callback");
                    }
                }
                info!(session = %key, "removing timed-out session instance");
                Err(PoolError::SessionExpired(key.clone()))
            }
            Checkout::TryRestore => self.restore_checked_out(key),
        }
    }

    /// Return a checked-out session to the pool after a call completes.
    ///
    /// The caller surrenders its handle: passing it by value is what makes
    /// a subsequent eviction pass able to reclaim sole ownership of the
    /// instance. An entry bound to a still-open transaction stays pinned:
    /// not queued, exempt from eviction. Otherwise the activity timestamp is
    /// refreshed and the entry joins the queue tail; if that pushes the
    /// queue past capacity, one bulk eviction pass runs synchronously before
    /// returning.
    pub fn checkin(&self, key: &SessionKey, instance: SharedInstance<C>) -> Result<(), PoolError> {
        let batch = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let entry = state
                .index
                .get_mut(key)
                .ok_or_else(|| PoolError::NotFound(key.clone()))?;
            if !Arc::ptr_eq(&entry.instance, &instance) {
                return Err(PoolError::InstanceMismatch(key.clone()));
            }
            drop(instance);
            if let Some(tx) = &entry.bound_transaction {
                if tx.status().is_open() {
                    state.stats.checkins += 1;
                    return Ok(());
                }
                entry.bound_transaction = None;
            }
            if entry.queued {
                entry.last_activity = SystemTime::now();
                return Ok(());
            }
            entry.last_activity = SystemTime::now();
            entry.queued = true;
            state.queue.push_back(key.clone());
            state.stats.checkins += 1;
            if state.queue.len() > self.config.capacity {
                Self::pop_eviction_batch(state, self.config.effective_bulk())
            } else {
                Vec::new()
            }
        };
        if !batch.is_empty() {
            self.run_eviction_pass(batch);
        }
        Ok(())
    }

    /// Unconditionally remove the session from memory; a non-resident key
    /// is pulled out of the passivation store instead. Returns the instance
    /// when one existed anywhere. No lifecycle callbacks are invoked.
    pub fn free(&self, key: &SessionKey) -> Result<Option<SharedInstance<C>>, PoolError> {
        let resident = {
            let mut guard = self.lock();
            let state = &mut *guard;
            match state.index.remove(key) {
                Some(entry) => {
                    if entry.queued {
                        state.remove_from_queue(key);
                    }
                    state.stats.discards += 1;
                    Some(entry.instance)
                }
                None => None,
            }
        };
        if let Some(instance) = resident {
            return Ok(Some(instance));
        }
        match self.store.restore(key)? {
            Some(record) => {
                self.lock().stats.discards += 1;
                Ok(Some(Arc::new(Mutex::new(record.instance))))
            }
            None => Ok(None),
        }
    }

    /// Remove every resident session and return the instances. Used at
    /// container shutdown; no lifecycle callbacks, no store traffic.
    pub fn drain(&self) -> Vec<(SessionKey, SharedInstance<C>)> {
        let mut guard = self.lock();
        let state = &mut *guard;
        state.queue.clear();
        state
            .index
            .drain()
            .map(|(key, entry)| (key, entry.instance))
            .collect()
    }

    // ========================================================================
    // Internal
    // ========================================================================

    /// Restore a non-resident session from the store into checked-out state.
    fn restore_checked_out(&self, key: &SessionKey) -> Result<SharedInstance<C>, PoolError> {
        let Some(record) = self.store.restore(key)? else {
            return Err(PoolError::NotFound(key.clone()));
        };
        if self.config.is_expired(idle_since(record.last_activity)) {
            // Expired while persisted: destroyed without the remove callback,
            // which only runs for instances that expire in memory.
            self.lock().stats.expirations += 1;
            info!(session = %key, "persisted session expired; discarded without remove callback");
            return Err(PoolError::SessionExpired(key.clone()));
        }
        let mut instance = record.instance;
        if let Err(err) = instance.post_activate() {
            error!(session = %key, error = %err, "activation callback failed; session discarded");
            return Err(PoolError::Callback(err));
        }
        let shared = Arc::new(Mutex::new(instance));
        let mut guard = self.lock();
        let state = &mut *guard;
        if state.index.contains_key(key) {
            // Another caller raced us back into residency for this key.
            return Err(PoolError::ConcurrentAccess(key.clone()));
        }
        state.index.insert(
            key.clone(),
            SessionEntry {
                instance: Arc::clone(&shared),
                ancillary: AncillaryState::None,
                bound_transaction: None,
                last_activity: record.last_activity,
                queued: false,
            },
        );
        state.stats.restores += 1;
        state.stats.checkouts += 1;
        Ok(shared)
    }

    /// Pop up to `bulk` oldest entries out of the queue and index.
    /// Runs under the pool lock; only moves pointers.
    fn pop_eviction_batch(
        state: &mut PoolState<C>,
        bulk: usize,
    ) -> Vec<(SessionKey, SessionEntry<C>)> {
        let mut batch = Vec::with_capacity(bulk);
        for _ in 0..bulk {
            let Some(key) = state.queue.pop_front() else {
                break;
            };
            if let Some(mut entry) = state.index.remove(&key) {
                entry.queued = false;
                batch.push((key, entry));
            }
        }
        batch
    }

    /// Run one bulk eviction pass over entries already detached from the
    /// pool. Lock-free: callbacks and store I/O must not block unrelated
    /// sessions. Every failure in here is absorbed — the caller whose
    /// checkin triggered the pass did not target these sessions.
    fn run_eviction_pass(&self, batch: Vec<(SessionKey, SessionEntry<C>)>) {
        let mut to_persist = Vec::new();
        let mut expirations = 0u64;
        let mut discards = 0u64;

        for (key, entry) in batch {
            let idle = idle_since(entry.last_activity);
            let mut instance = match Arc::try_unwrap(entry.instance) {
                Ok(cell) => match cell.into_inner() {
                    Ok(instance) => instance,
                    Err(_) => {
                        warn!(session = %key, "instance mutex poisoned; dropped from passivation batch");
                        discards += 1;
                        continue;
                    }
                },
                Err(_) => {
                    warn!(session = %key, "instance still referenced; dropped from passivation batch");
                    discards += 1;
                    continue;
                }
            };

            if self.config.is_expired(idle) {
                if let Err(err) = instance.pre_remove() {
                    error!(session = %key, error = %err, "remove callback failed on timed-out session");
                }
                info!(session = %key, "removing timed-out session instance");
                expirations += 1;
                continue;
            }

            if let Err(err) = instance.pre_passivate() {
                error!(session = %key, error = %err, "passivation callback failed; session dropped");
                discards += 1;
                continue;
            }

            to_persist.push((
                key,
                PassivatedSession {
                    instance,
                    last_activity: entry.last_activity,
                },
            ));
        }

        let persisted = to_persist.len() as u64;
        let mut evictions = 0u64;
        if !to_persist.is_empty() {
            // One store call per pass, however many entries survived.
            match self.store.passivate_batch(to_persist) {
                Ok(()) => evictions = persisted,
                Err(err) => {
                    error!(count = persisted, error = %err, "bulk passivation failed; sessions are unrecoverable");
                    discards += persisted;
                }
            }
        }

        let mut guard = self.lock();
        guard.stats.evictions += evictions;
        guard.stats.expirations += expirations;
        guard.stats.discards += discards;
    }
}

impl<C, S> AncillaryAccess for InstancePool<C, S>
where
    C: SessionComponent,
    S: PassivationStore<C>,
{
    fn set_ancillary(&self, key: &SessionKey, value: AncillaryState) -> Result<(), PoolError> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let entry = state
            .index
            .get_mut(key)
            .ok_or_else(|| PoolError::NotFound(key.clone()))?;
        let mut dequeue = false;
        match &value {
            AncillaryState::Transaction(handle) => {
                entry.bound_transaction = Some(Arc::clone(handle));
                // A pinned entry must not remain evictable.
                if entry.queued {
                    entry.queued = false;
                    dequeue = true;
                }
            }
            AncillaryState::None => entry.bound_transaction = None,
            AncillaryState::Opaque(_) => {}
        }
        entry.ancillary = value;
        if dequeue {
            state.remove_from_queue(key);
        }
        Ok(())
    }

    fn take_ancillary(&self, key: &SessionKey) -> Result<AncillaryState, PoolError> {
        let mut guard = self.lock();
        let entry = guard
            .index
            .get_mut(key)
            .ok_or_else(|| PoolError::NotFound(key.clone()))?;
        Ok(std::mem::take(&mut entry.ancillary))
    }

    fn bound_transaction(
        &self,
        key: &SessionKey,
    ) -> Result<Option<Arc<dyn TransactionHandle>>, PoolError> {
        let guard = self.lock();
        let entry = guard
            .index
            .get(key)
            .ok_or_else(|| PoolError::NotFound(key.clone()))?;
        Ok(entry.bound_transaction.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::passivation::MemoryStore;
    use crate::session::CallbackResult;
    use crate::transaction::TxStatus;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type EventLog = Arc<Mutex<Vec<&'static str>>>;

    /// Component that records which lifecycle hooks fired.
    #[derive(Default)]
    struct Probe {
        value: u32,
        fail_passivate: bool,
        events: Option<EventLog>,
    }

    impl Probe {
        fn with_log(log: &EventLog) -> Self {
            Self {
                events: Some(Arc::clone(log)),
                ..Self::default()
            }
        }

        fn record(&self, event: &'static str) {
            if let Some(log) = &self.events {
                log.lock().unwrap().push(event);
            }
        }
    }

    impl SessionComponent for Probe {
        fn pre_passivate(&mut self) -> CallbackResult {
            self.record("pre_passivate");
            if self.fail_passivate {
                return Err(crate::error::CallbackError::new("passivate refused"));
            }
            Ok(())
        }

        fn post_activate(&mut self) -> CallbackResult {
            self.record("post_activate");
            Ok(())
        }

        fn pre_remove(&mut self) -> CallbackResult {
            self.record("pre_remove");
            Ok(())
        }
    }

    fn config(capacity: usize, bulk: usize, idle_timeout: Option<Duration>) -> ContainerConfig {
        ContainerConfig {
            capacity,
            bulk_passivate: bulk,
            idle_timeout,
        }
    }

    fn pool(capacity: usize, bulk: usize) -> InstancePool<Probe, MemoryStore<Probe>> {
        InstancePool::new(config(capacity, bulk, None), MemoryStore::new())
    }

    fn backdate(
        pool: &InstancePool<Probe, MemoryStore<Probe>>,
        key: &SessionKey,
        by: Duration,
    ) {
        let mut guard = pool.state.lock().unwrap();
        let entry = guard.index.get_mut(key).unwrap();
        entry.last_activity = SystemTime::now() - by;
    }

    /// A transaction handle with a controllable status.
    struct TestTx {
        status: Mutex<TxStatus>,
    }

    impl TestTx {
        fn active() -> Arc<Self> {
            Arc::new(Self {
                status: Mutex::new(TxStatus::Active),
            })
        }

        fn complete(&self) {
            *self.status.lock().unwrap() = TxStatus::Committed;
        }
    }

    impl TransactionHandle for TestTx {
        fn id(&self) -> u64 {
            1
        }

        fn status(&self) -> TxStatus {
            *self.status.lock().unwrap()
        }

        fn mark_rollback_only(&self) {
            let mut status = self.status.lock().unwrap();
            if *status == TxStatus::Active {
                *status = TxStatus::MarkedRollback;
            }
        }
    }

    // ========================================================================
    // Create / obtain / checkin
    // ========================================================================

    #[test]
    fn create_starts_checked_out() {
        let pool = pool(4, 1);
        let key = SessionKey::new("a");
        pool.create(key.clone(), Probe::default()).unwrap();

        assert_eq!(pool.len(), 1);
        assert_eq!(pool.queued_len(), 0);
        assert!(matches!(
            pool.obtain(&key),
            Err(PoolError::ConcurrentAccess(_))
        ));
    }

    #[test]
    fn duplicate_create_fails() {
        let pool = pool(4, 1);
        let key = SessionKey::new("a");
        pool.create(key.clone(), Probe::default()).unwrap();
        assert!(matches!(
            pool.create(key, Probe::default()),
            Err(PoolError::DuplicateKey(_))
        ));
    }

    #[test]
    fn checkin_then_obtain_round_trips_same_instance() {
        let pool = pool(4, 1);
        let key = SessionKey::new("a");
        let created = pool.create(key.clone(), Probe::default()).unwrap();
        pool.checkin(&key, Arc::clone(&created)).unwrap();
        assert_eq!(pool.queued_len(), 1);

        let obtained = pool.obtain(&key).unwrap();
        assert!(Arc::ptr_eq(&created, &obtained));
        assert_eq!(pool.queued_len(), 0);
    }

    #[test]
    fn obtain_while_checked_out_is_concurrent_access() {
        let pool = pool(4, 1);
        let key = SessionKey::new("a");
        let instance = pool.create(key.clone(), Probe::default()).unwrap();
        pool.checkin(&key, instance).unwrap();

        let _held = pool.obtain(&key).unwrap();
        assert!(matches!(
            pool.obtain(&key),
            Err(PoolError::ConcurrentAccess(_))
        ));
    }

    #[test]
    fn obtain_unknown_key_is_not_found() {
        let pool = pool(4, 1);
        assert!(matches!(
            pool.obtain(&SessionKey::new("ghost")),
            Err(PoolError::NotFound(_))
        ));
    }

    #[test]
    fn checkin_with_foreign_instance_is_rejected() {
        let pool = pool(4, 1);
        let a = SessionKey::new("a");
        let b = SessionKey::new("b");
        pool.create(a.clone(), Probe::default()).unwrap();
        let b_instance = pool.create(b, Probe::default()).unwrap();

        assert!(matches!(
            pool.checkin(&a, b_instance),
            Err(PoolError::InstanceMismatch(_))
        ));
    }

    #[test]
    fn checkin_unknown_key_is_not_found() {
        let pool = pool(4, 1);
        let stray = Arc::new(Mutex::new(Probe::default()));
        assert!(matches!(
            pool.checkin(&SessionKey::new("ghost"), stray),
            Err(PoolError::NotFound(_))
        ));
    }

    // ========================================================================
    // Eviction
    // ========================================================================

    #[test]
    fn eviction_triggers_only_past_capacity() {
        let pool = pool(2, 1);
        for name in ["a", "b"] {
            let key = SessionKey::new(name);
            let instance = pool.create(key.clone(), Probe::default()).unwrap();
            pool.checkin(&key, instance).unwrap();
        }
        // Queue at capacity, but not past it: nothing evicted yet.
        assert_eq!(pool.queued_len(), 2);
        assert!(pool.store().is_empty());

        let c = SessionKey::new("c");
        let instance = pool.create(c.clone(), Probe::default()).unwrap();
        pool.checkin(&c, instance).unwrap();

        // Oldest entry (a) was evicted; b and c stay resident.
        assert_eq!(pool.queued_len(), 2);
        assert_eq!(pool.store().len(), 1);
        assert_eq!(pool.len(), 2);
        assert!(pool.store().restore(&SessionKey::new("a")).unwrap().is_some());
        assert_eq!(pool.stats().evictions, 1);
    }

    #[test]
    fn eviction_pops_oldest_first() {
        let pool = pool(2, 2);
        for name in ["a", "b", "c"] {
            let key = SessionKey::new(name);
            let instance = pool.create(key.clone(), Probe::default()).unwrap();
            pool.checkin(&key, instance).unwrap();
        }

        // Batch of 2 evicted the two oldest (a, b); c remains queued.
        assert_eq!(pool.queued_len(), 1);
        assert!(pool.store().restore(&SessionKey::new("a")).unwrap().is_some());
        assert!(pool.store().restore(&SessionKey::new("b")).unwrap().is_some());
        assert!(pool.obtain(&SessionKey::new("c")).is_ok());
    }

    #[test]
    fn zero_capacity_evicts_on_every_checkin() {
        let pool = pool(0, 100);
        let key = SessionKey::new("a");
        let instance = pool.create(key.clone(), Probe::default()).unwrap();
        pool.checkin(&key, instance).unwrap();

        assert_eq!(pool.len(), 0);
        assert_eq!(pool.store().len(), 1);
    }

    #[test]
    fn one_store_call_per_eviction_pass() {
        struct CountingStore {
            inner: MemoryStore<Probe>,
            calls: AtomicUsize,
            batch_sizes: Mutex<Vec<usize>>,
        }

        impl PassivationStore<Probe> for CountingStore {
            fn passivate_batch(
                &self,
                batch: Vec<(SessionKey, PassivatedSession<Probe>)>,
            ) -> Result<(), StoreError> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                self.batch_sizes.lock().unwrap().push(batch.len());
                self.inner.passivate_batch(batch)
            }

            fn restore(
                &self,
                key: &SessionKey,
            ) -> Result<Option<PassivatedSession<Probe>>, StoreError> {
                self.inner.restore(key)
            }
        }

        let store = CountingStore {
            inner: MemoryStore::new(),
            calls: AtomicUsize::new(0),
            batch_sizes: Mutex::new(Vec::new()),
        };
        let pool: InstancePool<Probe, CountingStore> =
            InstancePool::new(config(3, 2, None), store);

        for name in ["a", "b", "c", "d"] {
            let key = SessionKey::new(name);
            let instance = pool.create(key.clone(), Probe::default()).unwrap();
            pool.checkin(&key, instance).unwrap();
        }

        assert_eq!(pool.store().calls.load(Ordering::SeqCst), 1);
        assert_eq!(*pool.store().batch_sizes.lock().unwrap(), vec![2]);
    }

    #[test]
    fn failed_passivate_callback_drops_only_that_session() {
        let pool = pool(2, 2);
        let bad = SessionKey::new("bad");
        let good = SessionKey::new("good");
        let instance = pool
            .create(
                bad.clone(),
                Probe {
                    fail_passivate: true,
                    ..Probe::default()
                },
            )
            .unwrap();
        pool.checkin(&bad, instance).unwrap();
        let instance = pool.create(good.clone(), Probe::default()).unwrap();
        pool.checkin(&good, instance).unwrap();
        // Third checkin pushes past capacity; the pass pops bad and good.
        let trigger = SessionKey::new("trigger");
        let instance = pool.create(trigger.clone(), Probe::default()).unwrap();
        pool.checkin(&trigger, instance).unwrap();

        assert!(pool.store().restore(&bad).unwrap().is_none());
        assert!(pool.store().restore(&good).unwrap().is_some());
        let stats = pool.stats();
        assert_eq!(stats.discards, 1);
        assert_eq!(stats.evictions, 1);
        assert_eq!(pool.queued_len(), 1);
    }

    #[test]
    fn failed_bulk_persist_is_absorbed() {
        struct FailingStore;

        impl PassivationStore<Probe> for FailingStore {
            fn passivate_batch(
                &self,
                _batch: Vec<(SessionKey, PassivatedSession<Probe>)>,
            ) -> Result<(), StoreError> {
                Err(StoreError::Backend("disk on fire".to_string()))
            }

            fn restore(
                &self,
                _key: &SessionKey,
            ) -> Result<Option<PassivatedSession<Probe>>, StoreError> {
                Ok(None)
            }
        }

        let pool: InstancePool<Probe, FailingStore> =
            InstancePool::new(config(0, 1, None), FailingStore);
        let key = SessionKey::new("a");
        let instance = pool.create(key.clone(), Probe::default()).unwrap();
        // The triggering checkin itself must still succeed.
        pool.checkin(&key, instance).unwrap();

        assert_eq!(pool.stats().discards, 1);
        assert!(matches!(pool.obtain(&key), Err(PoolError::NotFound(_))));
    }

    #[test]
    fn aliased_instance_is_dropped_from_batch() {
        let pool = pool(0, 1);
        let key = SessionKey::new("a");
        let instance = pool.create(key.clone(), Probe::default()).unwrap();
        // Keep a second handle alive across the eviction pass.
        let leak = Arc::clone(&instance);
        pool.checkin(&key, instance).unwrap();

        assert!(pool.store().is_empty());
        assert_eq!(pool.stats().discards, 1);
        drop(leak);
    }

    // ========================================================================
    // Expiry
    // ========================================================================

    #[test]
    fn expired_queued_entry_runs_remove_callback() {
        let log: EventLog = Arc::new(Mutex::new(Vec::new()));
        let pool: InstancePool<Probe, MemoryStore<Probe>> =
            InstancePool::new(config(4, 1, Some(Duration::from_secs(60))), MemoryStore::new());
        let key = SessionKey::new("a");
        let instance = pool.create(key.clone(), Probe::with_log(&log)).unwrap();
        pool.checkin(&key, instance).unwrap();
        backdate(&pool, &key, Duration::from_secs(120));

        assert!(matches!(
            pool.obtain(&key),
            Err(PoolError::SessionExpired(_))
        ));
        assert_eq!(*log.lock().unwrap(), vec!["pre_remove"]);
        assert_eq!(pool.len(), 0);
        assert_eq!(pool.stats().expirations, 1);
    }

    #[test]
    fn expired_persisted_entry_skips_remove_callback() {
        let log: EventLog = Arc::new(Mutex::new(Vec::new()));
        let store = MemoryStore::new();
        let key = SessionKey::new("a");
        store
            .passivate_batch(vec![(
                key.clone(),
                PassivatedSession {
                    instance: Probe::with_log(&log),
                    last_activity: SystemTime::now() - Duration::from_secs(120),
                },
            )])
            .unwrap();
        let pool: InstancePool<Probe, MemoryStore<Probe>> =
            InstancePool::new(config(4, 1, Some(Duration::from_secs(60))), store);

        assert!(matches!(
            pool.obtain(&key),
            Err(PoolError::SessionExpired(_))
        ));
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(pool.stats().expirations, 1);
    }

    #[test]
    fn expired_entry_in_eviction_batch_is_destroyed_not_persisted() {
        let log: EventLog = Arc::new(Mutex::new(Vec::new()));
        let pool: InstancePool<Probe, MemoryStore<Probe>> =
            InstancePool::new(config(1, 1, Some(Duration::from_secs(60))), MemoryStore::new());
        let old = SessionKey::new("old");
        let instance = pool.create(old.clone(), Probe::with_log(&log)).unwrap();
        pool.checkin(&old, instance).unwrap();
        backdate(&pool, &old, Duration::from_secs(120));

        // Push the queue past capacity so the pass pops the expired entry.
        let fresh = SessionKey::new("fresh");
        let instance = pool.create(fresh.clone(), Probe::default()).unwrap();
        pool.checkin(&fresh, instance).unwrap();

        assert!(pool.store().restore(&old).unwrap().is_none());
        assert_eq!(*log.lock().unwrap(), vec!["pre_remove"]);
        assert_eq!(pool.stats().expirations, 1);
    }

    // ========================================================================
    // Restore
    // ========================================================================

    #[test]
    fn restore_runs_activation_callback_and_preserves_state() {
        let log: EventLog = Arc::new(Mutex::new(Vec::new()));
        let pool = pool(0, 1);
        let key = SessionKey::new("a");
        let instance = pool
            .create(
                key.clone(),
                Probe {
                    value: 42,
                    events: Some(Arc::clone(&log)),
                    ..Probe::default()
                },
            )
            .unwrap();
        pool.checkin(&key, instance).unwrap();
        assert_eq!(pool.len(), 0);

        let restored = pool.obtain(&key).unwrap();
        assert_eq!(restored.lock().unwrap().value, 42);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["pre_passivate", "post_activate"]
        );
        assert_eq!(pool.stats().restores, 1);
    }

    // ========================================================================
    // Transaction affinity
    // ========================================================================

    #[test]
    fn bound_entry_is_pinned_and_reenterable() {
        let pool = pool(4, 1);
        let key = SessionKey::new("a");
        let instance = pool.create(key.clone(), Probe::default()).unwrap();
        let tx = TestTx::active();
        pool.set_ancillary(&key, AncillaryState::Transaction(tx.clone()))
            .unwrap();

        pool.checkin(&key, Arc::clone(&instance)).unwrap();
        assert_eq!(pool.queued_len(), 0, "pinned entry must not be queued");

        // Same-transaction re-entry hands out the same instance.
        let again = pool.obtain(&key).unwrap();
        assert!(Arc::ptr_eq(&instance, &again));
    }

    #[test]
    fn completed_transaction_unpins_on_checkin() {
        let pool = pool(4, 1);
        let key = SessionKey::new("a");
        let instance = pool.create(key.clone(), Probe::default()).unwrap();
        let tx = TestTx::active();
        pool.set_ancillary(&key, AncillaryState::Transaction(tx.clone()))
            .unwrap();
        tx.complete();

        pool.checkin(&key, instance).unwrap();
        assert_eq!(pool.queued_len(), 1);
        assert!(pool.bound_transaction(&key).unwrap().is_none());
    }

    #[test]
    fn obtain_after_transaction_completes_lazily_unpins() {
        let pool = pool(4, 1);
        let key = SessionKey::new("a");
        let instance = pool.create(key.clone(), Probe::default()).unwrap();
        let tx = TestTx::active();
        pool.set_ancillary(&key, AncillaryState::Transaction(tx.clone()))
            .unwrap();
        pool.checkin(&key, instance).unwrap();
        assert_eq!(pool.queued_len(), 0);

        // Transaction completes while the entry sits pinned and idle.
        tx.complete();
        let obtained = pool.obtain(&key).unwrap();
        assert!(pool.bound_transaction(&key).unwrap().is_none());
        pool.checkin(&key, obtained).unwrap();
        assert_eq!(pool.queued_len(), 1);
    }

    #[test]
    fn binding_a_queued_entry_dequeues_it() {
        let pool = pool(4, 1);
        let key = SessionKey::new("a");
        let instance = pool.create(key.clone(), Probe::default()).unwrap();
        pool.checkin(&key, instance).unwrap();
        assert_eq!(pool.queued_len(), 1);

        pool.set_ancillary(&key, AncillaryState::Transaction(TestTx::active()))
            .unwrap();
        assert_eq!(pool.queued_len(), 0);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn take_ancillary_leaves_binding_in_place() {
        let pool = pool(4, 1);
        let key = SessionKey::new("a");
        pool.create(key.clone(), Probe::default()).unwrap();
        pool.set_ancillary(&key, AncillaryState::Transaction(TestTx::active()))
            .unwrap();

        let taken = pool.take_ancillary(&key).unwrap();
        assert!(matches!(taken, AncillaryState::Transaction(_)));
        assert!(matches!(
            pool.take_ancillary(&key).unwrap(),
            AncillaryState::None
        ));
        assert!(pool.bound_transaction(&key).unwrap().is_some());
    }

    // ========================================================================
    // Free / drain
    // ========================================================================

    #[test]
    fn free_removes_resident_entry() {
        let pool = pool(4, 1);
        let key = SessionKey::new("a");
        let instance = pool.create(key.clone(), Probe::default()).unwrap();
        pool.checkin(&key, instance).unwrap();

        let freed = pool.free(&key).unwrap();
        assert!(freed.is_some());
        assert_eq!(pool.len(), 0);
        assert_eq!(pool.queued_len(), 0);
        assert!(matches!(pool.obtain(&key), Err(PoolError::NotFound(_))));
    }

    #[test]
    fn free_falls_back_to_store() {
        let pool = pool(0, 1);
        let key = SessionKey::new("a");
        let instance = pool.create(key.clone(), Probe::default()).unwrap();
        pool.checkin(&key, instance).unwrap();
        assert_eq!(pool.store().len(), 1);

        let freed = pool.free(&key).unwrap();
        assert!(freed.is_some());
        assert!(pool.store().is_empty());
    }

    #[test]
    fn free_unknown_key_is_none() {
        let pool = pool(4, 1);
        assert!(pool.free(&SessionKey::new("ghost")).unwrap().is_none());
    }

    #[test]
    fn drain_empties_the_pool() {
        let pool = pool(4, 1);
        for name in ["a", "b", "c"] {
            let key = SessionKey::new(name);
            let instance = pool.create(key.clone(), Probe::default()).unwrap();
            pool.checkin(&key, instance).unwrap();
        }

        let drained = pool.drain();
        assert_eq!(drained.len(), 3);
        assert!(pool.is_empty());
        assert_eq!(pool.queued_len(), 0);
    }

    // ========================================================================
    // Invariants (property-based)
    // ========================================================================

    use proptest::prelude::*;

    proptest! {
        #[test]
        fn queue_and_index_stay_consistent(
            ops in proptest::collection::vec((0u8..4, 0u8..8), 1..120)
        ) {
            let pool = pool(3, 2);
            let mut held: HashMap<SessionKey, SharedInstance<Probe>> = HashMap::new();

            for (op, k) in ops {
                let key = SessionKey::new(format!("s{k}"));
                match op {
                    0 => {
                        if let Ok(instance) = pool.create(key.clone(), Probe::default()) {
                            held.insert(key, instance);
                        }
                    }
                    1 => {
                        if let Ok(instance) = pool.obtain(&key) {
                            held.insert(key, instance);
                        }
                    }
                    2 => {
                        if let Some(instance) = held.remove(&key) {
                            let _ = pool.checkin(&key, instance);
                        }
                    }
                    _ => {
                        held.remove(&key);
                        let _ = pool.free(&key);
                    }
                }
            }

            let guard = pool.state.lock().unwrap();
            // Every queued key resolves to an entry flagged as queued.
            for key in &guard.queue {
                let entry = guard.index.get(key);
                prop_assert!(entry.is_some_and(|e| e.queued));
            }
            // No key appears twice in the queue.
            let mut seen = std::collections::HashSet::new();
            for key in &guard.queue {
                prop_assert!(seen.insert(key.clone()));
            }
            // Eviction keeps the queue bounded by capacity.
            prop_assert!(guard.queue.len() <= pool.config.capacity);
            // Entries flagged queued are actually in the queue.
            for (key, entry) in &guard.index {
                if entry.queued {
                    prop_assert!(guard.queue.contains(key));
                }
            }
        }
    }
}
