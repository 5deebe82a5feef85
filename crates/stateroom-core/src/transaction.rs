//! Transaction coordination surface and the pluggable invocation policies.
//!
//! The container never owns transactions; it observes and annotates them
//! through the narrow [`TransactionCoordinator`] / [`TransactionHandle`]
//! pair. The dispatcher drives one [`TransactionPolicy`] around every call:
//! a before hook, an after hook, and a failure hook. Two policy variants
//! ship in-crate:
//!
//! - [`ContainerManagedPolicy`] — the caller's coordinator owns the
//!   transaction; the session is pinned only while that transaction is open.
//! - [`BeanManagedPolicy`] — the component retains a transaction of its own
//!   across calls, stashed in the session's ancillary slot between
//!   invocations.
//!
//! A session bound to an open transaction is exempt from eviction and from
//! the single-caller rule (same-transaction re-entry is allowed).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::ThreadId;

use tracing::warn;

use crate::error::{PoolError, TxError};
use crate::pool::{AncillaryAccess, AncillaryState};
use crate::session::SessionKey;

// =============================================================================
// Status & handles
// =============================================================================

/// Observable state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxStatus {
    /// In progress, may still commit.
    Active,
    /// In progress, but doomed: will roll back at completion.
    MarkedRollback,
    /// Completed successfully.
    Committed,
    /// Completed by rolling back.
    RolledBack,
}

impl TxStatus {
    /// Whether the transaction is still in progress (active or doomed).
    ///
    /// Sessions stay pinned, and same-transaction re-entry stays legal,
    /// for as long as this holds.
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Active | Self::MarkedRollback)
    }

    /// Whether the transaction has completed, either way.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !self.is_open()
    }
}

impl std::fmt::Display for TxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::MarkedRollback => write!(f, "marked_rollback"),
            Self::Committed => write!(f, "committed"),
            Self::RolledBack => write!(f, "rolled_back"),
        }
    }
}

/// A handle onto one transaction, held by sessions affiliated with it.
pub trait TransactionHandle: Send + Sync {
    /// Stable identity; two handles with equal ids denote the same
    /// transaction.
    fn id(&self) -> u64;

    /// Current status.
    fn status(&self) -> TxStatus;

    /// Doom the transaction: it may keep running but must roll back at
    /// completion. Idempotent; a no-op on completed transactions.
    fn mark_rollback_only(&self);
}

/// Source of the calling thread's current transaction.
pub trait TransactionCoordinator: Send + Sync {
    /// The transaction associated with the calling thread, if any.
    fn current_transaction(&self) -> Result<Option<Arc<dyn TransactionHandle>>, TxError>;
}

// =============================================================================
// Local coordinator
// =============================================================================

/// A process-local transaction implementation.
#[derive(Debug)]
pub struct LocalTransaction {
    id: u64,
    status: Mutex<TxStatus>,
}

impl LocalTransaction {
    fn new(id: u64) -> Self {
        Self {
            id,
            status: Mutex::new(TxStatus::Active),
        }
    }

    fn status_slot(&self) -> std::sync::MutexGuard<'_, TxStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn complete(&self, commit: bool) -> TxStatus {
        let mut status = self.status_slot();
        *status = match (*status, commit) {
            (TxStatus::Active, true) => TxStatus::Committed,
            // Rollback-only transactions roll back even on commit.
            _ => TxStatus::RolledBack,
        };
        *status
    }
}

impl TransactionHandle for LocalTransaction {
    fn id(&self) -> u64 {
        self.id
    }

    fn status(&self) -> TxStatus {
        *self.status_slot()
    }

    fn mark_rollback_only(&self) {
        let mut status = self.status_slot();
        if *status == TxStatus::Active {
            *status = TxStatus::MarkedRollback;
        }
    }
}

/// Process-local [`TransactionCoordinator`] keyed by thread.
///
/// Suitable for embedding and tests: each thread may run one transaction at
/// a time, demarcated with [`begin`](Self::begin) /
/// [`commit`](Self::commit) / [`rollback`](Self::rollback).
#[derive(Debug, Default)]
pub struct LocalCoordinator {
    active: Mutex<HashMap<ThreadId, Arc<LocalTransaction>>>,
    next_id: AtomicU64,
}

impl LocalCoordinator {
    /// Create a coordinator with no transactions in flight.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> std::sync::MutexGuard<'_, HashMap<ThreadId, Arc<LocalTransaction>>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Begin a transaction on the calling thread.
    pub fn begin(&self) -> Result<Arc<LocalTransaction>, TxError> {
        let thread = std::thread::current().id();
        let mut slots = self.slots();
        if let Some(existing) = slots.get(&thread) {
            if existing.status().is_open() {
                return Err(TxError::AlreadyActive);
            }
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let tx = Arc::new(LocalTransaction::new(id));
        slots.insert(thread, tx.clone());
        Ok(tx)
    }

    /// Commit the calling thread's transaction.
    ///
    /// A transaction marked rollback-only rolls back instead and the call
    /// fails with [`TxError::RolledBack`].
    pub fn commit(&self) -> Result<(), TxError> {
        let tx = self.take_current()?;
        match tx.complete(true) {
            TxStatus::Committed => Ok(()),
            _ => Err(TxError::RolledBack),
        }
    }

    /// Roll back the calling thread's transaction.
    pub fn rollback(&self) -> Result<(), TxError> {
        let tx = self.take_current()?;
        tx.complete(false);
        Ok(())
    }

    fn take_current(&self) -> Result<Arc<LocalTransaction>, TxError> {
        let thread = std::thread::current().id();
        let mut slots = self.slots();
        match slots.remove(&thread) {
            Some(tx) if tx.status().is_open() => Ok(tx),
            Some(_) | None => Err(TxError::NotActive),
        }
    }
}

impl TransactionCoordinator for LocalCoordinator {
    fn current_transaction(&self) -> Result<Option<Arc<dyn TransactionHandle>>, TxError> {
        let thread = std::thread::current().id();
        let slots = self.slots();
        Ok(slots
            .get(&thread)
            .filter(|tx| tx.status().is_open())
            .map(|tx| tx.clone() as Arc<dyn TransactionHandle>))
    }
}

// =============================================================================
// Invocation policies
// =============================================================================

/// Hooks the dispatcher runs around every business invocation.
///
/// The after hook (or, on system-level failure, the failure hook) runs on
/// every exit path of the call. Hooks talk to the pool only through the
/// [`AncillaryAccess`] view — they can stash values against the session and
/// (via transaction-typed values) pin it, nothing more.
pub trait TransactionPolicy: Send + Sync {
    /// Runs after the instance is obtained, before the business method.
    fn before_invoke(
        &self,
        sessions: &dyn AncillaryAccess,
        key: &SessionKey,
    ) -> Result<(), PoolError>;

    /// Runs after the business method returns, on success and on
    /// application-level failure.
    fn after_invoke(
        &self,
        sessions: &dyn AncillaryAccess,
        key: &SessionKey,
    ) -> Result<(), PoolError>;

    /// Runs instead of `after_invoke` when the call failed at system level.
    /// Must not fail; marks the affiliated transaction rollback-only if one
    /// exists.
    fn on_system_failure(&self, sessions: &dyn AncillaryAccess, key: &SessionKey);
}

/// Marks the session's affiliated transaction (bound first, else the
/// coordinator's current one) rollback-only. Shared failure-hook behavior.
fn doom_affiliated_transaction(
    coordinator: &dyn TransactionCoordinator,
    sessions: &dyn AncillaryAccess,
    key: &SessionKey,
) {
    let bound = sessions.bound_transaction(key).ok().flatten();
    let affiliated = match bound {
        Some(handle) => Some(handle),
        None => match coordinator.current_transaction() {
            Ok(current) => current,
            Err(err) => {
                warn!(session = %key, error = %err, "could not query current transaction while handling a system failure");
                None
            }
        },
    };
    if let Some(handle) = affiliated {
        handle.mark_rollback_only();
    }
}

/// Policy for components whose transactions are owned by the caller's
/// coordinator.
///
/// The session is bound to the coordinator's current transaction for the
/// duration of that transaction: pinned against eviction, re-enterable from
/// within it, and released back to the idle queue once it completes.
pub struct ContainerManagedPolicy {
    coordinator: Arc<dyn TransactionCoordinator>,
}

impl ContainerManagedPolicy {
    /// Create a policy consulting the given coordinator.
    #[must_use]
    pub fn new(coordinator: Arc<dyn TransactionCoordinator>) -> Self {
        Self { coordinator }
    }
}

impl TransactionPolicy for ContainerManagedPolicy {
    fn before_invoke(
        &self,
        sessions: &dyn AncillaryAccess,
        key: &SessionKey,
    ) -> Result<(), PoolError> {
        if let Some(handle) = self.coordinator.current_transaction()? {
            if handle.status().is_open() {
                sessions.set_ancillary(key, AncillaryState::Transaction(handle))?;
            }
        }
        Ok(())
    }

    fn after_invoke(
        &self,
        sessions: &dyn AncillaryAccess,
        key: &SessionKey,
    ) -> Result<(), PoolError> {
        match self.coordinator.current_transaction()? {
            Some(handle) if handle.status().is_open() => {
                sessions.set_ancillary(key, AncillaryState::Transaction(handle))
            }
            _ => sessions.set_ancillary(key, AncillaryState::None),
        }
    }

    fn on_system_failure(&self, sessions: &dyn AncillaryAccess, key: &SessionKey) {
        doom_affiliated_transaction(self.coordinator.as_ref(), sessions, key);
    }
}

/// Policy for components that demarcate their own transactions.
///
/// A transaction left open when a call completes is retained against the
/// session (stashed in the ancillary slot, keeping the session pinned) and
/// resumed by the next call on the same session.
pub struct BeanManagedPolicy {
    coordinator: Arc<dyn TransactionCoordinator>,
}

impl BeanManagedPolicy {
    /// Create a policy consulting the given coordinator.
    #[must_use]
    pub fn new(coordinator: Arc<dyn TransactionCoordinator>) -> Self {
        Self { coordinator }
    }
}

impl TransactionPolicy for BeanManagedPolicy {
    fn before_invoke(
        &self,
        sessions: &dyn AncillaryAccess,
        key: &SessionKey,
    ) -> Result<(), PoolError> {
        // Resume the transaction this session retained from an earlier call.
        match sessions.take_ancillary(key)? {
            AncillaryState::Transaction(handle) if handle.status().is_open() => {
                sessions.set_ancillary(key, AncillaryState::Transaction(handle))
            }
            AncillaryState::Transaction(_) | AncillaryState::None => Ok(()),
            other @ AncillaryState::Opaque(_) => sessions.set_ancillary(key, other),
        }
    }

    fn after_invoke(
        &self,
        sessions: &dyn AncillaryAccess,
        key: &SessionKey,
    ) -> Result<(), PoolError> {
        match self.coordinator.current_transaction()? {
            Some(handle) if handle.status().is_open() => {
                sessions.set_ancillary(key, AncillaryState::Transaction(handle))
            }
            _ => sessions.set_ancillary(key, AncillaryState::None),
        }
    }

    fn on_system_failure(&self, sessions: &dyn AncillaryAccess, key: &SessionKey) {
        doom_affiliated_transaction(self.coordinator.as_ref(), sessions, key);
    }
}

/// Policy for deployments with no transaction coordinator at all. Every
/// hook is a no-op; sessions are never pinned.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullPolicy;

impl TransactionPolicy for NullPolicy {
    fn before_invoke(
        &self,
        _sessions: &dyn AncillaryAccess,
        _key: &SessionKey,
    ) -> Result<(), PoolError> {
        Ok(())
    }

    fn after_invoke(
        &self,
        _sessions: &dyn AncillaryAccess,
        _key: &SessionKey,
    ) -> Result<(), PoolError> {
        Ok(())
    }

    fn on_system_failure(&self, _sessions: &dyn AncillaryAccess, _key: &SessionKey) {}
}
