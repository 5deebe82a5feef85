//! Invocation dispatcher — translates one client call into pool operations
//! plus transaction-policy hooks, and normalizes every internal failure to a
//! client-facing [`Fault`].
//!
//! Three call kinds, all funneled through the same machinery:
//!
//! - **create** — mint a key, build an instance through the factory, run its
//!   construction callback, register it, then run the caller's init closure
//!   exactly like a business call.
//! - **invoke** — obtain the instance, run the policy's before hook, the
//!   business closure, the after hook, and check the instance back in.
//! - **remove** — obtain, run the remove callback through the business
//!   machinery, then free the session unconditionally.
//!
//! # Failure discipline
//!
//! An `Err` from the business closure is an *application-level* failure: the
//! after hook still runs, the instance is checked back in, and the error is
//! propagated verbatim. A panic, a lifecycle-callback failure, or a hook
//! failure is *system-level*: the failure hook runs (marking the affiliated
//! transaction rollback-only), the session is permanently discarded, and the
//! caller sees [`Fault::InvalidSession`]. One of the two post-hooks runs on
//! every exit path of the call.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::error::{CallbackError, Fault, PoolError};
use crate::passivation::PassivationStore;
use crate::pool::{InstancePool, SharedInstance};
use crate::session::{ComponentFactory, SessionComponent, SessionKey};
use crate::transaction::TransactionPolicy;

/// Map a pool-level failure onto the client-facing fault surface.
fn fault_from_pool<E>(err: PoolError) -> Fault<E> {
    match err {
        PoolError::ConcurrentAccess(_) => Fault::ConcurrentAccess,
        PoolError::SessionExpired(_) => Fault::invalid_session("session timed out"),
        PoolError::NotFound(_) => Fault::invalid_session("no such session"),
        other => Fault::invalid_session(other.to_string()),
    }
}

/// Best-effort text for a caught panic payload.
fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

/// The invocation dispatcher.
///
/// Owns the pool, the component factory, and the transaction policy; see
/// the module docs for the call sequencing contract.
pub struct Dispatcher<C, S, F> {
    pool: Arc<InstancePool<C, S>>,
    factory: F,
    policy: Box<dyn TransactionPolicy>,
}

impl<C, S, F> Dispatcher<C, S, F>
where
    C: SessionComponent,
    S: PassivationStore<C>,
    F: ComponentFactory<C>,
{
    /// Assemble a dispatcher over the given pool, factory, and policy.
    pub fn new(
        pool: Arc<InstancePool<C, S>>,
        factory: F,
        policy: Box<dyn TransactionPolicy>,
    ) -> Self {
        Self {
            pool,
            factory,
            policy,
        }
    }

    /// The pool this dispatcher drives.
    #[must_use]
    pub fn pool(&self) -> &Arc<InstancePool<C, S>> {
        &self.pool
    }

    /// Create call: allocate a fresh session and run `init` against the new
    /// instance through the business-call machinery, so its transaction
    /// semantics match every later call.
    ///
    /// Returns the generated key together with the closure's result. On an
    /// application-level `init` failure the session still exists (and will
    /// age out through the idle timeout), but no key is handed back — the
    /// caller has nothing valid to reference.
    pub fn create<R, E>(
        &self,
        init: impl FnOnce(&mut C) -> Result<R, E>,
    ) -> Result<(SessionKey, R), Fault<E>> {
        let key = SessionKey::generate();
        let mut instance = self.factory.new_instance().map_err(|err| {
            error!(error = %err, "component factory failed");
            Fault::invalid_session("component could not be constructed")
        })?;
        if let Err(err) = instance.post_construct() {
            error!(error = %err, "construction callback failed; instance discarded");
            return Err(Fault::invalid_session("session initialization failed"));
        }
        let shared = self.pool.create(key.clone(), instance).map_err(|err| {
            error!(session = %key, error = %err, "session registration failed");
            fault_from_pool::<E>(err)
        })?;
        debug!(session = %key, "session created");
        let value = self.run_call(&key, shared, init)?;
        Ok((key, value))
    }

    /// Business call: obtain the instance for `key` and run `call` against
    /// it under the full hook discipline.
    pub fn invoke<R, E>(
        &self,
        key: &SessionKey,
        call: impl FnOnce(&mut C) -> Result<R, E>,
    ) -> Result<R, Fault<E>> {
        let instance = self.pool.obtain(key).map_err(fault_from_pool)?;
        self.run_call(key, instance, call)
    }

    /// Remove call: run the component's remove callback through the
    /// business machinery, then destroy the session regardless of the
    /// callback's outcome.
    pub fn remove(&self, key: &SessionKey) -> Result<(), Fault<CallbackError>> {
        let result = match self.pool.obtain(key) {
            Ok(instance) => self.run_call(key, instance, SessionComponent::pre_remove),
            Err(err) => Err(fault_from_pool(err)),
        };
        // Gone no matter how the hook fared.
        if let Err(err) = self.pool.free(key) {
            warn!(session = %key, error = %err, "session discard after remove failed");
        }
        debug!(session = %key, "session removed");
        result.map(|()| ())
    }

    // ========================================================================
    // Internal
    // ========================================================================

    /// Run one call against an already checked-out instance.
    ///
    /// Exit paths:
    /// - success → after hook, checkin, `Ok`
    /// - closure `Err` → after hook, checkin, `Fault::Application`
    /// - panic or any callback/hook failure → failure hook, `free`,
    ///   `Fault::InvalidSession`
    fn run_call<R, E>(
        &self,
        key: &SessionKey,
        instance: SharedInstance<C>,
        call: impl FnOnce(&mut C) -> Result<R, E>,
    ) -> Result<R, Fault<E>> {
        {
            let Ok(mut component) = instance.lock() else {
                return Err(self.system_failure(key, "instance mutex poisoned"));
            };
            if let Err(err) = component.pre_business_setup() {
                drop(component);
                error!(session = %key, error = %err, "business setup callback failed");
                return Err(self.system_failure(key, "session setup failed"));
            }
        }

        if let Err(err) = self.policy.before_invoke(self.pool.as_ref(), key) {
            error!(session = %key, error = %err, "transaction before-hook failed");
            return Err(self.system_failure(key, "transaction association failed"));
        }

        // A panic inside the business method means the instance can no
        // longer be trusted; it is caught here and handled as a
        // system-level failure rather than unwinding into the transport.
        let outcome = {
            let Ok(component) = instance.lock() else {
                return Err(self.system_failure(key, "instance mutex poisoned"));
            };
            catch_unwind(AssertUnwindSafe(move || {
                let mut component = component;
                call(&mut *component)
            }))
        };

        match outcome {
            Ok(result) => {
                // The after hook runs on success AND on application-level
                // failure; only system-level failures divert to the
                // failure hook.
                if let Err(err) = self.policy.after_invoke(self.pool.as_ref(), key) {
                    error!(session = %key, error = %err, "transaction after-hook failed");
                    return Err(self.system_failure(key, "transaction completion failed"));
                }
                if let Err(err) = self.pool.checkin(key, instance) {
                    warn!(session = %key, error = %err, "instance could not be returned to the pool");
                    return Err(self.system_failure(key, "session could not be returned"));
                }
                result.map_err(Fault::Application)
            }
            Err(payload) => {
                error!(
                    session = %key,
                    panic = %panic_message(payload.as_ref()),
                    "business method panicked; session discarded"
                );
                drop(instance);
                Err(self.system_failure(key, "business method failed unexpectedly"))
            }
        }
    }

    /// System-level failure handling: failure hook, permanent discard,
    /// normalized fault. The internal error never reaches the caller.
    fn system_failure<E>(&self, key: &SessionKey, reason: &str) -> Fault<E> {
        self.policy.on_system_failure(self.pool.as_ref(), key);
        if let Err(err) = self.pool.free(key) {
            warn!(session = %key, error = %err, "discard after system failure also failed");
        }
        Fault::invalid_session(reason)
    }
}
