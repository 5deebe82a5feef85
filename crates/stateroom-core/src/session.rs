//! Session identity and the component contract.
//!
//! A [`SessionKey`] correlates a sequence of client calls to one
//! conversational component instance. [`SessionComponent`] is the lifecycle
//! contract every pooled component type implements; all hooks default to
//! no-ops so plain state structs can opt in piecemeal. [`ComponentFactory`]
//! is how the dispatcher mints fresh instances for create calls — a plain
//! closure works.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::CallbackError;

/// Number of random bytes in a generated session key (hex-encoded to 32 chars).
const GENERATED_KEY_BYTES: usize = 16;

/// Opaque session identifier, unique and immutable after creation.
///
/// Keys are either supplied by the embedding transport or generated by the
/// dispatcher on a create call. The container treats them as opaque strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionKey(String);

impl SessionKey {
    /// Wrap an externally supplied identifier.
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Generate a fresh random key (128 bits, hex-encoded).
    #[must_use]
    pub fn generate() -> Self {
        let bytes: [u8; GENERATED_KEY_BYTES] = rand::rng().random();
        Self(hex::encode(bytes))
    }

    /// The raw key string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionKey {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl From<String> for SessionKey {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

/// Result type for lifecycle callbacks.
pub type CallbackResult = Result<(), CallbackError>;

/// Lifecycle contract for pooled session components.
///
/// The pool and dispatcher drive these hooks at fixed points of the session
/// state machine:
///
/// | Hook | When | Failure handling |
/// |------|------|------------------|
/// | `post_construct` | after the factory builds the instance, before registration | call fails, instance never registered |
/// | `pre_business_setup` | before every business invocation | system-level: session discarded |
/// | `pre_passivate` | before the instance joins a passivation batch | logged, instance dropped from batch |
/// | `post_activate` | after restore, before the instance is handed out | session discarded, never propagated raw |
/// | `pre_remove` | on explicit removal and on in-memory expiry | removal proceeds regardless |
///
/// Every hook defaults to a no-op.
pub trait SessionComponent: Send + 'static {
    /// Invoked once, after construction and before pool registration.
    fn post_construct(&mut self) -> CallbackResult {
        Ok(())
    }

    /// Invoked before each business call runs against this instance.
    fn pre_business_setup(&mut self) -> CallbackResult {
        Ok(())
    }

    /// Invoked before the instance is serialized out by an eviction pass.
    fn pre_passivate(&mut self) -> CallbackResult {
        Ok(())
    }

    /// Invoked after the instance is restored from the passivation store.
    fn post_activate(&mut self) -> CallbackResult {
        Ok(())
    }

    /// Invoked when the session is explicitly removed, or when an in-memory
    /// entry is found expired. Sessions that expire while persisted skip
    /// this hook.
    fn pre_remove(&mut self) -> CallbackResult {
        Ok(())
    }
}

/// Builds fresh component instances for create calls.
///
/// Implemented for any `Fn() -> C` closure, so most embedders never write
/// an explicit impl:
///
/// ```
/// use stateroom_core::session::ComponentFactory;
///
/// #[derive(Default)]
/// struct Cart {
///     items: Vec<String>,
/// }
///
/// let factory = Cart::default;
/// let cart = factory.new_instance().unwrap();
/// assert!(cart.items.is_empty());
/// ```
pub trait ComponentFactory<C>: Send + Sync {
    /// Build a new instance, or fail if construction is impossible.
    fn new_instance(&self) -> Result<C, CallbackError>;
}

impl<C, F> ComponentFactory<C> for F
where
    F: Fn() -> C + Send + Sync,
{
    fn new_instance(&self) -> Result<C, CallbackError> {
        Ok(self())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_are_unique_and_hex() {
        let a = SessionKey::generate();
        let b = SessionKey::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), GENERATED_KEY_BYTES * 2);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn key_round_trips_through_serde() {
        let key = SessionKey::new("cart-42");
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"cart-42\"");
        let back: SessionKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }

    #[test]
    fn key_display_matches_raw() {
        let key = SessionKey::from("abc");
        assert_eq!(key.to_string(), "abc");
    }

    #[test]
    fn default_hooks_are_noops() {
        struct Bare;
        impl SessionComponent for Bare {}

        let mut c = Bare;
        assert!(c.post_construct().is_ok());
        assert!(c.pre_business_setup().is_ok());
        assert!(c.pre_passivate().is_ok());
        assert!(c.post_activate().is_ok());
        assert!(c.pre_remove().is_ok());
    }

    #[test]
    fn closure_factory_builds_instances() {
        struct Counter(u32);
        impl SessionComponent for Counter {}

        let factory = || Counter(7);
        let built = factory.new_instance().unwrap();
        assert_eq!(built.0, 7);
    }
}
