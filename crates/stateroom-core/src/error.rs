//! Error types for stateroom-core

use thiserror::Error;

use crate::session::SessionKey;

/// Result type alias using the library's top-level [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for stateroom-core.
///
/// Embedders that don't care which subsystem failed can funnel everything
/// into this; the pool, store, and transaction layers keep their own
/// narrower enums below.
#[derive(Error, Debug)]
pub enum Error {
    /// Instance pool errors
    #[error("pool error: {0}")]
    Pool(#[from] PoolError),

    /// Passivation store errors
    #[error("passivation store error: {0}")]
    Store(#[from] StoreError),

    /// Transaction coordination errors
    #[error("transaction error: {0}")]
    Transaction(#[from] TxError),

    /// Configuration errors
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure raised by a component lifecycle callback
/// (`post_construct`, `pre_passivate`, `post_activate`, `pre_remove`, ...).
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct CallbackError {
    message: String,
}

impl CallbackError {
    /// Create a callback error with the given message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Instance pool errors.
///
/// These surface from [`InstancePool`](crate::pool::InstancePool) operations.
/// The dispatcher translates them into the client-facing [`Fault`] categories;
/// callers driving the pool directly see the full taxonomy.
#[derive(Error, Debug)]
pub enum PoolError {
    /// A session entry already exists under this key
    #[error("session key already registered: {0}")]
    DuplicateKey(SessionKey),

    /// The session is checked out by another in-flight call
    #[error("session {0} is already serving another call")]
    ConcurrentAccess(SessionKey),

    /// The session exceeded its idle timeout while queued or persisted
    #[error("session {0} has exceeded its idle timeout")]
    SessionExpired(SessionKey),

    /// No session is registered under this key, in memory or persisted
    #[error("no session registered under key {0}")]
    NotFound(SessionKey),

    /// The instance handed back does not belong to this session
    #[error("instance does not belong to session {0}")]
    InstanceMismatch(SessionKey),

    /// The passivation store failed during restore
    #[error("passivation store failure: {0}")]
    Store(#[from] StoreError),

    /// A lifecycle callback failed outside the absorbed passivation path
    #[error("lifecycle callback failed: {0}")]
    Callback(#[from] CallbackError),

    /// The transaction coordinator failed while a hook consulted it
    #[error("transaction coordination failed: {0}")]
    Transaction(#[from] TxError),
}

/// Passivation store errors.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Filesystem-level failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The persisted record could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Backend-specific failure
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Transaction coordination errors.
#[derive(Error, Debug)]
pub enum TxError {
    /// `begin` was called while this thread already has an active transaction
    #[error("a transaction is already active on this thread")]
    AlreadyActive,

    /// `commit`/`rollback` was called with no active transaction
    #[error("no transaction is active on this thread")]
    NotActive,

    /// The transaction was marked rollback-only and has been rolled back
    #[error("transaction was marked rollback-only and has been rolled back")]
    RolledBack,

    /// Coordinator-specific failure
    #[error("transaction coordinator failure: {0}")]
    Coordinator(String),
}

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The config file could not be read
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The config file could not be parsed as TOML
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A structurally valid config carries an unusable value
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Client-facing fault surface.
///
/// Callers of the dispatcher never see the internal [`PoolError`] taxonomy;
/// every failure is normalized to one of these three categories. `E` is the
/// caller's own application error type, propagated verbatim.
#[derive(Error, Debug)]
pub enum Fault<E> {
    /// The business method itself failed; the session stays alive.
    #[error("application failure: {0}")]
    Application(E),

    /// The session is gone: expired, explicitly removed, or discarded after
    /// a system-level failure poisoned the instance.
    #[error("session reference is no longer valid: {reason}")]
    InvalidSession { reason: String },

    /// The session is currently serving another call.
    #[error("session is already serving another call")]
    ConcurrentAccess,
}

impl<E> Fault<E> {
    pub(crate) fn invalid_session(reason: impl Into<String>) -> Self {
        Self::InvalidSession {
            reason: reason.into(),
        }
    }

    /// True if this fault invalidates the caller's session reference.
    #[must_use]
    pub const fn invalidates_session(&self) -> bool {
        matches!(self, Self::InvalidSession { .. })
    }
}
