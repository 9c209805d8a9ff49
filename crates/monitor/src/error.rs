//! Failure taxonomy of the monitor. Each error is scoped to the smallest unit
//! that can fail on its own: one limiter admission, one price lookup, one
//! scanner, one query, one flow write, one cycle.

use std::time::Duration;

use coffer_chains::ChainError;
use thiserror::Error;

use crate::scanner::ScannerId;
use crate::store::GroupRef;
use crate::units::AmountError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RateLimitError {
    #[error("rate limiter is closed, admission for `{key}` cancelled")]
    Closed { key: String },
}

#[derive(Debug, Error)]
pub enum PriceError {
    #[error("no price source could price `{code}`")]
    Unavailable { code: String },

    #[error("price source {name} failed: {message}")]
    Source { name: &'static str, message: String },

    #[error(transparent)]
    RateLimit(#[from] RateLimitError),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("asset group {0} not found")]
    GroupNotFound(GroupRef),

    #[error("batch {0} not found")]
    BatchNotFound(i32),

    #[error("flow from asset group #{0} back into itself")]
    SameGroup(i32),
}

/// Why a scanner could not be brought up. The scanner is left out of the cycle.
#[derive(Debug, Error)]
pub enum InitFailure {
    #[error("no scanner registered for this chain and type")]
    Unsupported,

    #[error("no enabled endpoint")]
    NoEndpoint,

    #[error("missing reference data: {0}")]
    MissingReference(String),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    RateLimit(#[from] RateLimitError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
#[error("scanner {scanner} failed to initialize: {cause}")]
pub struct ScannerInitError {
    pub scanner: ScannerId,
    #[source]
    pub cause: InitFailure,
}

impl ScannerInitError {
    pub fn new(scanner: ScannerId, cause: impl Into<InitFailure>) -> Self {
        Self {
            scanner,
            cause: cause.into(),
        }
    }
}

/// Why one query against one target failed.
#[derive(Debug, Error)]
pub enum QueryFailure {
    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Price(#[from] PriceError),

    #[error(transparent)]
    RateLimit(#[from] RateLimitError),

    #[error(transparent)]
    Amount(#[from] AmountError),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("scanner was not initialized")]
    NotInitialized,
}

impl From<QueryFailure> for InitFailure {
    fn from(failure: QueryFailure) -> Self {
        match failure {
            QueryFailure::Chain(e) => InitFailure::Chain(e),
            QueryFailure::RateLimit(e) => InitFailure::RateLimit(e),
            other => InitFailure::MissingReference(other.to_string()),
        }
    }
}

#[derive(Debug, Error)]
#[error("scanner {scanner} query for `{address}` failed: {cause}")]
pub struct ScanQueryError {
    pub scanner: ScannerId,
    pub address: String,
    #[source]
    pub cause: QueryFailure,
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("asset group {0} not found")]
    GroupNotFound(GroupRef),

    #[error("invalid flow: {0}")]
    InvalidFlow(String),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::GroupNotFound(group) => LedgerError::GroupNotFound(group),
            same @ StoreError::SameGroup(_) => LedgerError::InvalidFlow(same.to_string()),
            other => LedgerError::Store(other),
        }
    }
}

/// Failures of a whole scan cycle.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("a scan cycle is already running")]
    ScanInProgress,

    #[error("monitor is closed")]
    Closed,

    #[error("batch lifecycle failed while trying to {stage}: {source}")]
    BatchLifecycle {
        stage: &'static str,
        #[source]
        source: StoreError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}
