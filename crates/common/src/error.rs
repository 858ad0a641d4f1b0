use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Canonical dtx error taxonomy used across crates.
///
/// Classification guidance:
/// - [`DtxError::MalformedPlan`]: a rendered job violated a structural invariant; never retried
/// - [`DtxError::Planning`]: unknown table/partition, bad template, bad parameters before execution
/// - [`DtxError::Execution`]: runtime operator failures that are not remote store errors
/// - [`DtxError::Store`]: an error returned by a store instance; routing policy is decided by
///   the classifier in `dtx-storage`
/// - [`DtxError::Canceled`]: the running phase was aborted and the operator stopped pulling
/// - [`DtxError::InvalidConfig`]: catalog/config/environment contract violations
/// - [`DtxError::Unsupported`]: valid but intentionally unimplemented behavior
/// - [`DtxError::Io`]: raw filesystem IO failures from std APIs
#[derive(Debug, Error)]
pub enum DtxError {
    /// Invalid or inconsistent configuration/catalog state.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Plan construction failures discovered before dispatch.
    ///
    /// Examples:
    /// - unknown table or partition id
    /// - transaction without participants
    #[error("planning error: {0}")]
    Planning(String),

    /// A rendered plan broke a structural invariant (programming error).
    ///
    /// Examples:
    /// - root element of a checked render produced dangling outputs
    /// - a `Composite` element visited as a terminal
    #[error("malformed plan: {0}")]
    MalformedPlan(String),

    /// Runtime execution failures after rendering succeeded.
    #[error("execution error: {0}")]
    Execution(String),

    /// Error reported by a remote store instance.
    #[error("store error: {0}")]
    Store(StoreError),

    /// The enclosing job was canceled before this operator finished.
    #[error("canceled: {0}")]
    Canceled(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Valid request for a feature/shape not implemented in current version.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl DtxError {
    /// Shortcut for building a store error.
    pub fn store(code: StoreErrorCode, message: impl Into<String>) -> Self {
        DtxError::Store(StoreError {
            code,
            message: message.into(),
        })
    }

    /// Store error code carried by this error, if any.
    pub fn store_code(&self) -> Option<StoreErrorCode> {
        match self {
            DtxError::Store(e) => Some(e.code),
            _ => None,
        }
    }
}

impl From<StoreError> for DtxError {
    fn from(e: StoreError) -> Self {
        DtxError::Store(e)
    }
}

/// Error codes a store instance may answer with.
///
/// The routing codes mirror the raft region-store protocol; the remaining codes are
/// transaction or engine level failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StoreErrorCode {
    /// The request was routed back to the calling endpoint.
    CallSelfEndpointError,
    /// The addressed peer is not the region leader.
    NotLeader,
    /// The addressed node does not host the region.
    NoRegionFound,
    /// The region currently has no elected leader.
    LeaderNotAvailable,
    /// Region membership (conf version) changed.
    InvalidRegionMembership,
    /// Region version (split/merge) changed.
    InvalidRegionVersion,
    /// Both membership and version changed.
    InvalidRegionEpoch,
    /// Key lies outside the region's key range.
    KeyOutOfRange,
    /// Another transaction holds a lock on the key, or committed after our start.
    WriteConflict,
    /// Commit found no lock for the transaction (lock expired or rolled back).
    TxnLockNotFound,
    /// Underlying storage engine failure.
    StorageError,
    /// The request timed out.
    Timeout,
    /// Any other internal failure.
    Internal,
}

impl StoreErrorCode {
    /// Every code, in declaration order. Kept in step with [`StoreErrorCode::ordinal`].
    pub const ALL: [StoreErrorCode; 13] = [
        StoreErrorCode::CallSelfEndpointError,
        StoreErrorCode::NotLeader,
        StoreErrorCode::NoRegionFound,
        StoreErrorCode::LeaderNotAvailable,
        StoreErrorCode::InvalidRegionMembership,
        StoreErrorCode::InvalidRegionVersion,
        StoreErrorCode::InvalidRegionEpoch,
        StoreErrorCode::KeyOutOfRange,
        StoreErrorCode::WriteConflict,
        StoreErrorCode::TxnLockNotFound,
        StoreErrorCode::StorageError,
        StoreErrorCode::Timeout,
        StoreErrorCode::Internal,
    ];

    /// Position in [`StoreErrorCode::ALL`]. The match is exhaustive, so a new variant does
    /// not compile until it is given a slot here and in `ALL`.
    pub const fn ordinal(self) -> usize {
        match self {
            StoreErrorCode::CallSelfEndpointError => 0,
            StoreErrorCode::NotLeader => 1,
            StoreErrorCode::NoRegionFound => 2,
            StoreErrorCode::LeaderNotAvailable => 3,
            StoreErrorCode::InvalidRegionMembership => 4,
            StoreErrorCode::InvalidRegionVersion => 5,
            StoreErrorCode::InvalidRegionEpoch => 6,
            StoreErrorCode::KeyOutOfRange => 7,
            StoreErrorCode::WriteConflict => 8,
            StoreErrorCode::TxnLockNotFound => 9,
            StoreErrorCode::StorageError => 10,
            StoreErrorCode::Timeout => 11,
            StoreErrorCode::Internal => 12,
        }
    }
}

// `ALL` lists each ordinal exactly once, in order.
const _: () = {
    let mut i = 0;
    while i < StoreErrorCode::ALL.len() {
        assert!(StoreErrorCode::ALL[i].ordinal() == i);
        i += 1;
    }
};

impl fmt::Display for StoreErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StoreErrorCode::CallSelfEndpointError => "CALL_SELF_ENDPOINT_ERROR",
            StoreErrorCode::NotLeader => "NOT_LEADER",
            StoreErrorCode::NoRegionFound => "NO_REGION_FOUND",
            StoreErrorCode::LeaderNotAvailable => "LEADER_NOT_AVAILABLE",
            StoreErrorCode::InvalidRegionMembership => "INVALID_REGION_MEMBERSHIP",
            StoreErrorCode::InvalidRegionVersion => "INVALID_REGION_VERSION",
            StoreErrorCode::InvalidRegionEpoch => "INVALID_REGION_EPOCH",
            StoreErrorCode::KeyOutOfRange => "KEY_OUT_OF_RANGE",
            StoreErrorCode::WriteConflict => "WRITE_CONFLICT",
            StoreErrorCode::TxnLockNotFound => "TXN_LOCK_NOT_FOUND",
            StoreErrorCode::StorageError => "STORAGE_ERROR",
            StoreErrorCode::Timeout => "TIMEOUT",
            StoreErrorCode::Internal => "INTERNAL",
        };
        f.write_str(s)
    }
}

/// A coded failure returned by a store instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreError {
    /// Machine-readable code used for routing decisions.
    pub code: StoreErrorCode,
    /// Human-readable detail.
    pub message: String,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for StoreError {}

/// Standard dtx result alias.
pub type Result<T> = std::result::Result<T, DtxError>;
