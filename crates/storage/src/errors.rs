//! Routing-staleness classification of store failures.
//!
//! Every remote store call goes through [`classify`]; retry and refresh decisions are made by
//! the router from its answer and nowhere else.

use std::fmt;

use dtx_common::{DtxError, StoreErrorCode};

/// What a caller must do before retrying a failed store call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Wrong node or no serving peer: re-resolve the leader and retry.
    PeerInvalid,
    /// Ownership generation moved: refresh the directory entry and retry.
    EpochInvalid,
    /// Not retryable here; fails the phase.
    Other,
}

impl ErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::PeerInvalid => "peer_invalid",
            ErrorClass::EpochInvalid => "epoch_invalid",
            ErrorClass::Other => "other",
        }
    }

    pub fn is_retryable(self) -> bool {
        !matches!(self, ErrorClass::Other)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Leader or peer must be refreshed.
pub fn is_invalid_peer(code: StoreErrorCode) -> bool {
    matches!(
        code,
        StoreErrorCode::CallSelfEndpointError
            | StoreErrorCode::NotLeader
            | StoreErrorCode::NoRegionFound
            | StoreErrorCode::LeaderNotAvailable
    )
}

/// Region route table must be refreshed.
pub fn is_invalid_epoch(code: StoreErrorCode) -> bool {
    matches!(
        code,
        StoreErrorCode::InvalidRegionMembership
            | StoreErrorCode::InvalidRegionVersion
            | StoreErrorCode::InvalidRegionEpoch
    )
}

pub fn classify_code(code: StoreErrorCode) -> ErrorClass {
    if is_invalid_peer(code) {
        ErrorClass::PeerInvalid
    } else if is_invalid_epoch(code) {
        ErrorClass::EpochInvalid
    } else {
        ErrorClass::Other
    }
}

/// Errors without a store code (planning, cancellation, IO) are always `Other`.
pub fn classify(err: &DtxError) -> ErrorClass {
    err.store_code().map_or(ErrorClass::Other, classify_code)
}
