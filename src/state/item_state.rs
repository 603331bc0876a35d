/// Work item state definitions for tracking pipeline progress
///
/// This module defines every state a work item can be in and the failure
/// classes recorded against dead-lettered or stalled items.
use std::fmt;

/// Represents the current state of a work item in the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemState {
    // ===== Active States =====
    /// Known but not resident in the in-memory frontier
    Discovered,

    /// Waiting in the frontier, possibly with a future eligibility time
    Queued,

    /// Claimed by a worker and being fetched
    Fetching,

    /// Last attempt failed transiently; a delayed retry is scheduled
    Retrying,

    /// Fetched and being extracted/persisted
    Parsing,

    // ===== Terminal States =====
    /// All extracted entities were persisted
    Persisted,

    /// Gave up: permanent failure, malformed content or retries exhausted
    DeadLettered,
}

impl ItemState {
    /// Returns true if this is a terminal state (no further processing needed)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Persisted | Self::DeadLettered)
    }

    /// Returns true if a worker currently owns the item
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Fetching | Self::Retrying | Self::Parsing)
    }

    /// Converts the state to its database string representation
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::Queued => "queued",
            Self::Fetching => "fetching",
            Self::Retrying => "retrying",
            Self::Parsing => "parsing",
            Self::Persisted => "persisted",
            Self::DeadLettered => "dead_lettered",
        }
    }

    /// Parses a state from its database string representation
    ///
    /// Returns None if the string doesn't match any known state.
    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "discovered" => Some(Self::Discovered),
            "queued" => Some(Self::Queued),
            "fetching" => Some(Self::Fetching),
            "retrying" => Some(Self::Retrying),
            "parsing" => Some(Self::Parsing),
            "persisted" => Some(Self::Persisted),
            "dead_lettered" => Some(Self::DeadLettered),
            _ => None,
        }
    }

    /// Returns all possible item states
    pub fn all_states() -> Vec<Self> {
        vec![
            Self::Discovered,
            Self::Queued,
            Self::Fetching,
            Self::Retrying,
            Self::Parsing,
            Self::Persisted,
            Self::DeadLettered,
        ]
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}

/// Why an item failed, recorded for operator triage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    /// Network error, timeout or transient server response
    RetryableFetch,
    /// Not found, forbidden or malformed address
    PermanentFetch,
    /// Content could not be parsed
    Extraction,
    /// Storage was unreachable while persisting
    PersistenceFatal,
}

impl FailureClass {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::RetryableFetch => "retryable_fetch",
            Self::PermanentFetch => "permanent_fetch",
            Self::Extraction => "extraction",
            Self::PersistenceFatal => "persistence_fatal",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "retryable_fetch" => Some(Self::RetryableFetch),
            "permanent_fetch" => Some(Self::PermanentFetch),
            "extraction" => Some(Self::Extraction),
            "persistence_fatal" => Some(Self::PersistenceFatal),
            _ => None,
        }
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}
