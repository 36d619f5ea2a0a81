use crate::coordinator::SuggestionAction;
use crate::fetch::Region;
use heph_core::push_wire::FrameError;
use heph_core::SuggestionStatus;
use thiserror::Error;

/// Transient read failure. Absorbed by the engine once data exists.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("{region} request failed: {reason}")]
    Transport { region: Region, reason: String },
    #[error("{region} request returned HTTP {status}")]
    Status { region: Region, status: u16 },
    #[error("{region} payload decode failed: {reason}")]
    Decode { region: Region, reason: String },
}

impl FetchError {
    pub fn region(&self) -> Region {
        match self {
            FetchError::Transport { region, .. }
            | FetchError::Status { region, .. }
            | FetchError::Decode { region, .. } => *region,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscriptionError {
    #[error("push connect failed: {0}")]
    Connect(String),
    #[error("push read failed: {0}")]
    Read(String),
    #[error("push channel closed by peer")]
    Closed,
    #[error(transparent)]
    Frame(#[from] FrameError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("{action} {suggestion_id} failed: {reason}")]
    Transport {
        action: SuggestionAction,
        suggestion_id: String,
        reason: String,
    },
    #[error("{action} {suggestion_id} conflicted: {message}")]
    Conflict {
        action: SuggestionAction,
        suggestion_id: String,
        message: String,
    },
    #[error("{action} {suggestion_id} rejected with HTTP {status}: {message}")]
    Rejected {
        action: SuggestionAction,
        suggestion_id: String,
        status: u16,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("suggestion {suggestion_id} is already {status}")]
pub struct StaleStateError {
    pub suggestion_id: String,
    pub status: SuggestionStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MutationError {
    #[error(transparent)]
    Stale(#[from] StaleStateError),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("suggestion {0} is not in the current view")]
    UnknownSuggestion(String),
    #[error("a command for suggestion {0} is already in flight")]
    InFlight(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid {field} '{value}': {reason}")]
    InvalidUrl {
        field: &'static str,
        value: String,
        reason: String,
    },
    #[error("invalid {field} '{value}': must be a positive number of milliseconds")]
    InvalidInterval { field: &'static str, value: String },
}
