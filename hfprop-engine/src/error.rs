///! Error types for the propagation engine

use hfprop_common::FeedSource;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PropagationError {
    #[error("Invalid Maidenhead locator: {0:?}")]
    InvalidLocator(String),

    #[error("{feed} feed unavailable: {reason}")]
    FeedUnavailable { feed: FeedSource, reason: String },

    #[error("Failed to parse feed payload: {0}")]
    Parse(String),

    #[error("Invalid band table: {0}")]
    InvalidBandTable(String),
}

pub type Result<T> = std::result::Result<T, PropagationError>;
