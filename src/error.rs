//! Error taxonomy for the dispatch engine.
//!
//! Expected outcomes (no unit available, no route between two points, a unit
//! without a cached route) are not errors: they are returned as empty
//! collections, `None`, or report flags. The variants below cover transient
//! I/O failures and invariant violations only.

use thiserror::Error;

/// Errors raised by the engine's collaborators.
#[derive(Error, Debug)]
pub enum Error {
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("illegal {entity} transition: {from} -> {to}")]
    IllegalTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("unknown {entity} status: {value}")]
    UnknownStatus { entity: &'static str, value: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid road network: {0}")]
    RoadNetwork(String),
}

impl Error {
    /// Shorthand for a missing row.
    pub fn not_found(entity: &'static str, id: i64) -> Self {
        Error::NotFound { entity, id }
    }

    /// Whether the error means the referenced entity does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
