use thiserror::Error;

use crate::event::EventId;

/// Error taxonomy the engine surfaces (§7). Mirrors the teacher's
/// `thiserror`-derived `error::Error`, with `#[from]` conversions for the
/// underlying store and domain variants that carry no foreign cause.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("input failed shape validation: {0}")]
    Invalid(String),

    #[error("event already stored")]
    Duplicate,

    #[error("event is superseded by an existing event at the same replaceable address")]
    Superseded,

    #[error("admission blocked by deletion {by}")]
    Blocked { by: EventId },

    #[error("not found")]
    NotFound,

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("query_for_ids does not accept filters with `ids` set")]
    IdsDisallowed,

    #[error("LMDB error: {0}")]
    Store(#[from] heed::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
