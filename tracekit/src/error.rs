//! Error taxonomy for the tracing engine (spec §7).
//!
//! The emit path never surfaces these — it drops records and increments
//! counters. `TraceError` covers the synchronous `bind`/`open` surface;
//! `DecodeError` covers per-record failures the decoder turns into `Error`
//! events rather than propagating.

use thiserror::Error;

pub type TraceResult<T> = std::result::Result<T, TraceError>;
pub type DecodeResult<T> = std::result::Result<T, DecodeError>;

#[derive(Error, Debug)]
pub enum TraceError {
    #[error("invalid tracebuffer name {0:?}: must match ^[A-Za-z][A-Za-z0-9_]{{0,255}}$")]
    InvalidName(String),

    #[error("tracebuffer {name:?} already bound with body size {existing}, requested {requested}")]
    SizeMismatch {
        name: String,
        existing: u64,
        requested: u64,
    },

    #[error("tracebuffer file header invalid or unknown version: {0}")]
    InvalidTracebuffer(String),

    #[error("requested size {0} too small to hold region headers")]
    RegionTooSmall(u64),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unrecoverable OS adapter failure: {0}")]
    Unrecoverable(String),
}

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("catalog entry missing or corrupt at offset {0}")]
    InvalidMeta(u64),

    #[error("format/argument mismatch while rendering catalog entry at offset {0}")]
    FormattingFailed(u64),

    #[error("ring buffer record failed structural validation at offset {0}")]
    InvalidEntry(u64),

    #[error("decoder lost synchronisation, resyncing from offset {0}")]
    Synchronisation(u64),

    #[error("tracebuffer file header invalid or unknown version: {0}")]
    InvalidTracebuffer(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
