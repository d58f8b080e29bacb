//! Module containing the crate-wide error type
use thiserror::Error;

use crate::chunk::ChunkId;

/// Universal error type for this crate
///
/// The overflow variants ([`TooManyComponents`](Error::TooManyComponents),
/// [`ChunkTooLarge`](Error::ChunkTooLarge)) are unrecoverable: once raised,
/// the mesher's tables no longer describe a mesh that can be written.
/// Everything else leaves the mesher (or its scratch files) in a usable
/// state.
#[derive(Error, Debug)]
pub enum Error {
    /// The global component table is limited to `i32::MAX` entries
    #[error("too many connected components for 32-bit clump ids")]
    TooManyComponents,

    /// The chunk's external vertices plus a single component's internal
    /// vertices no longer fit the hybrid 2^31 index encoding
    #[error("chunk {0} requires more than 2^31 vertex indices")]
    ChunkTooLarge(ChunkId),

    /// The producer handed in a fragment that violates its contract
    #[error("bad mesh fragment: {0}")]
    BadFragment(&'static str),

    /// A single allocation request exceeded the entire buffer pool
    #[error("requested {requested} buffer bytes but the pool holds only {total}")]
    ResourceExhausted {
        /// Bytes asked for in one `acquire` call
        requested: usize,
        /// Total byte budget of the pool
        total: usize,
    },

    /// I/O on a temporary geometry file failed
    #[error("temporary file I/O failed: {0}")]
    TempIo(#[source] std::io::Error),

    /// Opening or writing an output file failed
    #[error("output file I/O failed: {0}")]
    OutputIo(#[source] std::io::Error),

    /// A checkpoint refers to temporary files that are missing or short
    #[error("checkpoint does not match its temporary files: {0}")]
    ResumeMismatch(String),

    /// A checkpoint file could not be written or decoded
    #[error("bad checkpoint: {0}")]
    Checkpoint(String),
}
