//! Output chunk identifiers and filename generation
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Identifier for a single output chunk
///
/// Chunks are numbered with a dense, monotonically increasing *generation*;
/// the 3D coordinates locate the chunk in the sampling grid and are only
/// used to build the output filename. Equality and ordering consider the
/// generation alone, so a gap-filling placeholder compares equal to whatever
/// chunk would have occupied that generation.
#[derive(Copy, Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChunkId {
    /// Dense generation number, assigned in arrival order
    pub generation: u32,
    /// Grid coordinates, used by [`ChunkNamer`]
    pub coords: [u32; 3],
}

impl ChunkId {
    /// Builds a chunk id from a generation and grid coordinates
    pub fn new(generation: u32, coords: [u32; 3]) -> Self {
        Self { generation, coords }
    }
}

impl PartialEq for ChunkId {
    fn eq(&self, other: &Self) -> bool {
        self.generation == other.generation
    }
}

impl Eq for ChunkId {}

impl PartialOrd for ChunkId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ChunkId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.generation.cmp(&other.generation)
    }
}

impl std::fmt::Display for ChunkId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{} ({} {} {})",
            self.generation, self.coords[0], self.coords[1], self.coords[2]
        )
    }
}

/// Maps chunk ids to output filenames
///
/// Implementations must be pure: the mesher may ask for the same name more
/// than once and expects the same answer.
pub trait Namer {
    /// Returns the output filename for the given chunk
    fn name(&self, chunk: &ChunkId) -> PathBuf;
}

impl<F: Fn(&ChunkId) -> PathBuf> Namer for F {
    fn name(&self, chunk: &ChunkId) -> PathBuf {
        self(chunk)
    }
}

/// [`Namer`] that encodes the chunk coordinates into the filename
///
/// The generated name is `<base>_XXXX_YYYY_ZZZZ.ply`, where `base` is the
/// base name given to the constructor (it may contain directory components)
/// and `XXXX`, `YYYY`, `ZZZZ` are the zero-padded grid coordinates.
#[derive(Clone, Debug)]
pub struct ChunkNamer {
    base: String,
}

impl ChunkNamer {
    /// Builds a namer from the given base name
    pub fn new(base: impl Into<String>) -> Self {
        Self { base: base.into() }
    }
}

impl Namer for ChunkNamer {
    fn name(&self, chunk: &ChunkId) -> PathBuf {
        PathBuf::from(format!(
            "{}_{:04}_{:04}_{:04}.ply",
            self.base, chunk.coords[0], chunk.coords[1], chunk.coords[2]
        ))
    }
}

/// [`Namer`] that always returns the same filename
///
/// Only useful when the whole output is known to fit in a single chunk.
#[derive(Clone, Debug)]
pub struct TrivialNamer {
    name: PathBuf,
}

impl TrivialNamer {
    /// Builds a namer that always answers `name`
    pub fn new(name: impl Into<PathBuf>) -> Self {
        Self { name: name.into() }
    }
}

impl Namer for TrivialNamer {
    fn name(&self, _chunk: &ChunkId) -> PathBuf {
        self.name.clone()
    }
}
