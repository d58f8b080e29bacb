//! Clump and chunk bookkeeping tables
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::chunk::ChunkId;
use crate::union_find::{Forest, Merge};

/// Index into the global clump table
pub(crate) type ClumpId = i32;

/// Component totals, valid only at union-find roots
#[derive(Copy, Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct ClumpMeta {
    /// Unique vertices in the component, across all chunks
    pub vertices: u64,
    /// Triangles in the component
    pub triangles: u64,
}

impl Merge for ClumpMeta {
    fn merge(&mut self, loser: &Self) {
        self.vertices += loser.vertices;
        self.triangles += loser.triangles;
    }
}

/// The global union-find forest over clumps
pub(crate) type ClumpForest = Forest<ClumpMeta>;

impl ClumpForest {
    /// Whether the component containing `id` survives the prune threshold
    pub fn keep(&mut self, id: ClumpId, threshold_vertices: u64) -> bool {
        let root = self.find(id);
        self.meta(root).vertices >= threshold_vertices
    }
}

/// Chunk-local clump record
///
/// Describes one contiguous run of vertex and triangle records produced by a
/// single fragment's local component. Offsets are buffer-local while the
/// record sits on a chunk's buffered list and are rebased to absolute
/// temp-file record offsets when the reorder buffer is flushed.
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub(crate) struct ChunkClump {
    /// First vertex record of this clump
    pub first_vertex: u64,
    /// First triangle record of this clump
    pub first_triangle: u64,
    /// Internal vertices, starting at `first_vertex`
    pub num_internal_vertices: u32,
    /// External vertices introduced by this record, following the internal
    /// ones. Externals already present in an earlier record of the same
    /// chunk are not stored again.
    pub num_external_vertices: u32,
    /// Triangles, starting at `first_triangle`
    pub num_triangles: u32,
    /// Index of this clump in the global table; never changes once assigned
    pub global_id: ClumpId,
}

impl ChunkClump {
    /// Vertex records this clump owns in the temp file
    pub fn num_vertices(&self) -> u64 {
        self.num_internal_vertices as u64 + self.num_external_vertices as u64
    }
}

/// Per-chunk state
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct Chunk {
    pub chunk_id: ChunkId,
    /// Records already rebased to temp-file offsets, in emission order
    pub clumps: Vec<ChunkClump>,
    /// Records still pointing into the live reorder buffer
    #[serde(skip)]
    pub buffered_clumps: Vec<ChunkClump>,
    /// External vertex key to dense per-chunk external index
    #[serde(skip)]
    pub vertex_id_map: FxHashMap<u64, u32>,
    /// Number of distinct external keys seen in this chunk
    pub num_external_vertices: u32,
}

impl Chunk {
    fn placeholder(generation: u32) -> Self {
        Self {
            chunk_id: ChunkId {
                generation,
                coords: [0; 3],
            },
            ..Self::default()
        }
    }
}

/// All chunks seen so far, dense in the generation axis
///
/// Generations that never received a fragment are plugged with placeholder
/// chunks so the produce pass still emits a (empty) file for them.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct ChunkTable {
    chunks: Vec<Chunk>,
}

impl ChunkTable {
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Fetches the chunk for `id`, filling any generation gap before it
    pub fn get_or_insert(&mut self, id: ChunkId) -> &mut Chunk {
        let generation = id.generation as usize;
        while self.chunks.len() <= generation {
            let gap = self.chunks.len() as u32;
            self.chunks.push(Chunk::placeholder(gap));
        }
        let chunk = &mut self.chunks[generation];
        chunk.chunk_id = id;
        chunk
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Chunk> {
        self.chunks.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Chunk> {
        self.chunks.iter_mut()
    }
}
