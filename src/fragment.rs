//! Mesh fragments handed in by the isosurface extractor
use nalgebra::Vector3;

use crate::chunk::ChunkId;
use crate::Error;

/// One batch of geometry produced by the extractor for a single chunk
///
/// The vertex array is split into an internal prefix, private to this
/// fragment, and an external suffix that may be shared with other fragments.
/// `vertex_keys[i]` names external vertex `num_internal + i` in the global
/// sampling grid: two fragments carry the same key exactly when they mean
/// the same weldable vertex.
///
/// All slices are borrowed; the mesher copies what it needs before
/// [`add`](crate::Mesher::add) returns, so the backing storage may be reused
/// or freed immediately afterwards.
#[derive(Copy, Clone, Debug)]
pub struct MeshFragment<'a> {
    /// Chunk that receives this fragment
    pub chunk_id: ChunkId,
    /// Vertex positions, internal vertices first
    pub vertices: &'a [Vector3<f32>],
    /// Keys for the external suffix of `vertices`
    pub vertex_keys: &'a [u64],
    /// Triangles as indices into `vertices`
    pub triangles: &'a [[u32; 3]],
    /// Number of leading vertices that are internal
    pub num_internal: usize,
}

impl MeshFragment<'_> {
    /// Number of external vertices (the keyed suffix)
    pub fn num_external(&self) -> usize {
        self.vertices.len() - self.num_internal
    }

    /// Checks the structural parts of the producer contract
    ///
    /// Index ranges are only checked in debug builds; the producer is
    /// trusted not to emit degenerate geometry.
    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.num_internal > self.vertices.len() {
            return Err(Error::BadFragment(
                "internal vertex count exceeds the vertex array",
            ));
        }
        if self.vertex_keys.len() != self.num_external() {
            return Err(Error::BadFragment(
                "vertex key array does not match the external suffix",
            ));
        }
        debug_assert!(
            self.triangles
                .iter()
                .flatten()
                .all(|&i| (i as usize) < self.vertices.len()),
            "triangle index out of range"
        );
        Ok(())
    }
}
