//! The produce pass: placement planning and temp-file readback
use std::fs::File;
use std::io::{BufReader, Read};
use std::marker::PhantomData;
use std::path::Path;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::mesher::clump::{Chunk, ClumpForest};
use crate::Error;

/// Triangle indices at or above this bit are complemented chunk-external
/// indices; below it they are clump-local internal ranks.
pub(crate) const EXTERNAL_BIT: u32 = 1 << 31;

/// Placement marker for clumps and external vertices that were pruned
pub(crate) const PRUNED: u32 = u32::MAX;

/// Whole-mesh totals for the produce pass
#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct Statistics {
    /// Minimum component vertex count to survive pruning
    pub threshold_vertices: u64,
    pub kept_components: u64,
    pub kept_vertices: u64,
    pub kept_triangles: u64,
}

/// Applies the prune fraction to the global clump table
pub(crate) fn statistics(clumps: &ClumpForest, prune_threshold: f64) -> Statistics {
    let mut total_vertices = 0u64;
    for id in 0..clumps.len() as i32 {
        if clumps.is_root(id) {
            total_vertices += clumps.meta(id).vertices;
        }
    }
    let threshold_vertices = (prune_threshold * total_vertices as f64).floor() as u64;

    let mut stats = Statistics {
        threshold_vertices,
        ..Statistics::default()
    };
    for id in 0..clumps.len() as i32 {
        if clumps.is_root(id) && clumps.meta(id).vertices >= threshold_vertices {
            stats.kept_components += 1;
            stats.kept_vertices += clumps.meta(id).vertices;
            stats.kept_triangles += clumps.meta(id).triangles;
        }
    }
    stats
}

/// Where each clump record and external vertex of one chunk lands in the
/// output file
///
/// Indexed parallel to the chunk's committed clump list; pruned records get
/// [`PRUNED`] sentinels. External vertices take their final position inside
/// the record that introduced them, so the remap table can be built from
/// record counts alone without consulting the key map.
pub(crate) struct ChunkPlan {
    pub start_vertex: Vec<u32>,
    pub start_triangle: Vec<u64>,
    /// Chunk-external index to final output vertex index
    pub external_remap: Vec<u32>,
    pub num_vertices: u64,
    pub num_triangles: u64,
}

impl ChunkPlan {
    pub fn build(chunk: &Chunk, clumps: &mut ClumpForest, threshold_vertices: u64) -> Self {
        let total_external: u64 = chunk
            .clumps
            .iter()
            .map(|c| c.num_external_vertices as u64)
            .sum();

        let mut plan = ChunkPlan {
            start_vertex: Vec::with_capacity(chunk.clumps.len()),
            start_triangle: Vec::with_capacity(chunk.clumps.len()),
            external_remap: vec![PRUNED; total_external as usize],
            num_vertices: 0,
            num_triangles: 0,
        };

        let mut next_external = 0u64;
        for record in &chunk.clumps {
            if clumps.keep(record.global_id, threshold_vertices) {
                plan.start_vertex.push(plan.num_vertices as u32);
                plan.start_triangle.push(plan.num_triangles);
                let first = plan.num_vertices + record.num_internal_vertices as u64;
                for j in 0..record.num_external_vertices as u64 {
                    plan.external_remap[(next_external + j) as usize] = (first + j) as u32;
                }
                plan.num_vertices += record.num_vertices();
                plan.num_triangles += record.num_triangles as u64;
            } else {
                plan.start_vertex.push(PRUNED);
                plan.start_triangle.push(u64::MAX);
            }
            next_external += record.num_external_vertices as u64;
        }
        plan
    }

    pub fn is_pruned(&self, record: usize) -> bool {
        self.start_vertex[record] == PRUNED
    }
}

/// Forward-only record reader over one temp file
///
/// The produce pass touches every surviving record exactly once, in the
/// order it was appended, so a buffered sequential reader with relative
/// seeks over the pruned runs is all that is needed.
pub(crate) struct TmpReader<T> {
    file: BufReader<File>,
    /// Record index the underlying cursor sits at
    pos: u64,
    _records: PhantomData<T>,
}

impl<T: FromBytes + IntoBytes + Immutable + KnownLayout> TmpReader<T> {
    pub fn open(path: &Path) -> Result<Self, Error> {
        let file = File::open(path).map_err(Error::TempIo)?;
        Ok(Self {
            file: BufReader::with_capacity(1 << 20, file),
            pos: 0,
            _records: PhantomData,
        })
    }

    /// Fills `out` with the records starting at index `first`
    pub fn read_at(&mut self, first: u64, out: &mut [T]) -> Result<(), Error> {
        assert!(first >= self.pos, "temp file reads must advance");
        let skip = (first - self.pos) * std::mem::size_of::<T>() as u64;
        if skip > 0 {
            self.file
                .seek_relative(skip as i64)
                .map_err(Error::TempIo)?;
        }
        self.file
            .read_exact(out.as_mut_bytes())
            .map_err(Error::TempIo)?;
        self.pos = first + out.len() as u64;
        Ok(())
    }
}
