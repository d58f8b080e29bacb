//! The out-of-core mesher
//!
//! [`Mesher`] accepts a stream of [`MeshFragment`]s from an isosurface
//! extractor and turns them into well-formed output chunks without ever
//! holding the mesh in memory. Component identification is two-level:
//! within each fragment a union-find over the triangle edges yields local
//! components, called *clumps*; external vertices then weld clumps that
//! belong to the same surface into one global component, recorded in a
//! second union-find built over the clumps themselves.
//!
//! Geometry is staged per clump — internal vertices first, then the
//! external vertices not already stored by an earlier clump of the same
//! chunk — into a reorder buffer that is flushed to two append-only scratch
//! files as large scatter writes. Triangles are stored in a hybrid index
//! encoding: values below 2^31 are clump-local internal ranks, everything
//! else is a bit-complemented chunk-external index. The produce pass reads
//! the scratch files back strictly sequentially, drops components below the
//! prune threshold, rewrites indices into the final per-chunk numbering and
//! streams the result to the downstream writer.
//!
//! In-memory state is bounded by the component and key tables plus a fixed
//! buffer budget; it does not grow with the size of the mesh itself.

mod checkpoint;
mod clump;
mod reorder;
mod tmp_writer;
mod write;

use std::collections::hash_map::Entry;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::async_writer::{AsyncWriter, WriteJob};
use crate::chunk::Namer;
use crate::fragment::MeshFragment;
use crate::union_find::Forest;
use crate::writer::{MeshWriter, Triangle, Vertex};
use crate::Error;

use clump::{ChunkClump, ChunkTable, ClumpForest, ClumpId, ClumpMeta};
use reorder::{BufferPool, ReorderBuffer};
use tmp_writer::TmpWriter;
use write::{ChunkPlan, TmpReader, EXTERNAL_BIT};

/// Reorder buffers the pool can hand out before `acquire` blocks
const REORDER_SLOTS: usize = 4;

/// Records per read/write batch in the produce pass
const VERTEX_BATCH: usize = 1 << 16;
const TRIANGLE_BATCH: usize = 1 << 16;

/// Tuning and policy knobs for a [`Mesher`]
#[derive(Clone, Debug)]
pub struct Config {
    /// Minimum component size, as a fraction in `[0, 1]` of the pre-prune
    /// vertex total. Components with fewer vertices are dropped from the
    /// output. `0.0` (the default) keeps everything.
    pub prune_threshold: f64,
    /// Capacity of one reorder buffer in bytes; staged geometry is flushed
    /// to the scratch files once it exceeds this
    pub reorder_capacity: usize,
    /// Keep the scratch files after a successful write
    pub retain_temp_files: bool,
    /// Directory for scratch files; `None` means the system temp directory
    pub scratch_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            prune_threshold: 0.0,
            reorder_capacity: 4 * 1024 * 1024,
            retain_temp_files: false,
            scratch_dir: None,
        }
    }
}

/// Recycled per-fragment working memory
#[derive(Default)]
struct Scratch {
    /// Global clump id per fragment vertex
    clump_of: Vec<ClumpId>,
    /// Encoded triangle index per fragment vertex
    label: Vec<u32>,
    /// Triangles per local root
    triangle_count: Vec<u32>,
    /// Heads of the per-clump vertex chains
    first_vertex: Vec<i32>,
    next_vertex: Vec<i32>,
    /// Heads of the per-clump triangle chains
    first_triangle: Vec<i32>,
    next_triangle: Vec<i32>,
    /// Keys of the fragment being ingested, for duplicate detection
    keys: FxHashSet<u64>,
}

/// Out-of-core mesh assembler
///
/// Feed fragments with [`add`](Mesher::add) — one thread at a time, chunk
/// generations in ascending order — then call [`write`](Mesher::write) to
/// produce the output files, or [`checkpoint`](Mesher::checkpoint) to defer
/// that to a separate process via [`resume`](Mesher::resume).
///
/// Scratch storage on disk is roughly the size of the final output; memory
/// stays bounded by the component tables and a fixed buffer budget.
pub struct Mesher {
    config: Config,
    writer: Option<Box<dyn MeshWriter + Send>>,
    namer: Box<dyn Namer>,

    /// All clumps ever created, with component totals at the roots
    clumps: ClumpForest,
    /// External vertex key to the first clump that saw it
    clump_id_map: FxHashMap<u64, ClumpId>,
    chunks: ChunkTable,

    pool: Arc<BufferPool>,
    /// Live while ingesting; `None` once finalized or resumed
    tmp_writer: Option<TmpWriter>,
    /// The reorder buffer currently being filled, if any
    reorder: Option<ReorderBuffer>,
    tmp_vertices: PathBuf,
    tmp_triangles: PathBuf,
    /// Vertex records flushed to the scratch file so far
    written_vertices_tmp: u64,
    /// Triangle records flushed to the scratch file so far
    written_triangles_tmp: u64,
    preserve_temp_files: bool,

    /// Per-fragment union-find, recycled between fragments
    local: Forest<()>,
    scratch: Scratch,
}

impl Mesher {
    /// Builds a mesher, creates its scratch files and starts the temp
    /// writer thread
    ///
    /// The `writer` is opened and closed once per output chunk during
    /// [`write`](Mesher::write); `namer` chooses the filenames.
    ///
    /// # Panics
    /// If `config.prune_threshold` is outside `[0, 1]` or
    /// `config.reorder_capacity` is zero.
    pub fn new(
        writer: impl MeshWriter + Send + 'static,
        namer: impl Namer + 'static,
        config: Config,
    ) -> Result<Self, Error> {
        assert!(
            (0.0..=1.0).contains(&config.prune_threshold),
            "prune threshold must lie in [0, 1]"
        );
        assert!(config.reorder_capacity > 0, "reorder capacity must be positive");

        let scratch_dir = config
            .scratch_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        let pool = Arc::new(BufferPool::new(REORDER_SLOTS * config.reorder_capacity));
        let tmp_writer = TmpWriter::start(&scratch_dir, Arc::clone(&pool))?;
        let tmp_vertices = tmp_writer.vertices_path().to_owned();
        let tmp_triangles = tmp_writer.triangles_path().to_owned();
        let preserve_temp_files = config.retain_temp_files;

        Ok(Self {
            config,
            writer: Some(Box::new(writer)),
            namer: Box::new(namer),
            clumps: ClumpForest::new(),
            clump_id_map: FxHashMap::default(),
            chunks: ChunkTable::default(),
            pool,
            tmp_writer: Some(tmp_writer),
            reorder: None,
            tmp_vertices,
            tmp_triangles,
            written_vertices_tmp: 0,
            written_triangles_tmp: 0,
            preserve_temp_files,
            local: Forest::new(),
            scratch: Scratch::default(),
        })
    }

    /// Ingests one fragment
    ///
    /// Not thread-safe: the producer must serialize calls. Fragments for a
    /// chunk generation must all arrive before the next generation starts.
    ///
    /// # Errors
    /// [`Error::BadFragment`] rejects a malformed fragment and leaves the
    /// mesher untouched. [`Error::TooManyComponents`] and
    /// [`Error::ChunkTooLarge`] are fatal: the mesh cannot be represented
    /// and the mesher should be dropped.
    pub fn add(&mut self, fragment: &MeshFragment<'_>) -> Result<(), Error> {
        fragment.validate()?;
        if fragment.vertices.len() >= EXTERNAL_BIT as usize
            || fragment.triangles.len() >= EXTERNAL_BIT as usize
        {
            return Err(Error::ChunkTooLarge(fragment.chunk_id));
        }
        // A key appearing twice in one fragment would corrupt the weld
        // counters; refuse rather than guess which vertex was meant.
        self.scratch.keys.clear();
        for &key in fragment.vertex_keys {
            if !self.scratch.keys.insert(key) {
                return Err(Error::BadFragment("duplicate external vertex keys"));
            }
        }

        // The chunk record exists even for empty fragments, so generation
        // gaps stay distinguishable from chunks that produced no geometry.
        self.chunks.get_or_insert(fragment.chunk_id);
        if fragment.vertices.is_empty() && fragment.triangles.is_empty() {
            return Ok(());
        }

        let (first_clump, last_clump) = self.compute_local_components(fragment)?;
        self.weld(fragment);
        self.stage(fragment, first_clump, last_clump)?;

        if self
            .reorder
            .as_ref()
            .is_some_and(|buf| buf.bytes() >= self.config.reorder_capacity)
        {
            self.flush();
        }
        Ok(())
    }

    /// Runs the per-fragment union-find and allocates one global clump per
    /// local component, seeded with the component's vertex and triangle
    /// counts. Returns the allocated clump id range.
    fn compute_local_components(
        &mut self,
        fragment: &MeshFragment<'_>,
    ) -> Result<(ClumpId, ClumpId), Error> {
        let num_vertices = fragment.vertices.len();
        self.local.reset(num_vertices);
        for t in fragment.triangles {
            // Two edges suffice; the third is implied
            self.local.union(t[0] as i32, t[1] as i32);
            self.local.union(t[1] as i32, t[2] as i32);
        }

        let scratch = &mut self.scratch;
        scratch.triangle_count.clear();
        scratch.triangle_count.resize(num_vertices, 0);
        for t in fragment.triangles {
            let root = self.local.find(t[0] as i32);
            scratch.triangle_count[root as usize] += 1;
        }

        scratch.clump_of.clear();
        scratch.clump_of.resize(num_vertices, -1);
        let first_clump = self.clumps.len() as ClumpId;
        for v in 0..num_vertices as i32 {
            if self.local.is_root(v) {
                if self.clumps.len() >= i32::MAX as usize {
                    return Err(Error::TooManyComponents);
                }
                scratch.clump_of[v as usize] = self.clumps.make_set(ClumpMeta {
                    vertices: self.local.size(v) as u64,
                    triangles: scratch.triangle_count[v as usize] as u64,
                });
            }
        }
        for v in 0..num_vertices as i32 {
            let root = self.local.find(v);
            scratch.clump_of[v as usize] = scratch.clump_of[root as usize];
        }
        Ok((first_clump, self.clumps.len() as ClumpId))
    }

    /// Welds this fragment's external vertices into the global key map,
    /// unioning clumps that share a key
    ///
    /// A known key means both sides counted the shared vertex, so every
    /// collision subtracts one from the merged root — also when the clumps
    /// were already joined through an earlier key.
    fn weld(&mut self, fragment: &MeshFragment<'_>) {
        for (j, &key) in fragment.vertex_keys.iter().enumerate() {
            let cid = self.scratch.clump_of[fragment.num_internal + j];
            match self.clump_id_map.entry(key) {
                Entry::Vacant(entry) => {
                    entry.insert(cid);
                }
                Entry::Occupied(entry) => {
                    let root = self.clumps.union(cid, *entry.get());
                    self.clumps.meta_mut(root).vertices -= 1;
                }
            }
        }
    }

    /// Stages the fragment's geometry into the reorder buffer, one clump at
    /// a time, and appends the clump records to the chunk's buffered list
    ///
    /// Vertices land internals-first per clump; external vertices already
    /// present in an earlier clump of the same chunk are elided. Triangle
    /// indices are rewritten into the hybrid encoding as they are copied.
    fn stage(
        &mut self,
        fragment: &MeshFragment<'_>,
        first_clump: ClumpId,
        last_clump: ClumpId,
    ) -> Result<(), Error> {
        let num_vertices = fragment.vertices.len();
        let num_internal = fragment.num_internal;
        let num_clumps = (last_clump - first_clump) as usize;

        let mut buf = match self.reorder.take() {
            Some(buf) => buf,
            None => self.pool.acquire(self.config.reorder_capacity)?,
        };

        let scratch = &mut self.scratch;
        // Per-clump chains over vertex and triangle indices, built backwards
        // so the walks run in ascending index order
        scratch.first_vertex.clear();
        scratch.first_vertex.resize(num_clumps, -1);
        scratch.next_vertex.clear();
        scratch.next_vertex.resize(num_vertices, -1);
        for v in (0..num_vertices).rev() {
            let c = (scratch.clump_of[v] - first_clump) as usize;
            scratch.next_vertex[v] = scratch.first_vertex[c];
            scratch.first_vertex[c] = v as i32;
        }
        scratch.first_triangle.clear();
        scratch.first_triangle.resize(num_clumps, -1);
        scratch.next_triangle.clear();
        scratch.next_triangle.resize(fragment.triangles.len(), -1);
        for t in (0..fragment.triangles.len()).rev() {
            let c = (scratch.clump_of[fragment.triangles[t][0] as usize] - first_clump) as usize;
            scratch.next_triangle[t] = scratch.first_triangle[c];
            scratch.first_triangle[c] = t as i32;
        }

        scratch.label.clear();
        scratch.label.resize(num_vertices, 0);

        let chunk = self.chunks.get_or_insert(fragment.chunk_id);
        let mut result = Ok(());
        for c in 0..num_clumps {
            let record_first_vertex = buf.vertices.len() as u64;
            let mut rank = 0u32;
            let mut v = scratch.first_vertex[c];
            while v >= 0 {
                if (v as usize) < num_internal {
                    scratch.label[v as usize] = rank;
                    rank += 1;
                    buf.vertices.push(Vertex::from(fragment.vertices[v as usize]));
                }
                v = scratch.next_vertex[v as usize];
            }
            let num_record_internal = rank;

            let mut num_record_external = 0u32;
            let mut v = scratch.first_vertex[c];
            while v >= 0 {
                if v as usize >= num_internal {
                    let key = fragment.vertex_keys[v as usize - num_internal];
                    let external = match chunk.vertex_id_map.entry(key) {
                        Entry::Occupied(entry) => *entry.get(),
                        Entry::Vacant(entry) => {
                            let external = chunk.num_external_vertices;
                            entry.insert(external);
                            chunk.num_external_vertices += 1;
                            num_record_external += 1;
                            buf.vertices.push(Vertex::from(fragment.vertices[v as usize]));
                            external
                        }
                    };
                    scratch.label[v as usize] = !external;
                }
                v = scratch.next_vertex[v as usize];
            }

            if chunk.num_external_vertices as u64 + num_record_internal as u64
                >= EXTERNAL_BIT as u64
            {
                result = Err(Error::ChunkTooLarge(chunk.chunk_id));
                break;
            }

            let record_first_triangle = buf.triangles.len() as u64;
            let mut num_record_triangles = 0u32;
            let mut t = scratch.first_triangle[c];
            while t >= 0 {
                let tri = fragment.triangles[t as usize];
                buf.triangles.push(Triangle([
                    scratch.label[tri[0] as usize],
                    scratch.label[tri[1] as usize],
                    scratch.label[tri[2] as usize],
                ]));
                num_record_triangles += 1;
                t = scratch.next_triangle[t as usize];
            }

            if num_record_internal > 0 || num_record_external > 0 || num_record_triangles > 0 {
                chunk.buffered_clumps.push(ChunkClump {
                    first_vertex: record_first_vertex,
                    first_triangle: record_first_triangle,
                    num_internal_vertices: num_record_internal,
                    num_external_vertices: num_record_external,
                    num_triangles: num_record_triangles,
                    global_id: first_clump + c as ClumpId,
                });
            }
        }

        self.reorder = Some(buf);
        result
    }

    /// Promotes buffered clump records to the committed lists, records the
    /// scatter ranges and hands the reorder buffer to the temp writer
    fn flush(&mut self) {
        let Some(mut buf) = self.reorder.take() else {
            return;
        };
        if buf.vertices.is_empty() && buf.triangles.is_empty() {
            self.pool.release(buf);
            return;
        }
        // Buffered records were appended chunk by chunk in generation
        // order, so walking the table in that order recovers the buffer
        // layout.
        for chunk in self.chunks.iter_mut() {
            for mut record in chunk.buffered_clumps.drain(..) {
                push_range(
                    &mut buf.vertex_ranges,
                    record.first_vertex as usize,
                    record.num_vertices() as usize,
                );
                push_range(
                    &mut buf.triangle_ranges,
                    record.first_triangle as usize,
                    record.num_triangles as usize,
                );
                record.first_vertex += self.written_vertices_tmp;
                record.first_triangle += self.written_triangles_tmp;
                chunk.clumps.push(record);
            }
        }
        debug_assert_eq!(
            buf.vertex_ranges.iter().map(|r| r.len()).sum::<usize>(),
            buf.vertices.len(),
            "every staged vertex belongs to a clump record"
        );
        self.written_vertices_tmp += buf.vertex_ranges.iter().map(|r| r.len() as u64).sum::<u64>();
        self.written_triangles_tmp += buf
            .triangle_ranges
            .iter()
            .map(|r| r.len() as u64)
            .sum::<u64>();
        self.tmp_writer
            .as_ref()
            .expect("ingest still active")
            .submit(buf);
    }

    /// Flushes the last reorder buffer and shuts down the temp writer;
    /// idempotent
    fn finalize(&mut self) {
        if self.tmp_writer.is_none() {
            return;
        }
        self.flush();
        if let Some(mut writer) = self.tmp_writer.take() {
            writer.stop();
        }
        log::debug!(
            "ingest complete: {} scratch vertices, {} scratch triangles, {} clumps",
            self.written_vertices_tmp,
            self.written_triangles_tmp,
            self.clumps.len()
        );
    }

    /// Writes all output chunks and returns how many there were
    ///
    /// Finalizes ingest, computes the prune threshold, then replays the
    /// scratch files through the placement plan. On success the scratch
    /// files are removed unless retention is configured; on failure they
    /// are kept so the operation can be retried from a checkpoint.
    pub fn write(mut self) -> Result<usize, Error> {
        self.finalize();
        match self.write_chunks() {
            Ok(count) => {
                log::info!("wrote {count} output chunks");
                Ok(count)
            }
            Err(e) => {
                self.preserve_temp_files = true;
                Err(e)
            }
        }
    }

    /// The produce pass proper
    fn write_chunks(&mut self) -> Result<usize, Error> {
        let stats = write::statistics(&self.clumps, self.config.prune_threshold);
        log::info!(
            "writing {} chunks: keeping {} components, {} vertices, {} triangles (threshold {} vertices)",
            self.chunks.len(),
            stats.kept_components,
            stats.kept_vertices,
            stats.kept_triangles,
            stats.threshold_vertices,
        );

        let mut vertices_in = TmpReader::<Vertex>::open(&self.tmp_vertices)?;
        let mut triangles_in = TmpReader::<Triangle>::open(&self.tmp_triangles)?;

        let writer = self.writer.take().expect("writer available");
        assert!(
            writer.supports_out_of_order(),
            "the produce pass needs an out-of-order writer"
        );
        let out = AsyncWriter::start(writer);

        let mut pass = Ok(());
        'chunks: for chunk in self.chunks.iter() {
            let plan = ChunkPlan::build(chunk, &mut self.clumps, stats.threshold_vertices);
            log::debug!(
                "chunk {}: {} vertices, {} triangles",
                chunk.chunk_id,
                plan.num_vertices,
                plan.num_triangles
            );
            out.submit(WriteJob::Open {
                path: self.namer.name(&chunk.chunk_id),
                num_vertices: plan.num_vertices,
                num_triangles: plan.num_triangles,
            });

            for (i, record) in chunk.clumps.iter().enumerate() {
                if plan.is_pruned(i) {
                    continue;
                }
                let total = record.num_vertices();
                let mut done = 0u64;
                while done < total {
                    let batch = (total - done).min(VERTEX_BATCH as u64) as usize;
                    let mut data = out.vertex_buffer();
                    data.resize(batch, Vertex::default());
                    if let Err(e) = vertices_in.read_at(record.first_vertex + done, &mut data) {
                        pass = Err(e);
                        break 'chunks;
                    }
                    out.submit(WriteJob::Vertices {
                        offset: plan.start_vertex[i] as u64 + done,
                        data,
                    });
                    done += batch as u64;
                }
            }

            for (i, record) in chunk.clumps.iter().enumerate() {
                if plan.is_pruned(i) {
                    continue;
                }
                let base = plan.start_vertex[i];
                let total = record.num_triangles as u64;
                let mut done = 0u64;
                while done < total {
                    let batch = (total - done).min(TRIANGLE_BATCH as u64) as usize;
                    let mut data = out.triangle_buffer();
                    data.resize(batch, Triangle::default());
                    if let Err(e) = triangles_in.read_at(record.first_triangle + done, &mut data) {
                        pass = Err(e);
                        break 'chunks;
                    }
                    for triangle in &mut data {
                        for index in &mut triangle.0 {
                            *index = if *index < EXTERNAL_BIT {
                                base + *index
                            } else {
                                let remapped = plan.external_remap[!*index as usize];
                                debug_assert_ne!(
                                    remapped,
                                    write::PRUNED,
                                    "kept triangle references a pruned external vertex"
                                );
                                remapped
                            };
                        }
                    }
                    out.submit(WriteJob::Triangles {
                        offset: plan.start_triangle[i] + done,
                        data,
                    });
                    done += batch as u64;
                }
            }

            out.submit(WriteJob::Close);
        }

        let (writer, wrote) = out.finish();
        self.writer = Some(writer);
        pass?;
        wrote?;
        Ok(self.chunks.len())
    }
}

impl Drop for Mesher {
    fn drop(&mut self) {
        // Join the temp writer before touching its files
        self.tmp_writer = None;
        if !self.preserve_temp_files {
            remove_scratch(&self.tmp_vertices);
            remove_scratch(&self.tmp_triangles);
        }
    }
}

fn remove_scratch(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            log::warn!("could not remove scratch file {}: {e}", path.display());
        }
    }
}

/// Appends `[first, first + len)` to `ranges`, coalescing with the previous
/// range when adjacent
fn push_range(ranges: &mut Vec<Range<usize>>, first: usize, len: usize) {
    if len == 0 {
        return;
    }
    if let Some(prev) = ranges.last_mut() {
        debug_assert!(prev.end <= first, "scatter ranges must advance");
        if prev.end == first {
            prev.end = first + len;
            return;
        }
    }
    ranges.push(first..first + len);
}
