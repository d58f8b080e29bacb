//! Checkpointing the finalized mesher tables
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::clump::{ChunkTable, ClumpForest};
use super::reorder::BufferPool;
use super::{Config, Mesher, Scratch, REORDER_SLOTS};
use crate::chunk::Namer;
use crate::union_find::Forest;
use crate::writer::{MeshWriter, Triangle, Vertex};
use crate::Error;

const MAGIC: [u8; 8] = *b"OOCMESH\0";
const VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct Header {
    magic: [u8; 8],
    version: u32,
}

/// Everything the produce pass needs, divorced from the ingest state
///
/// Per-chunk key maps and buffered records are deliberately absent: the
/// mesher is finalized before checkpointing, so only committed state
/// matters.
#[derive(Serialize, Deserialize)]
struct Checkpoint {
    clumps: ClumpForest,
    chunks: ChunkTable,
    vertices_path: PathBuf,
    triangles_path: PathBuf,
    written_vertices: u64,
    written_triangles: u64,
}

impl Mesher {
    /// Persists the produce-pass state to `path` instead of writing output
    ///
    /// The scratch files stay on disk and are referenced by the checkpoint;
    /// a later [`resume`](Mesher::resume), typically in a fresh process,
    /// completes the write.
    pub fn checkpoint(mut self, path: &Path) -> Result<(), Error> {
        self.finalize();
        self.preserve_temp_files = true;

        let checkpoint = Checkpoint {
            clumps: std::mem::take(&mut self.clumps),
            chunks: std::mem::take(&mut self.chunks),
            vertices_path: self.tmp_vertices.clone(),
            triangles_path: self.tmp_triangles.clone(),
            written_vertices: self.written_vertices_tmp,
            written_triangles: self.written_triangles_tmp,
        };

        let file = File::create(path).map_err(|e| Error::Checkpoint(e.to_string()))?;
        let mut out = BufWriter::new(file);
        bincode::serialize_into(
            &mut out,
            &Header {
                magic: MAGIC,
                version: VERSION,
            },
        )
        .map_err(|e| Error::Checkpoint(e.to_string()))?;
        bincode::serialize_into(&mut out, &checkpoint)
            .map_err(|e| Error::Checkpoint(e.to_string()))?;
        out.flush().map_err(|e| Error::Checkpoint(e.to_string()))?;
        log::info!("checkpoint written to {}", path.display());
        Ok(())
    }

    /// Reconstitutes a checkpointed mesher and writes the output files
    ///
    /// Returns the number of chunks written, exactly as
    /// [`write`](Mesher::write) would have. The scratch files named by the
    /// checkpoint must still exist and hold at least the recorded geometry;
    /// [`Error::ResumeMismatch`] reports anything missing or short.
    pub fn resume(
        path: &Path,
        writer: impl MeshWriter + Send + 'static,
        namer: impl Namer + 'static,
        config: Config,
    ) -> Result<usize, Error> {
        let file = File::open(path).map_err(|e| Error::Checkpoint(e.to_string()))?;
        let mut input = BufReader::new(file);
        let header: Header = bincode::deserialize_from(&mut input)
            .map_err(|e| Error::Checkpoint(e.to_string()))?;
        if header.magic != MAGIC {
            return Err(Error::Checkpoint("not a mesher checkpoint".to_owned()));
        }
        if header.version != VERSION {
            return Err(Error::Checkpoint(format!(
                "unsupported checkpoint version {}",
                header.version
            )));
        }
        let checkpoint: Checkpoint = bincode::deserialize_from(&mut input)
            .map_err(|e| Error::Checkpoint(e.to_string()))?;

        check_scratch(
            &checkpoint.vertices_path,
            checkpoint.written_vertices,
            std::mem::size_of::<Vertex>() as u64,
        )?;
        check_scratch(
            &checkpoint.triangles_path,
            checkpoint.written_triangles,
            std::mem::size_of::<Triangle>() as u64,
        )?;

        log::info!("resuming from {}", path.display());
        let preserve_temp_files = config.retain_temp_files;
        let pool = Arc::new(BufferPool::new(REORDER_SLOTS * config.reorder_capacity));
        let mesher = Mesher {
            writer: Some(Box::new(writer)),
            namer: Box::new(namer),
            clumps: checkpoint.clumps,
            clump_id_map: Default::default(),
            chunks: checkpoint.chunks,
            pool,
            tmp_writer: None,
            reorder: None,
            tmp_vertices: checkpoint.vertices_path,
            tmp_triangles: checkpoint.triangles_path,
            written_vertices_tmp: checkpoint.written_vertices,
            written_triangles_tmp: checkpoint.written_triangles,
            preserve_temp_files,
            local: Forest::new(),
            scratch: Scratch::default(),
            config,
        };
        mesher.write()
    }
}

fn check_scratch(path: &Path, records: u64, record_size: u64) -> Result<(), Error> {
    let metadata = std::fs::metadata(path).map_err(|_| {
        Error::ResumeMismatch(format!("scratch file {} is missing", path.display()))
    })?;
    let needed = records * record_size;
    if metadata.len() < needed {
        return Err(Error::ResumeMismatch(format!(
            "scratch file {} holds {} bytes but the checkpoint needs {}",
            path.display(),
            metadata.len(),
            needed
        )));
    }
    Ok(())
}
