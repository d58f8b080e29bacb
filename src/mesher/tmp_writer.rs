//! Asynchronous writer for the two temporary geometry files
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use zerocopy::IntoBytes;

use crate::mesher::reorder::{BufferPool, ReorderBuffer};
use crate::Error;

/// Writes submitted reorder buffers to the scratch files in FIFO order
///
/// A single consumer thread owns both file handles; vertices and triangles
/// go to separate append-only files. A failed scratch write aborts the
/// process: the fragment stream cannot be replayed, so the mesh cannot be
/// completed without its intermediate geometry.
pub(crate) struct TmpWriter {
    tx: Option<mpsc::Sender<ReorderBuffer>>,
    worker: Option<JoinHandle<()>>,
    vertices_path: PathBuf,
    triangles_path: PathBuf,
}

impl TmpWriter {
    /// Creates the scratch files and starts the consumer thread
    pub fn start(scratch_dir: &Path, pool: Arc<BufferPool>) -> Result<Self, Error> {
        let (vertices_path, vertices_file) = create_scratch(scratch_dir, "vertices")?;
        let (triangles_path, triangles_file) = create_scratch(scratch_dir, "triangles")?;
        log::debug!(
            "scratch files: {} / {}",
            vertices_path.display(),
            triangles_path.display()
        );

        let (tx, rx) = mpsc::channel::<ReorderBuffer>();
        let worker = thread::Builder::new()
            .name("tmp-writer".to_owned())
            .spawn(move || {
                let mut vertices_file = vertices_file;
                let mut triangles_file = triangles_file;
                for buf in rx {
                    for range in &buf.vertex_ranges {
                        write_or_die(&mut vertices_file, buf.vertices[range.clone()].as_bytes());
                    }
                    for range in &buf.triangle_ranges {
                        write_or_die(&mut triangles_file, buf.triangles[range.clone()].as_bytes());
                    }
                    pool.release(buf);
                }
            })
            .expect("spawn tmp writer thread");

        Ok(Self {
            tx: Some(tx),
            worker: Some(worker),
            vertices_path,
            triangles_path,
        })
    }

    /// Enqueues a buffer; the pool gets it back once it hits the disk
    pub fn submit(&self, buf: ReorderBuffer) {
        self.tx
            .as_ref()
            .expect("tmp writer running")
            .send(buf)
            .expect("tmp writer thread is alive");
    }

    /// Drains the queue, joins the thread, and closes both files
    pub fn stop(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            worker.join().expect("tmp writer thread panicked");
        }
    }

    pub fn vertices_path(&self) -> &Path {
        &self.vertices_path
    }

    pub fn triangles_path(&self) -> &Path {
        &self.triangles_path
    }
}

impl Drop for TmpWriter {
    fn drop(&mut self) {
        self.stop();
    }
}

fn create_scratch(dir: &Path, kind: &str) -> Result<(PathBuf, File), Error> {
    let file = tempfile::Builder::new()
        .prefix(&format!("mesher-{kind}-"))
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(Error::TempIo)?;
    // The mesher manages the file's lifetime from here on
    let (file, path) = file.keep().map_err(|e| Error::TempIo(e.error))?;
    Ok((path, file))
}

fn write_or_die(file: &mut File, bytes: &[u8]) {
    if let Err(e) = file.write_all(bytes) {
        log::error!("scratch file write failed, cannot continue: {e}");
        std::process::abort();
    }
}
