//! Downstream writer interface and the binary PLY implementation
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::Error;

/// A packed vertex position record: three little-endian `f32`s
#[derive(
    Copy, Clone, Debug, Default, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout,
)]
#[repr(transparent)]
pub struct Vertex(pub [f32; 3]);

/// A packed triangle record: three `u32` vertex indices
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout,
)]
#[repr(transparent)]
pub struct Triangle(pub [u32; 3]);

// The temp-file and output formats both depend on these exact sizes
static_assertions::const_assert_eq!(std::mem::size_of::<Vertex>(), 12);
static_assertions::const_assert_eq!(std::mem::size_of::<Triangle>(), 12);

impl From<nalgebra::Vector3<f32>> for Vertex {
    fn from(v: nalgebra::Vector3<f32>) -> Self {
        Vertex(v.into())
    }
}

/// Sink for finished chunk geometry
///
/// The mesher opens and closes the writer once per output chunk. Counts are
/// declared before [`open`](MeshWriter::open); writes arrive at arbitrary
/// record offsets but never overlap, and every declared record is written
/// exactly once. Offsets are in records, not bytes.
pub trait MeshWriter {
    /// Declares the number of vertices the next file will hold
    fn set_vertex_count(&mut self, n: u64);

    /// Declares the number of triangles the next file will hold
    fn set_triangle_count(&mut self, n: u64);

    /// Creates the output file and writes any header
    fn open(&mut self, path: &Path) -> Result<(), Error>;

    /// Writes `vertices` starting at vertex record `offset`
    fn write_vertices(&mut self, offset: u64, vertices: &[Vertex]) -> Result<(), Error>;

    /// Writes `triangles` starting at triangle record `offset`
    fn write_triangles(&mut self, offset: u64, triangles: &[Triangle]) -> Result<(), Error>;

    /// Flushes and closes the current file
    fn close(&mut self) -> Result<(), Error>;

    /// Whether writes may arrive out of order
    ///
    /// The out-of-core produce pass requires this.
    fn supports_out_of_order(&self) -> bool {
        true
    }
}

const VERTEX_SIZE: u64 = 12;
const FACE_SIZE: u64 = 13;

/// Binary little-endian PLY triangle-soup writer
///
/// Vertices are three `f32`s; faces are a count byte (always 3) followed by
/// three `u32` indices. Both elements have fixed record sizes, so any record
/// offset maps to a file position and out-of-order writes are cheap seeks.
#[derive(Debug, Default)]
pub struct PlyWriter {
    file: Option<File>,
    num_vertices: u64,
    num_triangles: u64,
    vertex_base: u64,
    scratch: Vec<u8>,
}

impl PlyWriter {
    /// Builds a writer with no file open
    pub fn new() -> Self {
        Self::default()
    }

    fn header(&self) -> String {
        format!(
            "ply\n\
             format binary_little_endian 1.0\n\
             element vertex {}\n\
             property float32 x\n\
             property float32 y\n\
             property float32 z\n\
             element face {}\n\
             property list uint8 uint32 vertex_indices\n\
             end_header\n",
            self.num_vertices, self.num_triangles
        )
    }

    fn triangle_base(&self) -> u64 {
        self.vertex_base + self.num_vertices * VERTEX_SIZE
    }
}

impl MeshWriter for PlyWriter {
    fn set_vertex_count(&mut self, n: u64) {
        debug_assert!(self.file.is_none(), "counts must be set before open");
        self.num_vertices = n;
    }

    fn set_triangle_count(&mut self, n: u64) {
        debug_assert!(self.file.is_none(), "counts must be set before open");
        self.num_triangles = n;
    }

    fn open(&mut self, path: &Path) -> Result<(), Error> {
        debug_assert!(self.file.is_none(), "close the previous file first");
        let mut file = File::create(path).map_err(Error::OutputIo)?;
        let header = self.header();
        file.write_all(header.as_bytes()).map_err(Error::OutputIo)?;
        self.vertex_base = header.len() as u64;
        self.file = Some(file);
        Ok(())
    }

    fn write_vertices(&mut self, offset: u64, vertices: &[Vertex]) -> Result<(), Error> {
        debug_assert!(offset + vertices.len() as u64 <= self.num_vertices);
        let pos = self.vertex_base + offset * VERTEX_SIZE;
        let file = self.file.as_mut().expect("writer is open");
        file.seek(SeekFrom::Start(pos)).map_err(Error::OutputIo)?;
        file.write_all(vertices.as_bytes()).map_err(Error::OutputIo)
    }

    fn write_triangles(&mut self, offset: u64, triangles: &[Triangle]) -> Result<(), Error> {
        debug_assert!(offset + triangles.len() as u64 <= self.num_triangles);
        self.scratch.clear();
        self.scratch.reserve(triangles.len() * FACE_SIZE as usize);
        for t in triangles {
            self.scratch.push(3);
            self.scratch.extend_from_slice(t.as_bytes());
        }
        let pos = self.triangle_base() + offset * FACE_SIZE;
        let file = self.file.as_mut().expect("writer is open");
        file.seek(SeekFrom::Start(pos)).map_err(Error::OutputIo)?;
        file.write_all(&self.scratch).map_err(Error::OutputIo)
    }

    fn close(&mut self) -> Result<(), Error> {
        let file = self.file.take().expect("writer is open");
        file.sync_all().map_err(Error::OutputIo)
    }
}
