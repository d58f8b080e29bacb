//! Out-of-core assembly of huge triangle meshes from streamed isosurface
//! fragments.
//!
//! An isosurface extractor working block by block over a sampling grid
//! produces *fragments*: small batches of vertices and triangles whose
//! boundary vertices carry 64-bit keys identifying them across fragments.
//! The [`Mesher`] welds those shared vertices, tracks connected components
//! incrementally, spills all geometry to scratch files, and finally rewrites
//! it into binary triangle-soup files — one per spatial *chunk* — while
//! pruning components smaller than a configurable fraction of the mesh.
//! Memory use is bounded by the component and key tables, not by the mesh
//! itself, so outputs far larger than RAM are fine.
//!
//! ```
//! use nalgebra::Vector3;
//! use oocmesh::{ChunkId, ChunkNamer, Config, Mesher, MeshFragment, PlyWriter};
//!
//! let dir = tempfile::tempdir()?;
//! let base = dir.path().join("mesh").display().to_string();
//! let mut mesher = Mesher::new(PlyWriter::new(), ChunkNamer::new(base), Config::default())?;
//!
//! // One fragment: a single triangle with no shared vertices
//! let vertices = [
//!     Vector3::new(0.0, 0.0, 0.0),
//!     Vector3::new(1.0, 0.0, 0.0),
//!     Vector3::new(0.0, 1.0, 0.0),
//! ];
//! mesher.add(&MeshFragment {
//!     chunk_id: ChunkId::default(),
//!     vertices: &vertices,
//!     vertex_keys: &[],
//!     triangles: &[[0, 1, 2]],
//!     num_internal: 3,
//! })?;
//!
//! assert_eq!(mesher.write()?, 1); // one chunk: mesh_0000_0000_0000.ply
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! The producer side is a plain `&mut` method call, so invocations are
//! serialized by construction; fragments must arrive with chunk generations
//! in ascending order. For very long runs, [`Mesher::checkpoint`] persists
//! the tables after ingest so a separate process can finish the write with
//! [`Mesher::resume`].

mod async_writer;
mod chunk;
mod error;
mod fragment;
mod mesher;
mod union_find;
mod writer;

pub use chunk::{ChunkId, ChunkNamer, Namer, TrivialNamer};
pub use error::Error;
pub use fragment::MeshFragment;
pub use mesher::{Config, Mesher};
pub use writer::{MeshWriter, PlyWriter, Triangle, Vertex};
