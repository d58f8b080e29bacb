//! End-to-end tests: scenario meshes, welding, pruning, determinism and
//! checkpoint round-trips.
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use nalgebra::Vector3;
use oocmesh::{
    ChunkId, ChunkNamer, Config, Error, MeshFragment, MeshWriter, Mesher, PlyWriter, Triangle,
    Vertex,
};

/// One closed output file captured by [`MemWriter`]
#[derive(Clone, Debug, Default)]
struct OutChunk {
    path: PathBuf,
    declared_vertices: u64,
    declared_triangles: u64,
    vertices: Vec<Vertex>,
    triangles: Vec<Triangle>,
}

impl OutChunk {
    fn vertex_xs(&self) -> Vec<f32> {
        self.vertices.iter().map(|v| v.0[0]).collect()
    }

    /// Every declared record must have been written exactly once
    fn assert_complete(&self) {
        assert_eq!(self.vertices.len() as u64, self.declared_vertices);
        assert_eq!(self.triangles.len() as u64, self.declared_triangles);
        for v in &self.vertices {
            assert!(!v.0[0].is_nan(), "vertex slot never written in {self:?}");
        }
        for t in &self.triangles {
            assert_ne!(t.0, [u32::MAX; 3], "triangle slot never written");
            for &i in &t.0 {
                assert!((i as u64) < self.declared_vertices, "index out of range");
            }
        }
    }
}

/// In-memory capturing writer; chunks surface through a shared sink so they
/// outlive the mesher that consumed the writer
#[derive(Default)]
struct MemWriter {
    sink: Arc<Mutex<Vec<OutChunk>>>,
    current: Option<OutChunk>,
    num_vertices: u64,
    num_triangles: u64,
}

impl MeshWriter for MemWriter {
    fn set_vertex_count(&mut self, n: u64) {
        self.num_vertices = n;
    }

    fn set_triangle_count(&mut self, n: u64) {
        self.num_triangles = n;
    }

    fn open(&mut self, path: &Path) -> Result<(), Error> {
        self.current = Some(OutChunk {
            path: path.to_owned(),
            declared_vertices: self.num_vertices,
            declared_triangles: self.num_triangles,
            vertices: vec![Vertex([f32::NAN; 3]); self.num_vertices as usize],
            triangles: vec![Triangle([u32::MAX; 3]); self.num_triangles as usize],
        });
        Ok(())
    }

    fn write_vertices(&mut self, offset: u64, vertices: &[Vertex]) -> Result<(), Error> {
        let chunk = self.current.as_mut().unwrap();
        chunk.vertices[offset as usize..offset as usize + vertices.len()]
            .copy_from_slice(vertices);
        Ok(())
    }

    fn write_triangles(&mut self, offset: u64, triangles: &[Triangle]) -> Result<(), Error> {
        let chunk = self.current.as_mut().unwrap();
        chunk.triangles[offset as usize..offset as usize + triangles.len()]
            .copy_from_slice(triangles);
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        self.sink.lock().unwrap().push(self.current.take().unwrap());
        Ok(())
    }
}

fn mem_mesher(config: Config) -> (Mesher, Arc<Mutex<Vec<OutChunk>>>) {
    let sink = Arc::new(Mutex::new(Vec::new()));
    let writer = MemWriter {
        sink: sink.clone(),
        ..MemWriter::default()
    };
    let mesher = Mesher::new(writer, ChunkNamer::new("mesh"), config).unwrap();
    (mesher, sink)
}

fn v(x: f32) -> Vector3<f32> {
    Vector3::new(x, 0.0, 0.0)
}

/// Prune fraction that resolves to an integer threshold of `k` vertices
fn fraction_for(k: u64, total: u64) -> f64 {
    ((k as f64 + 0.25) / total as f64).min(1.0)
}

////////////////////////////////////////////////////////////////////////////////
// Scenarios

#[test]
fn s1_single_triangle() {
    let (mut mesher, sink) = mem_mesher(Config::default());
    let vertices = [
        Vector3::new(0.0, 0.0, 0.0),
        Vector3::new(1.0, 0.0, 0.0),
        Vector3::new(0.0, 1.0, 0.0),
    ];
    mesher
        .add(&MeshFragment {
            chunk_id: ChunkId::default(),
            vertices: &vertices,
            vertex_keys: &[],
            triangles: &[[0, 1, 2]],
            num_internal: 3,
        })
        .unwrap();
    assert_eq!(mesher.write().unwrap(), 1);

    let chunks = sink.lock().unwrap();
    assert_eq!(chunks.len(), 1);
    chunks[0].assert_complete();
    assert_eq!(chunks[0].vertices.len(), 3);
    assert_eq!(chunks[0].vertices[0], Vertex([0.0, 0.0, 0.0]));
    assert_eq!(chunks[0].vertices[2], Vertex([0.0, 1.0, 0.0]));
    assert_eq!(chunks[0].triangles, vec![Triangle([0, 1, 2])]);
}

/// Feeds the two-fragment shared-edge mesh: fragment A carries internal
/// vertices `0..=2` (of which vertex 2 is isolated) and externals with keys
/// 103/104; fragment B welds onto both keys.
fn ingest_shared_edge(mesher: &mut Mesher) {
    let chunk = ChunkId::default();
    let a = [v(0.0), v(1.0), v(2.0), v(3.0), v(4.0)];
    mesher
        .add(&MeshFragment {
            chunk_id: chunk,
            vertices: &a,
            vertex_keys: &[103, 104],
            triangles: &[[0, 1, 3], [1, 3, 4]],
            num_internal: 3,
        })
        .unwrap();
    let b = [v(10.0), v(3.0), v(4.0)];
    mesher
        .add(&MeshFragment {
            chunk_id: chunk,
            vertices: &b,
            vertex_keys: &[103, 104],
            triangles: &[[0, 1, 2]],
            num_internal: 1,
        })
        .unwrap();
}

#[test]
fn s2_shared_edge_welds() {
    let (mut mesher, sink) = mem_mesher(Config::default());
    ingest_shared_edge(&mut mesher);
    assert_eq!(mesher.write().unwrap(), 1);

    let chunks = sink.lock().unwrap();
    let out = &chunks[0];
    out.assert_complete();
    // Six unique vertices: the welded externals appear once, with fragment
    // A's coordinates
    assert_eq!(out.vertex_xs(), vec![0.0, 1.0, 3.0, 4.0, 2.0, 10.0]);
    assert_eq!(
        out.triangles,
        vec![
            Triangle([0, 1, 2]),
            Triangle([1, 2, 3]),
            Triangle([5, 2, 3]),
        ]
    );
}

#[test]
fn s2_weld_joins_components_across_fragments() {
    // The welded component has 5 vertices, the isolated vertex 1; pruning
    // at two vertices must drop exactly the singleton.
    let config = Config {
        prune_threshold: fraction_for(2, 6),
        ..Config::default()
    };
    let (mut mesher, sink) = mem_mesher(config);
    ingest_shared_edge(&mut mesher);
    mesher.write().unwrap();

    let chunks = sink.lock().unwrap();
    let out = &chunks[0];
    out.assert_complete();
    assert_eq!(out.vertex_xs(), vec![0.0, 1.0, 3.0, 4.0, 10.0]);
    assert_eq!(out.triangles.len(), 3);
}

#[test]
fn s3_two_chunks_two_files() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("base").display().to_string();
    let mut mesher =
        Mesher::new(PlyWriter::new(), ChunkNamer::new(base), Config::default()).unwrap();

    let a = [v(0.0), v(1.0), v(2.0)];
    mesher
        .add(&MeshFragment {
            chunk_id: ChunkId::new(0, [0, 0, 0]),
            vertices: &a,
            vertex_keys: &[],
            triangles: &[[0, 1, 2]],
            num_internal: 3,
        })
        .unwrap();
    let b = [v(5.0), v(6.0), v(7.0)];
    mesher
        .add(&MeshFragment {
            chunk_id: ChunkId::new(1, [1, 0, 0]),
            vertices: &b,
            vertex_keys: &[],
            triangles: &[[0, 1, 2]],
            num_internal: 3,
        })
        .unwrap();
    assert_eq!(mesher.write().unwrap(), 2);

    let first = std::fs::read(dir.path().join("base_0000_0000_0000.ply")).unwrap();
    let second = std::fs::read(dir.path().join("base_0001_0000_0000.ply")).unwrap();
    for bytes in [&first, &second] {
        let header_end = bytes
            .windows(11)
            .position(|w| w == b"end_header\n")
            .map(|p| p + 11)
            .unwrap();
        let header = std::str::from_utf8(&bytes[..header_end]).unwrap();
        assert!(header.contains("element vertex 3\n"));
        assert!(header.contains("element face 1\n"));
    }
    assert_ne!(first, second, "chunks hold disjoint geometry");
}

#[test]
fn s4_prunes_small_component() {
    // One 100-vertex strip and one 3-vertex triangle; threshold
    // floor(0.05 * 103) = 5 drops the triangle.
    let config = Config {
        prune_threshold: 0.05,
        ..Config::default()
    };
    let (mut mesher, sink) = mem_mesher(config);

    let strip: Vec<_> = (0..100).map(|i| v(i as f32)).collect();
    let strip_triangles: Vec<[u32; 3]> = (0..98).map(|i| [i, i + 1, i + 2]).collect();
    mesher
        .add(&MeshFragment {
            chunk_id: ChunkId::default(),
            vertices: &strip,
            vertex_keys: &[],
            triangles: &strip_triangles,
            num_internal: 100,
        })
        .unwrap();
    let small = [v(1000.0), v(1001.0), v(1002.0)];
    mesher
        .add(&MeshFragment {
            chunk_id: ChunkId::default(),
            vertices: &small,
            vertex_keys: &[],
            triangles: &[[0, 1, 2]],
            num_internal: 3,
        })
        .unwrap();
    mesher.write().unwrap();

    let chunks = sink.lock().unwrap();
    let out = &chunks[0];
    out.assert_complete();
    assert_eq!(out.vertices.len(), 100);
    assert_eq!(out.triangles.len(), 98);
    assert!(out.vertex_xs().iter().all(|&x| x < 1000.0));
}

#[test]
fn s5_generation_gap_yields_empty_chunk() {
    let (mut mesher, sink) = mem_mesher(Config::default());
    let a = [v(0.0), v(1.0), v(2.0)];
    mesher
        .add(&MeshFragment {
            chunk_id: ChunkId::new(0, [1, 0, 0]),
            vertices: &a,
            vertex_keys: &[],
            triangles: &[[0, 1, 2]],
            num_internal: 3,
        })
        .unwrap();
    let b = [v(5.0), v(6.0), v(7.0)];
    mesher
        .add(&MeshFragment {
            chunk_id: ChunkId::new(2, [3, 0, 0]),
            vertices: &b,
            vertex_keys: &[],
            triangles: &[[0, 1, 2]],
            num_internal: 3,
        })
        .unwrap();
    assert_eq!(mesher.write().unwrap(), 3);

    let chunks = sink.lock().unwrap();
    assert_eq!(chunks.len(), 3);
    assert_eq!(chunks[0].path, PathBuf::from("mesh_0001_0000_0000.ply"));
    assert_eq!(chunks[1].path, PathBuf::from("mesh_0000_0000_0000.ply"));
    assert_eq!(chunks[2].path, PathBuf::from("mesh_0003_0000_0000.ply"));
    assert_eq!(chunks[1].declared_vertices, 0);
    assert_eq!(chunks[1].declared_triangles, 0);
    assert_eq!(chunks[0].declared_vertices, 3);
    assert_eq!(chunks[2].declared_vertices, 3);
}

fn output_file(dir: &Path) -> Vec<u8> {
    std::fs::read(dir.join("base_0000_0000_0000.ply")).unwrap()
}

fn direct_run(dir: &Path) -> Vec<u8> {
    let base = dir.join("base").display().to_string();
    let mut mesher =
        Mesher::new(PlyWriter::new(), ChunkNamer::new(base), Config::default()).unwrap();
    ingest_shared_edge(&mut mesher);
    assert_eq!(mesher.write().unwrap(), 1);
    output_file(dir)
}

#[test]
fn s6_checkpoint_resume_round_trip() {
    let direct_dir = tempfile::tempdir().unwrap();
    let direct = direct_run(direct_dir.path());

    let resumed_dir = tempfile::tempdir().unwrap();
    let ckpt = resumed_dir.path().join("mesher.ckpt");
    {
        let base = resumed_dir.path().join("base").display().to_string();
        let mut mesher =
            Mesher::new(PlyWriter::new(), ChunkNamer::new(base), Config::default()).unwrap();
        ingest_shared_edge(&mut mesher);
        mesher.checkpoint(&ckpt).unwrap();
    }
    // A fresh writer and namer, as a separate process would build them
    let base = resumed_dir.path().join("base").display().to_string();
    let written = Mesher::resume(
        &ckpt,
        PlyWriter::new(),
        ChunkNamer::new(base),
        Config::default(),
    )
    .unwrap();
    assert_eq!(written, 1);

    assert_eq!(direct, output_file(resumed_dir.path()));
}

#[test]
fn resume_detects_missing_scratch_files() {
    let dir = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let ckpt = dir.path().join("mesher.ckpt");
    {
        let base = dir.path().join("base").display().to_string();
        let config = Config {
            scratch_dir: Some(scratch.path().to_owned()),
            ..Config::default()
        };
        let mut mesher = Mesher::new(PlyWriter::new(), ChunkNamer::new(base), config).unwrap();
        ingest_shared_edge(&mut mesher);
        mesher.checkpoint(&ckpt).unwrap();
    }
    for entry in std::fs::read_dir(scratch.path()).unwrap() {
        std::fs::remove_file(entry.unwrap().path()).unwrap();
    }
    let base = dir.path().join("base").display().to_string();
    let err = Mesher::resume(
        &ckpt,
        PlyWriter::new(),
        ChunkNamer::new(base),
        Config::default(),
    )
    .unwrap_err();
    assert!(matches!(err, Error::ResumeMismatch(_)));
}

#[test]
fn deterministic_output_bytes() {
    let first = tempfile::tempdir().unwrap();
    let second = tempfile::tempdir().unwrap();
    assert_eq!(direct_run(first.path()), direct_run(second.path()));
}

////////////////////////////////////////////////////////////////////////////////
// Randomized properties

mod reference {
    //! A straightforward welded-components oracle

    /// Union-find with none of the production niceties
    pub struct Components {
        parent: Vec<usize>,
    }

    impl Components {
        pub fn new(n: usize) -> Self {
            Self {
                parent: (0..n).collect(),
            }
        }

        pub fn find(&mut self, mut x: usize) -> usize {
            while self.parent[x] != x {
                self.parent[x] = self.parent[self.parent[x]];
                x = self.parent[x];
            }
            x
        }

        pub fn union(&mut self, a: usize, b: usize) {
            let ra = self.find(a);
            let rb = self.find(b);
            if ra != rb {
                self.parent[ra.max(rb)] = ra.min(rb);
            }
        }
    }
}

/// A multi-fragment scene over one chunk plus its reference decomposition
struct Scene {
    fragments: Vec<(Vec<nalgebra::Vector3<f32>>, Vec<u64>, Vec<[u32; 3]>, usize)>,
    /// (vertex count, triangle count) per welded component
    component_sizes: Vec<(u64, u64)>,
    /// Positions of all unique vertices
    unique_positions: Vec<[f32; 3]>,
    /// Input triangles as coordinate triples
    triangle_coords: Vec<[[f32; 3]; 3]>,
}

fn internal_position(fragment: usize, index: usize) -> nalgebra::Vector3<f32> {
    Vector3::new((fragment * 10_000 + index) as f32, 2.0, 0.0)
}

fn external_position(key: u64) -> nalgebra::Vector3<f32> {
    Vector3::new(key as f32, 1.0, 0.0)
}

fn random_scene(seed: u64) -> Scene {
    use rand::prelude::*;
    let mut rng = StdRng::seed_from_u64(seed);

    const KEY_POOL: u64 = 30;
    let num_fragments = rng.gen_range(2..=5);

    // Global ids: externals get 0..KEY_POOL, internals are appended
    let mut ids_in_use: Vec<bool> = vec![false; KEY_POOL as usize];
    let mut id_positions: Vec<[f32; 3]> =
        (0..KEY_POOL).map(|k| external_position(k).into()).collect();
    let mut fragments = Vec::new();
    let mut fragment_ids: Vec<Vec<usize>> = Vec::new();

    for f in 0..num_fragments {
        let num_internal = rng.gen_range(3..=25);
        let mut keys: Vec<u64> = (0..KEY_POOL).collect();
        keys.shuffle(&mut rng);
        keys.truncate(rng.gen_range(0..=8));
        let num_vertices = num_internal + keys.len();

        let mut vertices = Vec::with_capacity(num_vertices);
        let mut ids = Vec::with_capacity(num_vertices);
        for i in 0..num_internal {
            vertices.push(internal_position(f, i));
            ids.push(id_positions.len());
            id_positions.push(internal_position(f, i).into());
        }
        for &k in &keys {
            vertices.push(external_position(k));
            ids.push(k as usize);
            ids_in_use[k as usize] = true;
        }

        let mut triangles = Vec::new();
        for _ in 0..rng.gen_range(0..=50) {
            let mut tri = [0u32; 3];
            let a = rng.gen_range(0..num_vertices);
            let mut b = rng.gen_range(0..num_vertices);
            while b == a {
                b = rng.gen_range(0..num_vertices);
            }
            let mut c = rng.gen_range(0..num_vertices);
            while c == a || c == b {
                c = rng.gen_range(0..num_vertices);
            }
            tri[0] = a as u32;
            tri[1] = b as u32;
            tri[2] = c as u32;
            triangles.push(tri);
        }

        fragments.push((vertices, keys, triangles, num_internal));
        fragment_ids.push(ids);
    }

    // Reference decomposition over global ids
    let mut components = reference::Components::new(id_positions.len());
    for (f, (_, _, triangles, _)) in fragments.iter().enumerate() {
        for t in triangles {
            let ids = &fragment_ids[f];
            components.union(ids[t[0] as usize], ids[t[1] as usize]);
            components.union(ids[t[1] as usize], ids[t[2] as usize]);
        }
    }

    let used = |id: usize| id >= KEY_POOL as usize || ids_in_use[id];
    let mut vertex_counts = vec![0u64; id_positions.len()];
    let mut triangle_counts = vec![0u64; id_positions.len()];
    for id in 0..id_positions.len() {
        if used(id) {
            let root = components.find(id);
            vertex_counts[root] += 1;
        }
    }
    let mut triangle_coords = Vec::new();
    for (f, (vertices, _, triangles, _)) in fragments.iter().enumerate() {
        for t in triangles {
            let root = components.find(fragment_ids[f][t[0] as usize]);
            triangle_counts[root] += 1;
            triangle_coords.push([
                vertices[t[0] as usize].into(),
                vertices[t[1] as usize].into(),
                vertices[t[2] as usize].into(),
            ]);
        }
    }

    let component_sizes = (0..id_positions.len())
        .filter(|&id| components.find(id) == id && vertex_counts[id] > 0)
        .map(|id| (vertex_counts[id], triangle_counts[id]))
        .collect();
    let unique_positions = (0..id_positions.len())
        .filter(|&id| used(id))
        .map(|id| id_positions[id])
        .collect();

    Scene {
        fragments,
        component_sizes,
        unique_positions,
        triangle_coords,
    }
}

fn run_scene(scene: &Scene, prune_threshold: f64) -> OutChunk {
    let config = Config {
        prune_threshold,
        ..Config::default()
    };
    let (mut mesher, sink) = mem_mesher(config);
    for (vertices, keys, triangles, num_internal) in &scene.fragments {
        mesher
            .add(&MeshFragment {
                chunk_id: ChunkId::default(),
                vertices,
                vertex_keys: keys,
                triangles,
                num_internal: *num_internal,
            })
            .unwrap();
    }
    assert_eq!(mesher.write().unwrap(), 1);
    let mut chunks = sink.lock().unwrap();
    let out = chunks.pop().unwrap();
    out.assert_complete();
    out
}

fn sort_positions(mut positions: Vec<[f32; 3]>) -> Vec<[f32; 3]> {
    positions.sort_by_key(|p| p.map(f32::to_bits));
    positions
}

#[test]
fn random_scenes_match_reference_components() {
    let _ = env_logger::builder().is_test(true).try_init();
    for seed in 0..8 {
        let scene = random_scene(seed);
        let total: u64 = scene.component_sizes.iter().map(|s| s.0).sum();

        // Unpruned: unique vertices and triangles survive exactly once and
        // reference the same coordinates as the input
        let out = run_scene(&scene, 0.0);
        let got_vertices = sort_positions(out.vertices.iter().map(|v| v.0).collect());
        let want_vertices = sort_positions(scene.unique_positions.clone());
        assert_eq!(got_vertices, want_vertices, "seed {seed}");

        let mut got_triangles: Vec<[[f32; 3]; 3]> = out
            .triangles
            .iter()
            .map(|t| t.0.map(|i| out.vertices[i as usize].0))
            .collect();
        let mut want_triangles = scene.triangle_coords.clone();
        let tri_key = |t: &[[f32; 3]; 3]| t.map(|p| p.map(f32::to_bits));
        got_triangles.sort_by_key(tri_key);
        want_triangles.sort_by_key(tri_key);
        assert_eq!(got_triangles, want_triangles, "seed {seed}");

        // Pruned: component sizes must agree with the reference at every
        // interesting threshold
        let mut thresholds: Vec<u64> = scene.component_sizes.iter().map(|s| s.0).collect();
        if scene.component_sizes.len() > 1 {
            // A fraction of 1.0 caps the threshold at the vertex total, so
            // "drop everything" is only expressible with several components
            thresholds.push(total + 1);
        }
        thresholds.sort_unstable();
        thresholds.dedup();
        for &k in &thresholds {
            let expected_vertices: u64 = scene
                .component_sizes
                .iter()
                .filter(|s| s.0 >= k)
                .map(|s| s.0)
                .sum();
            let expected_triangles: u64 = scene
                .component_sizes
                .iter()
                .filter(|s| s.0 >= k)
                .map(|s| s.1)
                .sum();
            let out = run_scene(&scene, fraction_for(k, total));
            assert_eq!(
                out.vertices.len() as u64, expected_vertices,
                "seed {seed} threshold {k}"
            );
            assert_eq!(
                out.triangles.len() as u64, expected_triangles,
                "seed {seed} threshold {k}"
            );
        }
    }
}

#[test]
fn pruning_is_monotonic() {
    let scene = random_scene(42);
    let total: u64 = scene.component_sizes.iter().map(|s| s.0).sum();
    let mut previous: Option<Vec<[f32; 3]>> = None;
    for k in [0, 2, 5, 9, 14, 20] {
        let out = run_scene(&scene, fraction_for(k, total));
        let kept: Vec<[f32; 3]> = sort_positions(out.vertices.iter().map(|v| v.0).collect());
        if let Some(previous) = &previous {
            let prev: std::collections::HashSet<[u32; 3]> =
                previous.iter().map(|p| p.map(f32::to_bits)).collect();
            for p in &kept {
                assert!(
                    prev.contains(&p.map(f32::to_bits)),
                    "vertex survived a higher threshold but not a lower one"
                );
            }
            assert!(kept.len() <= previous.len());
        }
        previous = Some(kept);
    }
}

#[test]
fn flush_boundaries_do_not_change_output() {
    // Force many small flushes and compare against the default capacity
    let scene = random_scene(7);
    let big = run_scene(&scene, 0.0);

    let config = Config {
        reorder_capacity: 256,
        ..Config::default()
    };
    let sink = Arc::new(Mutex::new(Vec::new()));
    let writer = MemWriter {
        sink: sink.clone(),
        ..MemWriter::default()
    };
    let mut mesher = Mesher::new(writer, ChunkNamer::new("mesh"), config).unwrap();
    for (vertices, keys, triangles, num_internal) in &scene.fragments {
        mesher
            .add(&MeshFragment {
                chunk_id: ChunkId::default(),
                vertices,
                vertex_keys: keys,
                triangles,
                num_internal: *num_internal,
            })
            .unwrap();
    }
    mesher.write().unwrap();
    let small = sink.lock().unwrap().pop().unwrap();

    assert_eq!(big.vertices, small.vertices);
    assert_eq!(big.triangles, small.triangles);
}
