//! Asynchronous, out-of-order writes to the current output file
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use crate::writer::{MeshWriter, Triangle, Vertex};
use crate::Error;

/// Payload buffers circulating per record type; together with the job queue
/// depth this bounds the bytes in flight.
const IN_FLIGHT: usize = 4;

/// One unit of work for the output-writer thread
pub(crate) enum WriteJob {
    /// Declare counts and create the next output file
    Open {
        path: PathBuf,
        num_vertices: u64,
        num_triangles: u64,
    },
    /// Write `data` starting at vertex record `offset`
    Vertices { offset: u64, data: Vec<Vertex> },
    /// Write `data` starting at triangle record `offset`
    Triangles { offset: u64, data: Vec<Triangle> },
    /// Flush and close the current output file
    Close,
}

/// Runs the downstream writer on a dedicated thread so temp-file reads
/// overlap output writes
///
/// Jobs are executed strictly in submission order. Payload buffers are
/// recycled through bounded return channels, which doubles as backpressure:
/// [`vertex_buffer`](AsyncWriter::vertex_buffer) blocks while every buffer
/// is in flight. The first writer error is latched; later jobs are drained
/// without touching the file and the error surfaces from
/// [`finish`](AsyncWriter::finish).
pub(crate) struct AsyncWriter {
    jobs: Option<mpsc::SyncSender<WriteJob>>,
    vertex_buffers: mpsc::Receiver<Vec<Vertex>>,
    triangle_buffers: mpsc::Receiver<Vec<Triangle>>,
    worker: Option<JoinHandle<(Box<dyn MeshWriter + Send>, Result<(), Error>)>>,
}

impl AsyncWriter {
    pub fn start(mut writer: Box<dyn MeshWriter + Send>) -> Self {
        let (job_tx, job_rx) = mpsc::sync_channel::<WriteJob>(IN_FLIGHT * 2);
        let (vertex_tx, vertex_rx) = mpsc::channel::<Vec<Vertex>>();
        let (triangle_tx, triangle_rx) = mpsc::channel::<Vec<Triangle>>();
        for _ in 0..IN_FLIGHT {
            vertex_tx.send(Vec::new()).unwrap();
            triangle_tx.send(Vec::new()).unwrap();
        }

        let worker = thread::Builder::new()
            .name("output-writer".to_owned())
            .spawn(move || {
                let mut failed: Option<Error> = None;
                for job in job_rx {
                    let result = if failed.is_none() {
                        run(writer.as_mut(), &job)
                    } else {
                        Ok(())
                    };
                    // Buffers go back to the producer even after a failure,
                    // otherwise the producer side would block forever.
                    match job {
                        WriteJob::Vertices { data, .. } => {
                            let _ = vertex_tx.send(data);
                        }
                        WriteJob::Triangles { data, .. } => {
                            let _ = triangle_tx.send(data);
                        }
                        WriteJob::Open { .. } | WriteJob::Close => (),
                    }
                    if let Err(e) = result {
                        log::error!("output write failed: {e}");
                        failed = Some(e);
                    }
                }
                let result = match failed {
                    Some(e) => Err(e),
                    None => Ok(()),
                };
                (writer, result)
            })
            .expect("spawn output writer thread");

        Self {
            jobs: Some(job_tx),
            vertex_buffers: vertex_rx,
            triangle_buffers: triangle_rx,
            worker: Some(worker),
        }
    }

    /// Takes a recycled vertex payload buffer, blocking while all are in
    /// flight
    pub fn vertex_buffer(&self) -> Vec<Vertex> {
        let mut buf = self
            .vertex_buffers
            .recv()
            .expect("output writer thread is alive");
        buf.clear();
        buf
    }

    /// Takes a recycled triangle payload buffer
    pub fn triangle_buffer(&self) -> Vec<Triangle> {
        let mut buf = self
            .triangle_buffers
            .recv()
            .expect("output writer thread is alive");
        buf.clear();
        buf
    }

    pub fn submit(&self, job: WriteJob) {
        self.jobs
            .as_ref()
            .expect("writer not finished")
            .send(job)
            .expect("output writer thread is alive");
    }

    /// Drains the queue and returns the writer plus the first error, if any
    pub fn finish(mut self) -> (Box<dyn MeshWriter + Send>, Result<(), Error>) {
        self.jobs.take();
        self.worker
            .take()
            .expect("finish called once")
            .join()
            .expect("output writer thread panicked")
    }
}

fn run(writer: &mut dyn MeshWriter, job: &WriteJob) -> Result<(), Error> {
    match job {
        WriteJob::Open {
            path,
            num_vertices,
            num_triangles,
        } => {
            writer.set_vertex_count(*num_vertices);
            writer.set_triangle_count(*num_triangles);
            writer.open(path)
        }
        WriteJob::Vertices { offset, data } => writer.write_vertices(*offset, data),
        WriteJob::Triangles { offset, data } => writer.write_triangles(*offset, data),
        WriteJob::Close => writer.close(),
    }
}
