//! Reorder buffers and the bounded pool backing them
use std::ops::Range;
use std::sync::{Condvar, Mutex};

use crate::writer::{Triangle, Vertex};
use crate::Error;

/// Staging area for geometry bound for the temp files
///
/// The ingest path appends vertex and triangle records strictly
/// sequentially; the flusher fills in the scatter ranges, one per contiguous
/// block of promoted clump records, before handing the buffer to the temp
/// writer.
#[derive(Debug, Default)]
pub(crate) struct ReorderBuffer {
    pub vertices: Vec<Vertex>,
    pub triangles: Vec<Triangle>,
    /// `[first, last)` runs of `vertices` to append to the vertex temp file
    pub vertex_ranges: Vec<Range<usize>>,
    /// `[first, last)` runs of `triangles` to append to the triangle temp file
    pub triangle_ranges: Vec<Range<usize>>,
    /// Bytes charged against the pool for this handle
    granted: usize,
}

impl ReorderBuffer {
    /// Bytes of geometry currently staged
    pub fn bytes(&self) -> usize {
        (self.vertices.len() + self.triangles.len()) * std::mem::size_of::<Vertex>()
    }

    fn recycle(&mut self) {
        self.vertices.clear();
        self.triangles.clear();
        self.vertex_ranges.clear();
        self.triangle_ranges.clear();
    }
}

/// Semaphore-bounded allocator for reorder buffers
///
/// `acquire` charges the requested byte count against a fixed budget and
/// blocks until enough of it is free; `release` returns the charge and
/// recycles the buffer's allocations. This is the only place the ingest
/// thread can block, and it is what keeps staging memory bounded when the
/// temp writer falls behind.
#[derive(Debug)]
pub(crate) struct BufferPool {
    total: usize,
    state: Mutex<PoolState>,
    available: Condvar,
}

#[derive(Debug, Default)]
struct PoolState {
    used: usize,
    free: Vec<ReorderBuffer>,
}

impl BufferPool {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            state: Mutex::new(PoolState::default()),
            available: Condvar::new(),
        }
    }

    /// Takes a buffer charged with `bytes`, blocking until the budget allows
    ///
    /// Fails with [`Error::ResourceExhausted`] only if `bytes` exceeds the
    /// whole pool, which no amount of waiting would fix.
    pub fn acquire(&self, bytes: usize) -> Result<ReorderBuffer, Error> {
        if bytes > self.total {
            return Err(Error::ResourceExhausted {
                requested: bytes,
                total: self.total,
            });
        }
        let mut state = self.state.lock().unwrap();
        while state.used + bytes > self.total {
            state = self.available.wait(state).unwrap();
        }
        state.used += bytes;
        let mut buf = state.free.pop().unwrap_or_default();
        buf.recycle();
        buf.granted = bytes;
        Ok(buf)
    }

    /// Returns a buffer's charge to the pool and keeps its allocations for
    /// reuse
    pub fn release(&self, mut buf: ReorderBuffer) {
        let mut state = self.state.lock().unwrap();
        debug_assert!(state.used >= buf.granted);
        state.used -= buf.granted;
        buf.granted = 0;
        state.free.push(buf);
        self.available.notify_all();
    }
}
