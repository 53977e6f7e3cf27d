//! Fixed-size chunk allocator
//!
//! Scattered handles are built from equal-sized chunks. Freed chunks are
//! cached in a magazine and handed back out before the slab is touched
//! again; the relocation path frees directly to the slab so that a
//! compaction pass actually releases memory instead of refilling the
//! magazine.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::debug;

/// One fixed-size chunk of backing storage
#[derive(Debug)]
pub struct Chunk {
    data: Box<[u8]>,
}

impl Chunk {
    fn new(size: usize) -> Self {
        Self {
            data: vec![0u8; size].into_boxed_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// Pool of fixed-size chunks with a magazine in front of the slab
#[derive(Debug)]
pub struct ChunkPool {
    chunk_size: usize,
    magazine: Mutex<Vec<Chunk>>,
    /// Chunks currently handed out
    in_use: AtomicU64,
}

impl ChunkPool {
    /// Create a pool vending chunks of `chunk_size` bytes
    pub fn new(chunk_size: usize) -> Self {
        assert!(
            chunk_size.is_power_of_two(),
            "chunk size must be a power of two, got {}",
            chunk_size
        );
        Self {
            chunk_size,
            magazine: Mutex::new(Vec::new()),
            in_use: AtomicU64::new(0),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Allocate one chunk, reusing a magazine entry when available
    pub fn alloc_chunk(&self) -> Chunk {
        self.in_use.fetch_add(1, Ordering::Relaxed);
        if let Some(chunk) = self.magazine.lock().unwrap().pop() {
            return chunk;
        }
        Chunk::new(self.chunk_size)
    }

    /// Return a chunk to the magazine
    pub fn free_chunk(&self, chunk: Chunk) {
        assert_eq!(chunk.len(), self.chunk_size, "foreign chunk returned to pool");
        self.in_use.fetch_sub(1, Ordering::Relaxed);
        self.magazine.lock().unwrap().push(chunk);
    }

    /// Return a chunk directly to the slab, bypassing the magazine
    ///
    /// Used when relocating: caching the old chunk would keep the very
    /// memory the compaction pass is trying to release.
    pub fn free_chunk_to_slab(&self, chunk: Chunk) {
        assert_eq!(chunk.len(), self.chunk_size, "foreign chunk returned to pool");
        self.in_use.fetch_sub(1, Ordering::Relaxed);
        drop(chunk);
    }

    /// Drop every cached chunk in the magazine
    ///
    /// Operator-invoked periodic drain.
    pub fn depot_working_set_zero(&self) {
        let drained = {
            let mut magazine = self.magazine.lock().unwrap();
            let n = magazine.len();
            magazine.clear();
            n
        };
        debug!(drained, "drained chunk magazine");
    }

    /// Number of chunks cached in the magazine
    pub fn magazine_len(&self) -> usize {
        self.magazine.lock().unwrap().len()
    }

    /// Number of chunks currently handed out
    pub fn in_use(&self) -> u64 {
        self.in_use.load(Ordering::Relaxed)
    }
}
