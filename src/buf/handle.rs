//! Handle record and context
//!
//! The handle (`Abd`) is the unit everything else operates on: a size, a
//! flag word, an optional parent link for views, a weighted child
//! refcount, and the mutex-protected storage descriptor. The context
//! (`AbdContext`) owns the two pools and the counter registry so that
//! independent instances never share state.

use crate::config::{AbdConfig, MAX_BLOCK_SIZE};
use crate::error::Result;
use crate::pool::{Chunk, ChunkPool, RawBuf, RawPool};
use crate::stats::{AbdStats, AbdStatsSnapshot};
use bitflags::bitflags;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::info;

/// Sentinel verified on every public operation; cleared when the record
/// is torn down so stale clones fail fast instead of reading poison.
pub(crate) const ABD_MAGIC: u64 = 0x0abd_0abd_0abd_0abd;

bitflags! {
    /// Per-handle flag word
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AbdFlags: u32 {
        /// Bytes occupy one contiguous region
        const LINEAR = 1 << 0;
        /// Handle owns its backing storage
        const OWNER = 1 << 1;
        /// Backing storage holds filesystem metadata (owners only)
        const META = 1 << 2;
        /// Scattered handle smaller than one chunk
        const SMALL = 1 << 3;
        /// Pinned against relocation
        const NOMOVE = 1 << 4;
    }
}

/// Linear backing: pool-owned or supplied by an external caller
#[derive(Debug)]
pub(crate) enum LinearBuf {
    Pooled(RawBuf),
    External(Box<[u8]>),
}

impl LinearBuf {
    pub(crate) fn bytes(&self) -> &[u8] {
        match self {
            LinearBuf::Pooled(raw) => raw.bytes(),
            LinearBuf::External(data) => data,
        }
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        match self {
            LinearBuf::Pooled(raw) => raw.bytes_mut(),
            LinearBuf::External(data) => data,
        }
    }
}

/// Scattered backing: equal-sized chunks plus the offset of byte 0 in the
/// first chunk
#[derive(Debug)]
pub(crate) struct ScatterBuf {
    pub(crate) offset: usize,
    pub(crate) chunk_size: usize,
    pub(crate) chunks: Vec<Chunk>,
}

/// Storage descriptor of one handle
#[derive(Debug)]
pub(crate) enum AbdStorage {
    Linear(LinearBuf),
    Scatter(ScatterBuf),
    /// No storage of its own: bytes resolve through the parent chain to
    /// the root. Views never copy chunk pointers; they alias the root's.
    View,
    /// Torn down. Any subsequent access is a use-after-free.
    Dead,
}

impl AbdStorage {
    /// Length of the physically-contiguous run starting at root-logical
    /// position `at`
    pub(crate) fn contig_run(&self, at: usize, expected_chunk_size: usize) -> usize {
        match self {
            AbdStorage::Linear(lb) => lb.bytes().len() - at,
            AbdStorage::Scatter(s) => {
                assert_eq!(
                    s.chunk_size, expected_chunk_size,
                    "chunk size changed under a live scattered handle"
                );
                s.chunk_size - ((s.offset + at) % s.chunk_size)
            }
            AbdStorage::View | AbdStorage::Dead => {
                panic!("byte access through a handle with no storage")
            }
        }
    }

    /// Borrow `len` bytes at root-logical position `at`; `len` must not
    /// cross a chunk boundary
    pub(crate) fn bytes_at(&self, at: usize, len: usize) -> &[u8] {
        match self {
            AbdStorage::Linear(lb) => &lb.bytes()[at..at + len],
            AbdStorage::Scatter(s) => {
                let index = (s.offset + at) / s.chunk_size;
                let off = (s.offset + at) % s.chunk_size;
                assert!(off + len <= s.chunk_size, "run crosses a chunk boundary");
                &s.chunks[index].bytes()[off..off + len]
            }
            AbdStorage::View | AbdStorage::Dead => {
                panic!("byte access through a handle with no storage")
            }
        }
    }

    /// Mutable variant of [`AbdStorage::bytes_at`]
    pub(crate) fn bytes_at_mut(&mut self, at: usize, len: usize) -> &mut [u8] {
        match self {
            AbdStorage::Linear(lb) => &mut lb.bytes_mut()[at..at + len],
            AbdStorage::Scatter(s) => {
                let index = (s.offset + at) / s.chunk_size;
                let off = (s.offset + at) % s.chunk_size;
                assert!(off + len <= s.chunk_size, "run crosses a chunk boundary");
                &mut s.chunks[index].bytes_mut()[off..off + len]
            }
            AbdStorage::View | AbdStorage::Dead => {
                panic!("byte access through a handle with no storage")
            }
        }
    }
}

/// Mutable fields of a handle, all guarded by the handle's mutex
#[derive(Debug)]
pub(crate) struct AbdState {
    pub(crate) flags: AbdFlags,
    pub(crate) create_time: Instant,
    pub(crate) storage: AbdStorage,
    pub(crate) magic: u64,
}

/// One buffer handle: linear or scattered, root or view
///
/// Handles form a forest: a view points at its source through `parent`
/// and contributes its size to the source's child refcount, which is what
/// blocks `free` and relocation while the view lives. There are no
/// back-edges.
#[derive(Debug)]
pub struct Abd {
    pub(crate) ctx: Arc<AbdContext>,
    pub(crate) size: usize,
    /// Offset of this view within its parent; 0 for roots
    pub(crate) base: usize,
    pub(crate) parent: Option<Arc<Abd>>,
    /// Weighted refcount: each live view contributes its size, each
    /// outstanding borrow contributes its length
    pub(crate) children: AtomicI64,
    pub(crate) state: Mutex<AbdState>,
}

impl Abd {
    /// Bytes exposed by this handle
    pub fn size(&self) -> usize {
        self.size
    }

    /// Snapshot of the flag word
    pub fn flags(&self) -> AbdFlags {
        self.state.lock().unwrap().flags
    }

    pub fn is_linear(&self) -> bool {
        self.flags().contains(AbdFlags::LINEAR)
    }

    pub fn is_metadata(&self) -> bool {
        self.flags().contains(AbdFlags::META)
    }

    pub fn is_owner(&self) -> bool {
        self.flags().contains(AbdFlags::OWNER)
    }

    /// Current weighted child refcount (views plus outstanding borrows)
    pub fn child_refcount(&self) -> u64 {
        self.children.load(Ordering::Relaxed).max(0) as u64
    }

    /// Creation (or last relocation) time
    pub fn create_time(&self) -> Instant {
        self.state.lock().unwrap().create_time
    }

    /// Offset of byte 0 within the first chunk. Scattered handles only.
    pub fn scatter_offset(&self) -> usize {
        let (root, base) = self.resolve();
        let st = root.state.lock().unwrap();
        match &st.storage {
            AbdStorage::Scatter(s) => (s.offset + base) % s.chunk_size,
            _ => panic!("scatter_offset on a linear handle"),
        }
    }

    /// Number of chunks this handle's bytes span. Scattered handles only.
    pub fn chunk_count(&self) -> usize {
        let (root, base) = self.resolve();
        let st = root.state.lock().unwrap();
        match &st.storage {
            AbdStorage::Scatter(s) => {
                let off = (s.offset + base) % s.chunk_size;
                chunkcnt_for_bytes(off + self.size, s.chunk_size)
            }
            _ => panic!("chunk_count on a linear handle"),
        }
    }

    /// Walk the parent chain to the handle that actually holds storage,
    /// accumulating this handle's offset within it
    pub(crate) fn resolve(&self) -> (&Abd, usize) {
        let mut cur = self;
        let mut off = 0;
        while let Some(parent) = cur.parent.as_deref() {
            off += cur.base;
            cur = parent;
        }
        (cur, off)
    }

    /// Assert every record invariant. Fatal on violation: a failure here
    /// is a consumer bug or memory corruption, not a recoverable error.
    pub(crate) fn verify(&self, st: &AbdState) {
        assert_eq!(
            st.magic, ABD_MAGIC,
            "handle magic mismatch (use after free or corruption)"
        );
        assert!(self.size > 0, "zero-sized handle");
        assert!(
            self.size <= MAX_BLOCK_SIZE,
            "handle size {} exceeds maximum block size",
            self.size
        );
        assert!(
            AbdFlags::all().contains(st.flags),
            "unknown bits in flag word"
        );
        if st.flags.contains(AbdFlags::OWNER) {
            assert!(self.parent.is_none(), "owning handle with a parent");
        }
        if self.parent.is_some() {
            assert!(
                !st.flags.contains(AbdFlags::OWNER),
                "view marked as owner"
            );
            assert!(
                matches!(st.storage, AbdStorage::View),
                "view carrying its own storage"
            );
        }
        if st.flags.contains(AbdFlags::META) {
            assert!(
                st.flags.contains(AbdFlags::OWNER),
                "metadata flag on a non-owning handle"
            );
        }
        if st.flags.contains(AbdFlags::SMALL) {
            assert!(
                !st.flags.contains(AbdFlags::LINEAR),
                "small flag on a linear handle"
            );
        }
        match &st.storage {
            AbdStorage::Linear(_) => {
                assert!(
                    st.flags.contains(AbdFlags::LINEAR),
                    "linear storage without linear flag"
                );
            }
            AbdStorage::Scatter(s) => {
                assert!(
                    !st.flags.contains(AbdFlags::LINEAR),
                    "scattered storage with linear flag"
                );
                assert!(s.offset < s.chunk_size, "scatter offset past first chunk");
                assert_eq!(
                    s.chunks.len(),
                    chunkcnt_for_bytes(s.offset + self.size, s.chunk_size),
                    "chunk count does not cover handle size"
                );
                if st.flags.contains(AbdFlags::SMALL) {
                    assert!(self.size < s.chunk_size, "small flag on multi-chunk handle");
                }
                if cfg!(debug_assertions) {
                    for chunk in &s.chunks {
                        assert_eq!(chunk.len(), s.chunk_size, "short chunk in sequence");
                    }
                }
            }
            AbdStorage::View => {
                assert!(self.parent.is_some(), "storageless handle with no parent");
            }
            AbdStorage::Dead => panic!("operation on a freed handle"),
        }
    }
}

/// Owner of the pools, tunables and counters backing a set of handles
#[derive(Debug)]
pub struct AbdContext {
    pub(crate) config: AbdConfig,
    scatter_enabled: AtomicBool,
    pub(crate) chunks: ChunkPool,
    pub(crate) bufs: RawPool,
    pub(crate) stats: AbdStats,
}

impl AbdContext {
    /// Build a context from the given configuration
    pub fn new(config: AbdConfig) -> Result<Arc<Self>> {
        config.validate()?;
        info!(
            chunk_size = config.chunk_size,
            scatter_enabled = config.scatter_enabled,
            "initializing buffer context"
        );
        Ok(Arc::new(Self {
            scatter_enabled: AtomicBool::new(config.scatter_enabled),
            chunks: ChunkPool::new(config.chunk_size),
            bufs: RawPool::new(),
            stats: AbdStats::default(),
            config,
        }))
    }

    /// Build a context with default configuration
    pub fn with_defaults() -> Arc<Self> {
        Self::new(AbdConfig::default()).expect("default configuration is valid")
    }

    /// Fixed chunk size, frozen at construction
    pub fn chunk_size(&self) -> usize {
        self.config.chunk_size
    }

    /// Whether `alloc` currently produces scattered handles
    pub fn scatter_enabled(&self) -> bool {
        self.scatter_enabled.load(Ordering::Relaxed)
    }

    /// Flip the scatter default. Affects future allocations only.
    pub fn set_scatter_enabled(&self, enabled: bool) {
        self.scatter_enabled.store(enabled, Ordering::Relaxed);
    }

    /// Point-in-time counter snapshot
    pub fn stats(&self) -> AbdStatsSnapshot {
        self.stats.snapshot()
    }

    /// Drop every chunk cached in the pool magazine
    pub fn chunk_depot_drain(&self) {
        self.chunks.depot_working_set_zero();
    }
}

/// Chunks needed to hold `size` bytes
pub(crate) fn chunkcnt_for_bytes(size: usize, chunk_size: usize) -> usize {
    size.div_ceil(chunk_size)
}

/// Memory attributed to one handle record in the struct-size counter
pub(crate) fn struct_size_for(chunkcnt: usize) -> i64 {
    (mem::size_of::<Abd>() + chunkcnt * mem::size_of::<Chunk>()) as i64
}

/// Construct a handle record and account its struct size
pub(crate) fn new_handle(
    ctx: &Arc<AbdContext>,
    size: usize,
    base: usize,
    parent: Option<Arc<Abd>>,
    flags: AbdFlags,
    storage: AbdStorage,
) -> Arc<Abd> {
    let chunkcnt = match &storage {
        AbdStorage::Scatter(s) => s.chunks.len(),
        _ => 0,
    };
    AbdStats::add(&ctx.stats.struct_size, struct_size_for(chunkcnt));
    Arc::new(Abd {
        ctx: Arc::clone(ctx),
        size,
        base,
        parent,
        children: AtomicI64::new(0),
        state: Mutex::new(AbdState {
            flags,
            create_time: Instant::now(),
            storage,
            magic: ABD_MAGIC,
        }),
    })
}
