//! Relocation of backing storage
//!
//! The compacting allocator calls [`Abd::try_move`] out-of-band when it
//! wants to empty a slab that still holds live allocations. Relocation
//! swaps the backing storage for freshly allocated storage of the same
//! shape; layout, size and contents never change, only the identity of
//! the memory. `false` is a soft failure: the handle is pinned or has
//! live children, and the allocator skips the slot and retries later.

use super::handle::{Abd, AbdFlags, AbdStorage, LinearBuf};
use crate::stats::AbdStats;
use std::mem;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tracing::debug;

impl Abd {
    /// Attempt to rehome this handle's backing storage. Returns whether
    /// the move happened.
    pub fn try_move(&self) -> bool {
        let mut st = self.state.lock().unwrap();
        self.verify(&st);

        if st.flags.contains(AbdFlags::NOMOVE) {
            AbdStats::bump(&self.ctx.stats.move_to_buf_flag_fail);
            // A pin this early means a consumer pinned the handle right
            // after creating it, which the allocator should never see.
            #[cfg(debug_assertions)]
            assert!(
                st.create_time.elapsed() >= self.ctx.config.move_grace,
                "relocation hit a pin on a freshly created handle"
            );
            debug!(size = self.size, "relocation refused: handle pinned");
            return false;
        }
        if self.children.load(Ordering::Relaxed) != 0 {
            AbdStats::bump(&self.ctx.stats.move_refcount_nonzero);
            debug!(size = self.size, "relocation refused: live children");
            return false;
        }

        let is_metadata = st.flags.contains(AbdFlags::META);
        match &mut st.storage {
            AbdStorage::Scatter(s) => {
                assert_eq!(
                    s.chunk_size,
                    self.ctx.chunk_size(),
                    "chunk size changed under a live scattered handle"
                );
                for chunk in s.chunks.iter_mut() {
                    let mut fresh = self.ctx.chunks.alloc_chunk();
                    fresh.bytes_mut().copy_from_slice(chunk.bytes());
                    let old = mem::replace(chunk, fresh);
                    // Straight back to the slab: caching the old chunk in
                    // the magazine would keep the memory the compaction
                    // pass is trying to release.
                    self.ctx.chunks.free_chunk_to_slab(old);
                }
                if is_metadata {
                    AbdStats::bump(&self.ctx.stats.moved_scattered_metadata);
                } else {
                    AbdStats::bump(&self.ctx.stats.moved_scattered_filedata);
                }
            }
            AbdStorage::Linear(lb) => {
                let mut fresh = if is_metadata {
                    self.ctx.bufs.meta_buf_alloc(self.size)
                } else {
                    self.ctx.bufs.data_buf_alloc(self.size)
                };
                fresh.bytes_mut().copy_from_slice(lb.bytes());
                match mem::replace(lb, LinearBuf::Pooled(fresh)) {
                    LinearBuf::Pooled(old) => self.ctx.bufs.free(old),
                    // External buffers are created pinned and stay pinned.
                    LinearBuf::External(_) => unreachable!("external buffer without a pin"),
                }
                AbdStats::bump(&self.ctx.stats.moved_linear);
            }
            AbdStorage::View | AbdStorage::Dead => {
                unreachable!("movable handle without storage")
            }
        }

        st.create_time = Instant::now();
        self.verify(&st);
        debug!(size = self.size, "relocated handle");
        true
    }
}
