//! Allocation, views and destruction
//!
//! Root handles are created through the context (`alloc`, `alloc_linear`,
//! `get_from_buf`), views through `get_offset`/`get_offset_size` on an
//! existing handle. Owning roots are destroyed with `free`, everything
//! else with `put`. Ownership of an externally supplied linear buffer can
//! be transferred in and out after the fact.

use super::handle::{
    chunkcnt_for_bytes, new_handle, struct_size_for, Abd, AbdContext, AbdFlags, AbdStorage,
    LinearBuf, ScatterBuf,
};
use crate::config::MAX_BLOCK_SIZE;
use crate::stats::AbdStats;
use std::mem;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::debug;

impl AbdContext {
    /// Allocate a handle along with its own backing storage. Use this
    /// when the caller does not care whether the handle is linear.
    ///
    /// Scattered unless the scatter default is off, in which case it
    /// degrades to [`AbdContext::alloc_linear`].
    pub fn alloc(self: &Arc<Self>, size: usize, is_metadata: bool) -> Arc<Abd> {
        if !self.scatter_enabled() {
            return self.alloc_linear(size, is_metadata);
        }
        assert!(size > 0, "zero-sized allocation");
        assert!(
            size <= MAX_BLOCK_SIZE,
            "allocation of {} bytes exceeds maximum block size",
            size
        );

        let chunk_size = self.chunk_size();
        let n = chunkcnt_for_bytes(size, chunk_size);
        let mut chunks = Vec::with_capacity(n);
        for _ in 0..n {
            chunks.push(self.chunks.alloc_chunk());
        }

        let mut flags = AbdFlags::OWNER;
        if is_metadata {
            flags |= AbdFlags::META;
        }
        if size < chunk_size {
            flags |= AbdFlags::SMALL;
        }

        let stats = &self.stats;
        AbdStats::bump(&stats.scatter_cnt);
        AbdStats::add(&stats.scatter_data_size, size as i64);
        AbdStats::add(&stats.scatter_chunk_waste, (n * chunk_size - size) as i64);
        if is_metadata {
            AbdStats::add(&stats.metadata_scattered, size as i64);
            AbdStats::bump(&stats.scattered_metadata_cnt);
        } else {
            AbdStats::add(&stats.file_data_scattered, size as i64);
            AbdStats::bump(&stats.scattered_filedata_cnt);
        }
        if size < chunk_size {
            AbdStats::bump(&stats.small_scatter_cnt);
        }

        debug!(size, metadata = is_metadata, chunks = n, "allocated scattered handle");
        new_handle(
            self,
            size,
            0,
            None,
            flags,
            AbdStorage::Scatter(ScatterBuf {
                offset: 0,
                chunk_size,
                chunks,
            }),
        )
    }

    /// Allocate a handle whose bytes must be one contiguous region. Only
    /// use this when a scattered consumer would be very annoying to
    /// write.
    pub fn alloc_linear(self: &Arc<Self>, size: usize, is_metadata: bool) -> Arc<Abd> {
        assert!(size > 0, "zero-sized allocation");
        assert!(
            size <= MAX_BLOCK_SIZE,
            "allocation of {} bytes exceeds maximum block size",
            size
        );

        let raw = if is_metadata {
            self.bufs.meta_buf_alloc(size)
        } else {
            self.bufs.data_buf_alloc(size)
        };

        let mut flags = AbdFlags::LINEAR | AbdFlags::OWNER;
        if is_metadata {
            flags |= AbdFlags::META;
        }

        let stats = &self.stats;
        AbdStats::bump(&stats.linear_cnt);
        AbdStats::add(&stats.linear_data_size, size as i64);
        if is_metadata {
            AbdStats::add(&stats.metadata_linear, size as i64);
        } else {
            AbdStats::add(&stats.file_data_linear, size as i64);
        }

        debug!(size, metadata = is_metadata, "allocated linear handle");
        new_handle(
            self,
            size,
            0,
            None,
            flags,
            AbdStorage::Linear(LinearBuf::Pooled(raw)),
        )
    }

    /// Allocate a handle of the same format (linearity and metadata
    /// setting) as `source`
    pub fn alloc_sametype(self: &Arc<Self>, source: &Abd, size: usize) -> Arc<Abd> {
        let (is_linear, is_metadata) = {
            let st = source.state.lock().unwrap();
            source.verify(&st);
            (
                st.flags.contains(AbdFlags::LINEAR),
                st.flags.contains(AbdFlags::META),
            )
        };
        if is_linear {
            self.alloc_linear(size, is_metadata)
        } else {
            self.alloc(size, is_metadata)
        }
    }

    /// Allocate a handle destined for block-layer I/O
    ///
    /// The consumer does not care about the representation and will not
    /// hold the handle long, so pick whichever type needs the least
    /// copying to issue the I/O. Should the I/O path ever take a
    /// scatter-gather list directly this becomes a plain [`AbdContext::alloc`]
    /// call site; today the two are already the same.
    pub fn alloc_for_io(self: &Arc<Self>, size: usize, is_metadata: bool) -> Arc<Abd> {
        self.alloc(size, is_metadata)
    }

    /// Wrap an externally owned linear buffer. The handle does not own
    /// the storage and must be released with [`Abd::put`] (or promoted
    /// first via [`Abd::take_ownership_of_buf`]).
    pub fn get_from_buf(self: &Arc<Self>, buf: Vec<u8>) -> Arc<Abd> {
        let size = buf.len();
        assert!(size > 0, "zero-sized buffer");
        assert!(
            size <= MAX_BLOCK_SIZE,
            "buffer of {} bytes exceeds maximum block size",
            size
        );

        // Even if the caller's buffer holds filesystem metadata, META is
        // only tracked for storage we own, which is not the case here.
        new_handle(
            self,
            size,
            0,
            None,
            AbdFlags::LINEAR | AbdFlags::NOMOVE,
            AbdStorage::Linear(LinearBuf::External(buf.into_boxed_slice())),
        )
    }
}

fn get_offset_impl(sabd: &Arc<Abd>, off: usize, size: usize) -> Arc<Abd> {
    let mut st = sabd.state.lock().unwrap();
    sabd.verify(&st);
    st.flags.insert(AbdFlags::NOMOVE);
    assert!(off <= sabd.size, "view offset past end of source");

    // A view never carries META (we do not own the bytes) and never
    // OWNER; linearity follows the source.
    let mut flags = AbdFlags::NOMOVE;
    if st.flags.contains(AbdFlags::LINEAR) {
        flags |= AbdFlags::LINEAR;
    }

    let view = new_handle(
        &sabd.ctx,
        size,
        off,
        Some(Arc::clone(sabd)),
        flags,
        AbdStorage::View,
    );
    sabd.children.fetch_add(size as i64, Ordering::Relaxed);
    drop(st);
    view
}

impl Abd {
    /// Derive a view covering `[off, size)` of this handle. The bytes are
    /// shared, not copied; the source stays pinned until the view is
    /// released with [`Abd::put`].
    pub fn get_offset(self: &Arc<Self>, off: usize) -> Arc<Abd> {
        let size = self.size.saturating_sub(off);
        assert!(size > 0, "offset view would be empty");
        get_offset_impl(self, off, size)
    }

    /// Derive a view covering `[off, off + size)` of this handle
    pub fn get_offset_size(self: &Arc<Self>, off: usize, size: usize) -> Arc<Abd> {
        assert!(size > 0, "offset view would be empty");
        assert!(off + size <= self.size, "view range past end of source");
        get_offset_impl(self, off, size)
    }

    /// Free an owning root allocated with `alloc`/`alloc_linear`,
    /// returning its storage to the pools. Views and non-owning handles
    /// go through [`Abd::put`] instead.
    pub fn free(self: Arc<Self>) {
        let mut st = self.state.lock().unwrap();
        self.verify(&st);
        st.flags.insert(AbdFlags::NOMOVE);
        assert!(self.parent.is_none(), "free of a view (use put)");
        assert!(
            st.flags.contains(AbdFlags::OWNER),
            "free of a non-owning handle (use put)"
        );
        assert_eq!(
            self.children.load(Ordering::Relaxed),
            0,
            "free with live views or borrows outstanding"
        );

        let stats = &self.ctx.stats;
        let size = self.size as i64;
        let flags = st.flags;
        let chunkcnt;
        match mem::replace(&mut st.storage, AbdStorage::Dead) {
            AbdStorage::Scatter(s) => {
                chunkcnt = s.chunks.len();
                let n = chunkcnt as i64;
                let chunk_size = s.chunk_size as i64;
                for chunk in s.chunks {
                    self.ctx.chunks.free_chunk(chunk);
                }
                AbdStats::bump_down(&stats.scatter_cnt);
                AbdStats::add(&stats.scatter_data_size, -size);
                // n * chunk_size >= size, so this takes the waste back out.
                AbdStats::add(&stats.scatter_chunk_waste, size - n * chunk_size);
                if flags.contains(AbdFlags::SMALL) {
                    AbdStats::bump_down(&stats.small_scatter_cnt);
                }
                if flags.contains(AbdFlags::META) {
                    AbdStats::add(&stats.metadata_scattered, -size);
                    AbdStats::bump_down(&stats.scattered_metadata_cnt);
                } else {
                    AbdStats::add(&stats.file_data_scattered, -size);
                    AbdStats::bump_down(&stats.scattered_filedata_cnt);
                }
            }
            AbdStorage::Linear(lb) => {
                chunkcnt = 0;
                match lb {
                    LinearBuf::Pooled(raw) => self.ctx.bufs.free(raw),
                    LinearBuf::External(data) => drop(data),
                }
                AbdStats::bump_down(&stats.linear_cnt);
                AbdStats::add(&stats.linear_data_size, -size);
                if flags.contains(AbdFlags::META) {
                    AbdStats::add(&stats.metadata_linear, -size);
                } else {
                    AbdStats::add(&stats.file_data_linear, -size);
                }
            }
            AbdStorage::View | AbdStorage::Dead => unreachable!("owning root carries storage"),
        }

        st.magic = 0;
        AbdStats::add(&stats.struct_size, -struct_size_for(chunkcnt));
        drop(st);
        debug!(size = self.size, "freed handle");
    }

    /// Release a view or a non-owning root. Backing storage is left
    /// untouched; the parent's refcount drops by this handle's size and
    /// its relocation pin is lifted once no children remain.
    pub fn put(self: Arc<Self>) {
        {
            let mut st = self.state.lock().unwrap();
            self.verify(&st);
            assert!(
                !st.flags.contains(AbdFlags::OWNER),
                "put of an owning handle (use free)"
            );
            assert_eq!(
                self.children.load(Ordering::Relaxed),
                0,
                "put with live views or borrows outstanding"
            );
            // Views hold no storage; a never-promoted external root drops
            // its buffer with the record.
            st.storage = AbdStorage::Dead;
            st.magic = 0;
        }

        // Child lock is released before the parent's is taken.
        if let Some(parent) = &self.parent {
            let mut pst = parent.state.lock().unwrap();
            let remaining =
                parent.children.fetch_sub(self.size as i64, Ordering::Relaxed) - self.size as i64;
            assert!(remaining >= 0, "parent refcount underflow");
            if remaining == 0 {
                pst.flags.remove(AbdFlags::NOMOVE);
            }
        }

        AbdStats::add(&self.ctx.stats.struct_size, -struct_size_for(0));
    }

    /// Give this handle ownership of the buffer it wraps. Only valid on
    /// linear handles that came from [`AbdContext::get_from_buf`] or that
    /// released ownership earlier.
    pub fn take_ownership_of_buf(&self, is_metadata: bool) {
        let mut st = self.state.lock().unwrap();
        assert!(
            st.flags.contains(AbdFlags::LINEAR),
            "ownership transfer on a scattered handle"
        );
        assert!(
            !st.flags.contains(AbdFlags::OWNER),
            "handle already owns its buffer"
        );
        assert!(self.parent.is_none(), "ownership transfer on a view");
        self.verify(&st);

        st.flags.insert(AbdFlags::OWNER);
        let stats = &self.ctx.stats;
        let size = self.size as i64;
        if is_metadata {
            st.flags.insert(AbdFlags::META);
            AbdStats::add(&stats.metadata_linear, size);
        } else {
            AbdStats::add(&stats.file_data_linear, size);
        }
        AbdStats::bump(&stats.linear_cnt);
        AbdStats::add(&stats.linear_data_size, size);
    }

    /// Give up ownership of the wrapped buffer, the inverse of
    /// [`Abd::take_ownership_of_buf`]
    pub fn release_ownership_of_buf(&self) {
        let mut st = self.state.lock().unwrap();
        assert!(
            st.flags.contains(AbdFlags::LINEAR),
            "ownership transfer on a scattered handle"
        );
        assert!(
            st.flags.contains(AbdFlags::OWNER),
            "handle does not own its buffer"
        );
        self.verify(&st);

        let stats = &self.ctx.stats;
        let size = self.size as i64;
        if st.flags.contains(AbdFlags::META) {
            AbdStats::add(&stats.metadata_linear, -size);
        } else {
            AbdStats::add(&stats.file_data_linear, -size);
        }
        // META is meaningless once we no longer own the bytes.
        st.flags.remove(AbdFlags::OWNER | AbdFlags::META);
        AbdStats::bump_down(&stats.linear_cnt);
        AbdStats::add(&stats.linear_data_size, -size);
    }
}
