//! Counter registry for the buffer subsystem
//!
//! Counters are advisory: individual values need not be mutually
//! consistent under concurrency, but each converges to the true value at
//! quiescence. All updates are relaxed atomic adds.

use serde::Serialize;
use std::sync::atomic::{AtomicI64, Ordering};

/// Live counters, one registry per context
///
/// Stored signed so that transient decrements (free racing alloc) never
/// wrap; snapshots clamp to zero.
#[derive(Debug, Default)]
pub struct AbdStats {
    /// Memory occupied by handle records themselves
    pub(crate) struct_size: AtomicI64,
    /// Owning scattered handles currently allocated
    pub(crate) scatter_cnt: AtomicI64,
    /// Bytes stored in handles tracked by `scatter_cnt`
    pub(crate) scatter_data_size: AtomicI64,
    /// Space wasted at the end of the last chunk across scattered handles
    pub(crate) scatter_chunk_waste: AtomicI64,
    /// Owning linear handles currently allocated
    pub(crate) linear_cnt: AtomicI64,
    /// Bytes stored in handles tracked by `linear_cnt`
    pub(crate) linear_data_size: AtomicI64,
    /// Bytes held as file data in scattered handles
    pub(crate) file_data_scattered: AtomicI64,
    /// Bytes held as metadata in scattered handles
    pub(crate) metadata_scattered: AtomicI64,
    /// Bytes held as file data in linear handles
    pub(crate) file_data_linear: AtomicI64,
    /// Bytes held as metadata in linear handles
    pub(crate) metadata_linear: AtomicI64,
    /// Scattered handles smaller than one chunk
    pub(crate) small_scatter_cnt: AtomicI64,
    /// Count of scattered metadata handles
    pub(crate) scattered_metadata_cnt: AtomicI64,
    /// Count of scattered file-data handles
    pub(crate) scattered_filedata_cnt: AtomicI64,
    /// Outstanding borrowed raw buffers
    pub(crate) borrowed_bufs: AtomicI64,
    /// Relocations refused because the handle had live children
    pub(crate) move_refcount_nonzero: AtomicI64,
    /// Successful relocations of linear handles
    pub(crate) moved_linear: AtomicI64,
    /// Successful relocations of scattered file-data handles
    pub(crate) moved_scattered_filedata: AtomicI64,
    /// Successful relocations of scattered metadata handles
    pub(crate) moved_scattered_metadata: AtomicI64,
    /// Relocations refused because the handle was pinned
    pub(crate) move_to_buf_flag_fail: AtomicI64,
}

impl AbdStats {
    pub(crate) fn add(counter: &AtomicI64, delta: i64) {
        counter.fetch_add(delta, Ordering::Relaxed);
    }

    pub(crate) fn bump(counter: &AtomicI64) {
        Self::add(counter, 1);
    }

    pub(crate) fn bump_down(counter: &AtomicI64) {
        Self::add(counter, -1);
    }

    /// Take a point-in-time snapshot of every counter
    pub fn snapshot(&self) -> AbdStatsSnapshot {
        let read = |c: &AtomicI64| c.load(Ordering::Relaxed).max(0) as u64;
        AbdStatsSnapshot {
            struct_size: read(&self.struct_size),
            scatter_cnt: read(&self.scatter_cnt),
            scatter_data_size: read(&self.scatter_data_size),
            scatter_chunk_waste: read(&self.scatter_chunk_waste),
            linear_cnt: read(&self.linear_cnt),
            linear_data_size: read(&self.linear_data_size),
            file_data_scattered: read(&self.file_data_scattered),
            metadata_scattered: read(&self.metadata_scattered),
            file_data_linear: read(&self.file_data_linear),
            metadata_linear: read(&self.metadata_linear),
            small_scatter_cnt: read(&self.small_scatter_cnt),
            scattered_metadata_cnt: read(&self.scattered_metadata_cnt),
            scattered_filedata_cnt: read(&self.scattered_filedata_cnt),
            borrowed_bufs: read(&self.borrowed_bufs),
            move_refcount_nonzero: read(&self.move_refcount_nonzero),
            moved_linear: read(&self.moved_linear),
            moved_scattered_filedata: read(&self.moved_scattered_filedata),
            moved_scattered_metadata: read(&self.moved_scattered_metadata),
            move_to_buf_flag_fail: read(&self.move_to_buf_flag_fail),
        }
    }
}

/// Point-in-time view of the counter registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AbdStatsSnapshot {
    pub struct_size: u64,
    pub scatter_cnt: u64,
    pub scatter_data_size: u64,
    pub scatter_chunk_waste: u64,
    pub linear_cnt: u64,
    pub linear_data_size: u64,
    pub file_data_scattered: u64,
    pub metadata_scattered: u64,
    pub file_data_linear: u64,
    pub metadata_linear: u64,
    pub small_scatter_cnt: u64,
    pub scattered_metadata_cnt: u64,
    pub scattered_filedata_cnt: u64,
    pub borrowed_bufs: u64,
    pub move_refcount_nonzero: u64,
    pub moved_linear: u64,
    pub moved_scattered_filedata: u64,
    pub moved_scattered_metadata: u64,
    pub move_to_buf_flag_fail: u64,
}
