//! Arbitrary-size buffer allocator
//!
//! Linear handles and borrow scratch buffers come from here. The pool is
//! split into data and metadata variants so the two populations can be
//! accounted (and one day sized) independently.

use std::sync::atomic::{AtomicU64, Ordering};

/// Which variant of the pool a buffer came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufKind {
    Data,
    Meta,
}

/// A contiguous buffer owned by the pool until freed back to it
#[derive(Debug)]
pub struct RawBuf {
    data: Box<[u8]>,
    kind: BufKind,
}

impl RawBuf {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn kind(&self) -> BufKind {
        self.kind
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// Pool of arbitrary-size data and metadata buffers
#[derive(Debug, Default)]
pub struct RawPool {
    data_in_use: AtomicU64,
    meta_in_use: AtomicU64,
}

impl RawPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a file-data buffer of exactly `size` bytes
    pub fn data_buf_alloc(&self, size: usize) -> RawBuf {
        self.data_in_use.fetch_add(size as u64, Ordering::Relaxed);
        RawBuf {
            data: vec![0u8; size].into_boxed_slice(),
            kind: BufKind::Data,
        }
    }

    /// Allocate a metadata buffer of exactly `size` bytes
    pub fn meta_buf_alloc(&self, size: usize) -> RawBuf {
        self.meta_in_use.fetch_add(size as u64, Ordering::Relaxed);
        RawBuf {
            data: vec![0u8; size].into_boxed_slice(),
            kind: BufKind::Meta,
        }
    }

    /// Free a file-data buffer
    pub fn data_buf_free(&self, buf: RawBuf) {
        assert_eq!(buf.kind, BufKind::Data, "metadata buffer freed to data pool");
        self.data_in_use.fetch_sub(buf.len() as u64, Ordering::Relaxed);
    }

    /// Free a metadata buffer
    pub fn meta_buf_free(&self, buf: RawBuf) {
        assert_eq!(buf.kind, BufKind::Meta, "data buffer freed to metadata pool");
        self.meta_in_use.fetch_sub(buf.len() as u64, Ordering::Relaxed);
    }

    /// Free a buffer to whichever variant it came from
    pub fn free(&self, buf: RawBuf) {
        match buf.kind {
            BufKind::Data => self.data_buf_free(buf),
            BufKind::Meta => self.meta_buf_free(buf),
        }
    }

    /// Bytes of file-data buffers currently handed out
    pub fn data_in_use(&self) -> u64 {
        self.data_in_use.load(Ordering::Relaxed)
    }

    /// Bytes of metadata buffers currently handed out
    pub fn meta_in_use(&self) -> u64 {
        self.meta_in_use.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_accounting() {
        let pool = RawPool::new();
        let buf = pool.data_buf_alloc(4096);
        assert_eq!(buf.len(), 4096);
        assert_eq!(buf.kind(), BufKind::Data);
        assert_eq!(pool.data_in_use(), 4096);
        assert_eq!(pool.meta_in_use(), 0);

        pool.data_buf_free(buf);
        assert_eq!(pool.data_in_use(), 0);
    }

    #[test]
    fn test_meta_accounting() {
        let pool = RawPool::new();
        let buf = pool.meta_buf_alloc(512);
        assert_eq!(pool.meta_in_use(), 512);
        pool.free(buf);
        assert_eq!(pool.meta_in_use(), 0);
    }

    #[test]
    #[should_panic(expected = "freed to data pool")]
    fn test_kind_mismatch_panics() {
        let pool = RawPool::new();
        let buf = pool.meta_buf_alloc(64);
        pool.data_buf_free(buf);
    }
}
