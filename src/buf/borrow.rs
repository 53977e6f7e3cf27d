//! Borrowing flat byte buffers from a handle
//!
//! Consumers that need contiguous bytes borrow them through
//! [`BorrowedBuf`]. On a scattered handle the borrow is a scratch buffer
//! from the raw pool; on a linear handle it is the handle's own bytes,
//! held under the storage lock, so no allocation or copy happens. Either
//! way the borrow is tracked in the handle's child refcount until it is
//! returned.
//!
//! Return discipline: a borrow returned with `return_buf` must not have
//! been modified (asserted on the scattered path); modified borrows go
//! back through `return_buf_copy`, which writes the bytes into the
//! handle first. While a linear borrow is outstanding the storage lock is
//! held, so release it before invoking other operations on the handle.

use super::handle::{Abd, AbdFlags, AbdState, AbdStorage};
use crate::pool::RawBuf;
use crate::stats::AbdStats;
use std::ops::{Deref, DerefMut};
use std::ptr;
use std::sync::atomic::Ordering;
use std::sync::MutexGuard;

/// A flat byte buffer borrowed from a handle
///
/// Dereferences to `[u8]`. Dropping it without an explicit `return_buf*`
/// releases the refcount entry and the scratch storage but skips the
/// write-back and the no-modification assertion.
pub struct BorrowedBuf<'a> {
    owner: &'a Abd,
    n: usize,
    /// Scratch from the raw pool; `None` on the zero-copy linear path
    scratch: Option<RawBuf>,
    /// Storage-root lock plus the handle's base offset within the root
    linear: Option<(MutexGuard<'a, AbdState>, usize)>,
}

impl Deref for BorrowedBuf<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        if let Some(raw) = &self.scratch {
            return raw.bytes();
        }
        let (guard, base) = self.linear.as_ref().expect("borrow with no backing");
        match &guard.storage {
            AbdStorage::Linear(lb) => &lb.bytes()[*base..*base + self.n],
            _ => panic!("linear borrow over non-linear storage"),
        }
    }
}

impl DerefMut for BorrowedBuf<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        let n = self.n;
        if let Some(raw) = &mut self.scratch {
            return raw.bytes_mut();
        }
        let (guard, base) = self.linear.as_mut().expect("borrow with no backing");
        match &mut guard.storage {
            AbdStorage::Linear(lb) => &mut lb.bytes_mut()[*base..*base + n],
            _ => panic!("linear borrow over non-linear storage"),
        }
    }
}

impl Drop for BorrowedBuf<'_> {
    fn drop(&mut self) {
        if let Some(raw) = self.scratch.take() {
            self.owner.ctx.bufs.meta_buf_free(raw);
        }
        self.owner.children.fetch_sub(self.n as i64, Ordering::Relaxed);
        AbdStats::bump_down(&self.owner.ctx.stats.borrowed_bufs);
    }
}

impl Abd {
    /// Borrow `n` flat bytes from the handle without copying its
    /// contents. On a scattered handle the scratch contents are
    /// unspecified; use [`Abd::borrow_buf_copy`] to start from the
    /// handle's data.
    pub fn borrow_buf(&self, n: usize) -> BorrowedBuf<'_> {
        assert!(n > 0, "empty borrow");
        assert!(n <= self.size, "borrow longer than handle");

        let is_linear = {
            let mut st = self.state.lock().unwrap();
            self.verify(&st);
            if st.flags.contains(AbdFlags::LINEAR) {
                // Handing out the raw bytes pins the handle.
                st.flags.insert(AbdFlags::NOMOVE);
                true
            } else {
                false
            }
        };

        self.children.fetch_add(n as i64, Ordering::Relaxed);
        AbdStats::bump(&self.ctx.stats.borrowed_bufs);

        if is_linear {
            let (root, base) = self.resolve();
            let guard = root.state.lock().unwrap();
            BorrowedBuf {
                owner: self,
                n,
                scratch: None,
                linear: Some((guard, base)),
            }
        } else {
            BorrowedBuf {
                owner: self,
                n,
                scratch: Some(self.ctx.bufs.meta_buf_alloc(n)),
                linear: None,
            }
        }
    }

    /// Borrow `n` flat bytes holding the handle's first `n` bytes
    pub fn borrow_buf_copy(&self, n: usize) -> BorrowedBuf<'_> {
        let mut buf = self.borrow_buf(n);
        if let Some(scratch) = buf.scratch.as_mut() {
            self.copy_to_buf(scratch.bytes_mut());
        }
        buf
    }

    /// Return a borrow without writing it back. The caller must not have
    /// modified the bytes; on the scattered path that is asserted.
    pub fn return_buf(&self, buf: BorrowedBuf<'_>) {
        assert!(ptr::eq(buf.owner, self), "borrow returned to the wrong handle");
        if buf.scratch.is_some() {
            assert_eq!(
                self.cmp_buf(&buf[..]),
                0,
                "borrowed buffer was modified; use return_buf_copy"
            );
        }
        drop(buf);
    }

    /// Return a borrow, writing any modifications back into the handle
    pub fn return_buf_copy(&self, buf: BorrowedBuf<'_>) {
        assert!(ptr::eq(buf.owner, self), "borrow returned to the wrong handle");
        if buf.scratch.is_some() {
            self.copy_from_buf(&buf[..]);
        }
        drop(buf);
    }

    /// Return a borrow of which only `[off, off + len)` is valid, without
    /// writing it back
    pub fn return_buf_off(&self, buf: BorrowedBuf<'_>, off: usize, len: usize) {
        assert!(ptr::eq(buf.owner, self), "borrow returned to the wrong handle");
        assert!(off + len <= buf.n, "valid range past end of borrow");
        assert!(off + len <= self.size, "valid range past end of handle");
        if buf.scratch.is_some() && len > 0 {
            assert_eq!(
                self.cmp_buf_off(&buf[off..off + len], off),
                0,
                "borrowed buffer was modified; use return_buf_copy_off"
            );
        }
        drop(buf);
    }

    /// Return a borrow of which only `[off, off + len)` is valid, writing
    /// that range back into the handle
    pub fn return_buf_copy_off(&self, buf: BorrowedBuf<'_>, off: usize, len: usize) {
        assert!(ptr::eq(buf.owner, self), "borrow returned to the wrong handle");
        assert!(off + len <= buf.n, "valid range past end of borrow");
        assert!(off + len <= self.size, "valid range past end of handle");
        if buf.scratch.is_some() && len > 0 {
            self.copy_from_buf_off(&buf[off..off + len], off);
        }
        drop(buf);
    }

    /// Run `f` over the raw bytes of a linear handle. Pins the handle.
    pub fn to_buf<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        {
            let mut st = self.state.lock().unwrap();
            self.verify(&st);
            assert!(
                st.flags.contains(AbdFlags::LINEAR),
                "to_buf on a scattered handle"
            );
            st.flags.insert(AbdFlags::NOMOVE);
        }
        let (root, base) = self.resolve();
        let mut st = root.state.lock().unwrap();
        let bytes = match &mut st.storage {
            AbdStorage::Linear(lb) => lb.bytes_mut(),
            _ => panic!("linear handle resolved to non-linear storage"),
        };
        f(&mut bytes[base..base + self.size])
    }

    /// Read-only variant of [`Abd::to_buf`] that does not pin the handle.
    /// For assertions and diagnostics that do not retain the bytes.
    pub fn to_buf_ephemeral<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        {
            let st = self.state.lock().unwrap();
            self.verify(&st);
            assert!(
                st.flags.contains(AbdFlags::LINEAR),
                "to_buf on a scattered handle"
            );
        }
        let (root, base) = self.resolve();
        let st = root.state.lock().unwrap();
        let bytes = match &st.storage {
            AbdStorage::Linear(lb) => lb.bytes(),
            _ => panic!("linear handle resolved to non-linear storage"),
        };
        f(&bytes[base..base + self.size])
    }
}
