//! Bulk operations over handle bytes
//!
//! Everything here funnels through two iterators that walk the
//! physically-contiguous runs of a handle: the whole remainder for linear
//! storage, up to the next chunk boundary for scattered. Callbacks return
//! an `i32`; the first non-zero return stops the walk and is propagated
//! verbatim, which is also how the compare operations report their
//! memcmp-style result.

use super::handle::{Abd, AbdStorage};
use std::cmp::Ordering as CmpOrdering;
use std::ptr;

/// Cursor over the contiguous runs of a storage root
///
/// `base` anchors the owning handle's byte 0 within the root; `pos` is
/// the handle-relative position.
struct AbdIter<'a> {
    storage: &'a mut AbdStorage,
    chunk_size: usize,
    base: usize,
    pos: usize,
}

impl<'a> AbdIter<'a> {
    fn new(storage: &'a mut AbdStorage, chunk_size: usize, base: usize) -> Self {
        Self {
            storage,
            chunk_size,
            base,
            pos: 0,
        }
    }

    fn advance(&mut self, amount: usize) {
        self.pos += amount;
    }

    /// Bytes available before the current run ends
    fn run(&self) -> usize {
        self.storage.contig_run(self.base + self.pos, self.chunk_size)
    }

    /// Map `len` bytes of the current run; `len` must not cross the run
    /// boundary
    fn map(&mut self, len: usize) -> &mut [u8] {
        self.storage.bytes_at_mut(self.base + self.pos, len)
    }
}

fn cmp_bytes(a: &[u8], b: &[u8]) -> i32 {
    match a.cmp(b) {
        CmpOrdering::Less => -1,
        CmpOrdering::Equal => 0,
        CmpOrdering::Greater => 1,
    }
}

impl Abd {
    /// Walk `[off, off + size)` of this handle, calling `func` once per
    /// physically-contiguous run. Stops at the first non-zero return and
    /// propagates it; returns 0 after a full walk.
    pub fn iterate_func<F>(&self, off: usize, size: usize, mut func: F) -> i32
    where
        F: FnMut(&mut [u8]) -> i32,
    {
        {
            let st = self.state.lock().unwrap();
            self.verify(&st);
        }
        assert!(off + size <= self.size, "iteration past end of handle");

        let (root, base) = self.resolve();
        let mut st = root.state.lock().unwrap();
        if !ptr::eq(self, root) {
            root.verify(&st);
        }

        let mut iter = AbdIter::new(&mut st.storage, self.ctx.chunk_size(), base);
        iter.advance(off);

        let mut remaining = size;
        let mut ret = 0;
        while remaining > 0 {
            let len = iter.run().min(remaining);
            assert!(len > 0, "empty run inside handle bounds");
            ret = func(iter.map(len));
            if ret != 0 {
                break;
            }
            remaining -= len;
            iter.advance(len);
        }
        ret
    }

    /// Walk two handles in lockstep, calling `func` with one
    /// destination-mutable and one source run per step. The step length
    /// is the smallest of the two runs and the remaining size.
    ///
    /// `self` and `src` must be distinct handles. When they resolve to
    /// different storage roots the two root locks are taken in address
    /// order; when they share a root the lock is taken once and the
    /// source run is staged through a bounce buffer, so overlapping views
    /// of one root are well-defined.
    pub fn iterate_func2<F>(
        &self,
        src: &Abd,
        doff: usize,
        soff: usize,
        size: usize,
        mut func: F,
    ) -> i32
    where
        F: FnMut(&mut [u8], &[u8]) -> i32,
    {
        assert!(!ptr::eq(self, src), "dual iteration over one handle");
        {
            let st = self.state.lock().unwrap();
            self.verify(&st);
        }
        {
            let st = src.state.lock().unwrap();
            src.verify(&st);
        }
        assert!(doff + size <= self.size, "iteration past end of destination");
        assert!(soff + size <= src.size, "iteration past end of source");

        let (droot, dbase) = self.resolve();
        let (sroot, sbase) = src.resolve();
        let chunk_size = self.ctx.chunk_size();

        if ptr::eq(droot, sroot) {
            let mut st = droot.state.lock().unwrap();
            let storage = &mut st.storage;
            let mut bounce: Vec<u8> = Vec::new();
            let (mut dpos, mut spos) = (doff, soff);
            let mut remaining = size;
            let mut ret = 0;
            while remaining > 0 {
                let drun = storage.contig_run(dbase + dpos, chunk_size);
                let srun = storage.contig_run(sbase + spos, chunk_size);
                let len = drun.min(srun).min(remaining);
                assert!(len > 0, "empty run inside handle bounds");
                bounce.clear();
                bounce.extend_from_slice(storage.bytes_at(sbase + spos, len));
                ret = func(storage.bytes_at_mut(dbase + dpos, len), &bounce);
                if ret != 0 {
                    break;
                }
                remaining -= len;
                dpos += len;
                spos += len;
            }
            return ret;
        }

        let mut dguard;
        let sguard;
        if (droot as *const Abd) < (sroot as *const Abd) {
            dguard = droot.state.lock().unwrap();
            sguard = sroot.state.lock().unwrap();
        } else {
            sguard = sroot.state.lock().unwrap();
            dguard = droot.state.lock().unwrap();
        }

        let sstorage = &sguard.storage;
        let mut diter = AbdIter::new(&mut dguard.storage, chunk_size, dbase);
        diter.advance(doff);

        let mut spos = soff;
        let mut remaining = size;
        let mut ret = 0;
        while remaining > 0 {
            let drun = diter.run();
            let srun = sstorage.contig_run(sbase + spos, chunk_size);
            let len = drun.min(srun).min(remaining);
            assert!(len > 0, "empty run inside handle bounds");
            ret = func(diter.map(len), sstorage.bytes_at(sbase + spos, len));
            if ret != 0 {
                break;
            }
            remaining -= len;
            diter.advance(len);
            spos += len;
        }
        ret
    }

    /// Copy `buf.len()` bytes out of the handle into `buf`, reading from
    /// handle offset `off`
    pub fn copy_to_buf_off(&self, buf: &mut [u8], off: usize) {
        if buf.is_empty() {
            return;
        }
        let mut written = 0;
        self.iterate_func(off, buf.len(), |run| {
            buf[written..written + run.len()].copy_from_slice(run);
            written += run.len();
            0
        });
    }

    /// Copy the handle's first `buf.len()` bytes into `buf`
    pub fn copy_to_buf(&self, buf: &mut [u8]) {
        self.copy_to_buf_off(buf, 0);
    }

    /// Copy `buf` into the handle at offset `off`
    pub fn copy_from_buf_off(&self, buf: &[u8], off: usize) {
        if buf.is_empty() {
            return;
        }
        let mut read = 0;
        self.iterate_func(off, buf.len(), |run| {
            let n = run.len();
            run.copy_from_slice(&buf[read..read + n]);
            read += n;
            0
        });
    }

    /// Copy `buf` into the start of the handle
    pub fn copy_from_buf(&self, buf: &[u8]) {
        self.copy_from_buf_off(buf, 0);
    }

    /// Compare the handle's bytes at `off` against `buf`, memcmp-style:
    /// the sign of the first unequal run, 0 if all bytes match
    pub fn cmp_buf_off(&self, buf: &[u8], off: usize) -> i32 {
        assert!(!buf.is_empty(), "empty compare");
        let mut pos = 0;
        self.iterate_func(off, buf.len(), |run| {
            let n = run.len();
            let ret = cmp_bytes(run, &buf[pos..pos + n]);
            pos += n;
            ret
        })
    }

    /// Compare the handle's first `buf.len()` bytes against `buf`
    pub fn cmp_buf(&self, buf: &[u8]) -> i32 {
        self.cmp_buf_off(buf, 0)
    }

    /// Zero `[off, off + size)` of the handle
    pub fn zero_off(&self, off: usize, size: usize) {
        assert!(size > 0, "empty zero range");
        self.iterate_func(off, size, |run| {
            run.fill(0);
            0
        });
    }

    /// Zero the whole handle
    pub fn zero(&self) {
        self.zero_off(0, self.size);
    }

    /// Copy `size` bytes from `src` at `soff` into this handle at `doff`
    pub fn copy_off(&self, src: &Abd, doff: usize, soff: usize, size: usize) {
        assert!(size > 0, "empty copy range");
        self.iterate_func2(src, doff, soff, size, |dst, s| {
            dst.copy_from_slice(s);
            0
        });
    }

    /// Copy the first `size` bytes of `src` into this handle
    pub fn copy(&self, src: &Abd, size: usize) {
        self.copy_off(src, 0, 0, size);
    }

    /// Compare the first `size` bytes of two handles, memcmp-style. Both
    /// handles must be exactly `size` bytes long.
    pub fn cmp(&self, other: &Abd, size: usize) -> i32 {
        assert_eq!(self.size, size, "compare size does not match destination");
        assert_eq!(other.size, size, "compare size does not match source");
        self.iterate_func2(other, 0, 0, size, |a, b| cmp_bytes(a, b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buf::handle::AbdContext;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_buffer_round_trip_across_chunks() {
        let ctx = AbdContext::with_defaults();
        let h = ctx.alloc(2500, false);

        let data = pattern(2500);
        h.copy_from_buf(&data);

        let mut out = vec![0u8; 2500];
        h.copy_to_buf(&mut out);
        assert_eq!(out, data);
        assert_eq!(h.cmp_buf(&data), 0);

        h.free();
    }

    #[test]
    fn test_offset_round_trip() {
        let ctx = AbdContext::with_defaults();
        let h = ctx.alloc(3000, false);
        h.zero();

        let data = pattern(512);
        h.copy_from_buf_off(&data, 900);

        let mut out = vec![0u8; 512];
        h.copy_to_buf_off(&mut out, 900);
        assert_eq!(out, data);

        // Bytes outside the window stayed zero.
        let mut head = vec![0xFFu8; 900];
        h.copy_to_buf(&mut head);
        assert!(head.iter().all(|&b| b == 0));

        h.free();
    }

    #[test]
    fn test_cmp_buf_sign() {
        let ctx = AbdContext::with_defaults();
        let h = ctx.alloc(2048, false);
        let data = pattern(2048);
        h.copy_from_buf(&data);

        let mut lower = data.clone();
        lower[1500] = lower[1500].wrapping_sub(1);
        assert!(h.cmp_buf(&lower) > 0);

        let mut higher = data.clone();
        higher[1500] = higher[1500].wrapping_add(1);
        assert!(h.cmp_buf(&higher) < 0);

        h.free();
    }

    #[test]
    fn test_zero_subrange() {
        let ctx = AbdContext::with_defaults();
        let h = ctx.alloc(2048, false);
        h.copy_from_buf(&vec![0xEE; 2048]);

        h.zero_off(1000, 100);

        let mut out = vec![0u8; 2048];
        h.copy_to_buf(&mut out);
        assert!(out[..1000].iter().all(|&b| b == 0xEE));
        assert!(out[1000..1100].iter().all(|&b| b == 0));
        assert!(out[1100..].iter().all(|&b| b == 0xEE));

        h.free();
    }

    #[test]
    fn test_copy_between_scattered_and_linear() {
        let ctx = AbdContext::with_defaults();
        let src = ctx.alloc(2500, false);
        let dst = ctx.alloc_linear(2500, false);

        let data = pattern(2500);
        src.copy_from_buf(&data);
        dst.copy(&src, 2500);

        assert_eq!(dst.cmp_buf(&data), 0);
        assert_eq!(dst.cmp(&src, 2500), 0);

        src.free();
        dst.free();
    }

    #[test]
    fn test_view_reads_source_bytes() {
        let ctx = AbdContext::with_defaults();
        let h = ctx.alloc(2500, false);
        let data = pattern(2500);
        h.copy_from_buf(&data);

        let v = h.get_offset(1100);
        let mut out = vec![0u8; v.size()];
        v.copy_to_buf(&mut out);
        assert_eq!(out, &data[1100..]);

        // Writes through the view land in the source.
        v.zero_off(0, 10);
        let mut head = vec![0xFFu8; 10];
        h.copy_to_buf_off(&mut head, 1100);
        assert!(head.iter().all(|&b| b == 0));

        v.put();
        h.free();
    }

    #[test]
    fn test_overlapping_views_of_one_root() {
        let ctx = AbdContext::with_defaults();
        let h = ctx.alloc(2048, false);
        let data = pattern(2048);
        h.copy_from_buf(&data);

        let dst = h.get_offset_size(0, 1024);
        let src = h.get_offset_size(512, 1024);
        dst.copy(&src, 1024);

        let mut out = vec![0u8; 1024];
        dst.copy_to_buf(&mut out);
        assert_eq!(out, &data[512..1536]);

        src.put();
        dst.put();
        h.free();
    }

    #[test]
    fn test_iterate_stops_on_nonzero_return() {
        let ctx = AbdContext::with_defaults();
        let h = ctx.alloc(3000, false);

        let mut calls = 0;
        let ret = h.iterate_func(0, 3000, |_| {
            calls += 1;
            7
        });
        assert_eq!(ret, 7);
        assert_eq!(calls, 1);

        h.free();
    }

    #[test]
    fn test_iterate_runs_follow_chunk_boundaries() {
        let ctx = AbdContext::with_defaults();
        let h = ctx.alloc(2500, false);
        let v = h.get_offset(1100);

        // Effective offset 76: runs are 948 then 452.
        let mut runs = Vec::new();
        v.iterate_func(0, v.size(), |run| {
            runs.push(run.len());
            0
        });
        assert_eq!(runs, vec![1024 - 76, 1400 - (1024 - 76)]);

        v.put();
        h.free();
    }

    #[test]
    #[should_panic(expected = "past end of handle")]
    fn test_iterate_past_end_panics() {
        let ctx = AbdContext::with_defaults();
        let h = ctx.alloc(1000, false);
        h.iterate_func(500, 501, |_| 0);
    }

    #[test]
    #[should_panic(expected = "dual iteration over one handle")]
    fn test_copy_onto_itself_panics() {
        let ctx = AbdContext::with_defaults();
        let h = ctx.alloc(1000, false);
        h.copy_off(&h, 0, 0, 100);
    }

    #[test]
    #[should_panic(expected = "compare size does not match")]
    fn test_cmp_requires_exact_sizes() {
        let ctx = AbdContext::with_defaults();
        let a = ctx.alloc(1000, false);
        let b = ctx.alloc(1200, false);
        let _ = a.cmp(&b, 1000);
    }
}
