//! End-to-end lifecycle scenarios for the buffer subsystem
//!
//! These exercise the public API the way the storage engine drives it:
//! allocate, derive views, borrow flat bytes, transfer ownership, free,
//! and verify the counter registry settles back to zero at quiescence.

use arcbuf::{AbdConfig, AbdContext, AbdFlags};
use std::sync::Arc;
use std::time::Duration;

fn ctx() -> Arc<AbdContext> {
    AbdContext::with_defaults()
}

/// Context with the relocation age tripwire disabled, for scenarios that
/// expect a refused move on a freshly pinned handle.
fn relaxed_ctx() -> Arc<AbdContext> {
    AbdContext::new(AbdConfig {
        move_grace: Duration::ZERO,
        ..AbdConfig::default()
    })
    .unwrap()
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn test_small_scatter_lifecycle() {
    let ctx = ctx();
    let h = ctx.alloc(700, false);

    assert!(!h.is_linear());
    assert!(h.flags().contains(AbdFlags::SMALL));
    assert_eq!(h.chunk_count(), 1);

    let snap = ctx.stats();
    assert_eq!(snap.scatter_cnt, 1);
    assert_eq!(snap.scatter_chunk_waste, 324);

    h.free();

    let snap = ctx.stats();
    assert_eq!(snap.scatter_cnt, 0);
    assert_eq!(snap.scatter_data_size, 0);
    assert_eq!(snap.scatter_chunk_waste, 0);
    assert_eq!(snap.small_scatter_cnt, 0);
    assert_eq!(snap.scattered_filedata_cnt, 0);
    assert_eq!(snap.struct_size, 0);
}

#[test]
fn test_multichunk_metadata_write_and_compare() {
    let ctx = ctx();
    let h = ctx.alloc(2500, true);

    assert_eq!(h.chunk_count(), 3);
    assert!(h.is_metadata());
    assert!(h.is_owner());
    assert_eq!(ctx.stats().scatter_chunk_waste, 572);

    let expected = pattern(2500);
    h.copy_from_buf(&expected);
    assert_eq!(h.cmp_buf(&expected), 0);

    h.free();
}

#[test]
fn test_offset_view_consistency() {
    let ctx = relaxed_ctx();
    let h = ctx.alloc(2500, true);
    let data = pattern(2500);
    h.copy_from_buf(&data);

    let v = h.get_offset(1100);
    assert_eq!(v.size(), 1400);
    assert_eq!(v.scatter_offset(), 1100 % 1024);
    assert_eq!(v.chunk_count(), 2);

    // Every byte of the view matches the source at the shifted offset.
    let mut seen = vec![0u8; v.size()];
    v.copy_to_buf(&mut seen);
    assert_eq!(seen, &data[1100..]);

    // The live view pins the source.
    assert!(!h.try_move());

    v.put();
    assert!(h.try_move());

    h.free();
}

#[test]
fn test_borrow_overwrite_scattered() {
    let ctx = ctx();
    let h = ctx.alloc(2500, false);
    h.copy_from_buf(&pattern(2500));
    let borrowed_before = ctx.stats().borrowed_bufs;

    let mut buf = h.borrow_buf(2500);
    buf.fill(0);
    h.return_buf_copy(buf);

    assert_eq!(h.cmp_buf(&vec![0u8; 2500]), 0);
    assert_eq!(ctx.stats().borrowed_bufs, borrowed_before);

    h.free();
}

#[test]
fn test_external_buffer_ownership_transfer() {
    let ctx = ctx();
    let h = ctx.get_from_buf(vec![0xAB; 1024]);

    assert!(h.is_linear());
    assert!(!h.is_owner());
    assert!(h.flags().contains(AbdFlags::NOMOVE));
    assert_eq!(h.cmp_buf(&vec![0xAB; 1024]), 0);

    h.take_ownership_of_buf(false);
    assert!(h.is_owner());
    assert_eq!(ctx.stats().linear_cnt, 1);

    h.free();
    assert_eq!(ctx.stats().linear_cnt, 0);
    assert_eq!(ctx.stats().linear_data_size, 0);
    assert_eq!(ctx.stats().struct_size, 0);
}

#[test]
fn test_round_trip_through_flat_buffer() {
    let ctx = ctx();
    let h = ctx.alloc(4000, false);

    let original = pattern(4000);
    h.copy_from_buf(&original);

    let mut out = vec![0u8; 4000];
    h.copy_to_buf(&mut out);
    assert_eq!(out, original);

    h.free();
}

#[test]
fn test_borrow_copy_then_plain_return_is_idempotent() {
    let ctx = ctx();
    let h = ctx.alloc(1800, false);
    let data = pattern(1800);
    h.copy_from_buf(&data);

    let buf = h.borrow_buf_copy(1800);
    h.return_buf(buf);

    assert_eq!(h.cmp_buf(&data), 0);
    h.free();
}

#[test]
fn test_borrow_copy_commutes_with_mutation() {
    let ctx = ctx();
    let h = ctx.alloc(2200, false);
    h.zero();

    let replacement = pattern(2200);
    let mut buf = h.borrow_buf(2200);
    buf.copy_from_slice(&replacement);
    h.return_buf_copy(buf);

    assert_eq!(h.cmp_buf(&replacement), 0);
    h.free();
}

#[test]
fn test_sametype_preserves_variant_and_metadata() {
    let ctx = ctx();
    let sources = [
        ctx.alloc(1000, false),
        ctx.alloc(1000, true),
        ctx.alloc_linear(1000, false),
        ctx.alloc_linear(1000, true),
    ];

    for src in &sources {
        let clone = ctx.alloc_sametype(src, 640);
        assert_eq!(clone.is_linear(), src.is_linear());
        assert_eq!(clone.is_metadata(), src.is_metadata());
        clone.free();
    }
    for src in sources {
        src.free();
    }
}

#[test]
fn test_counter_conservation_at_quiescence() {
    let ctx = ctx();
    let chunk_size = ctx.chunk_size();

    let sizes = [700usize, 1024, 2500, 4096, 9000];
    let handles: Vec<_> = sizes.iter().map(|&s| ctx.alloc(s, s % 2 == 0)).collect();

    let snap = ctx.stats();
    assert_eq!(snap.scatter_cnt, sizes.len() as u64);
    assert_eq!(
        snap.scatter_data_size,
        sizes.iter().sum::<usize>() as u64
    );
    let waste: usize = sizes
        .iter()
        .map(|&s| s.div_ceil(chunk_size) * chunk_size - s)
        .sum();
    assert_eq!(snap.scatter_chunk_waste, waste as u64);

    for h in handles {
        h.free();
    }

    let snap = ctx.stats();
    assert_eq!(snap.scatter_cnt, 0);
    assert_eq!(snap.scatter_data_size, 0);
    assert_eq!(snap.scatter_chunk_waste, 0);
    assert_eq!(snap.scattered_metadata_cnt, 0);
    assert_eq!(snap.scattered_filedata_cnt, 0);
    assert_eq!(snap.struct_size, 0);
}

#[test]
fn test_stats_snapshot_serializes() {
    let ctx = ctx();
    let h = ctx.alloc(2048, false);

    let json = serde_json::to_string(&ctx.stats()).unwrap();
    assert!(json.contains("\"scatter_cnt\":1"));
    assert!(json.contains("\"scatter_data_size\":2048"));

    h.free();
}
