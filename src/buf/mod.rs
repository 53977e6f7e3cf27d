//! ARC buffer data (ABD)
//!
//! An abstract byte buffer the storage engine uses in place of a raw
//! contiguous allocation. A handle stores its bytes one of two ways:
//!
//! ```text
//! Abd (linear)                      Abd (scattered)
//!   flags = LINEAR | OWNER            flags = OWNER
//!   size                              size, offset
//!   buf ───────────────────┐          chunks[0] ──→ | chunk 0 |
//!                          ▼          chunks[1] ──→ | chunk 1 |
//!   | raw buffer of size bytes |      chunks[n-1] → | chunk n-1 |
//! ```
//!
//! Keeping most buffers scattered keeps long-term fragmentation low:
//! when allocatable space runs short, equal-sized chunks can be
//! reclaimed quickly to satisfy a new large allocation. Consumers should
//! not need to know which representation they hold; the public API works
//! identically on both, and `borrow_buf`/`return_buf` bridge to code
//! that requires flat bytes.
//!
//! A handle can also expose a window into another handle: `get_offset`
//! creates a view that shares the source's bytes without copying. The
//! source is pinned (`NOMOVE`) and carries the view's size in its child
//! refcount until the view is released with `put`, which is what keeps
//! the source alive and immovable for as long as any view exists.
//!
//! # Locking
//!
//! Every handle has a non-recursive mutex over its mutable state. Byte
//! access always locks the mutex of the storage root (the handle at the
//! top of the parent chain, which is the one actually holding bytes).
//! When a dual iteration spans two storage roots, the two locks are
//! taken in address order. `put` releases the child's lock before taking
//! the parent's. The relocator locks only its target.
//!
//! # The NOMOVE ratchet
//!
//! `NOMOVE` is set eagerly: any `to_buf`, any linear borrow, any
//! `get_offset` and any `free` pins the handle, because a raw pointer to
//! its bytes may have been observed. The flag is cleared in exactly one
//! place: when `put` drops a parent's child refcount to zero.

pub mod borrow;
pub mod handle;

mod alloc;
mod iter;
mod relocate;

pub use borrow::BorrowedBuf;
pub use handle::{Abd, AbdContext, AbdFlags};
