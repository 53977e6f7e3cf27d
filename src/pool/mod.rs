//! External allocator adapters
//!
//! The buffer subsystem never allocates backing storage itself; it draws
//! from two pools owned by the context:
//!
//! - [`ChunkPool`] vends fixed-size chunks for scattered handles, with a
//!   magazine of recently freed chunks in front of the slab.
//! - [`RawPool`] vends arbitrary-size contiguous buffers, split into
//!   data and metadata variants.
//!
//! Both are assumed to satisfy every allocation: exhaustion is an abort,
//! never an error return.

pub mod chunk;
pub mod raw;

pub use chunk::{Chunk, ChunkPool};
pub use raw::{BufKind, RawBuf, RawPool};
