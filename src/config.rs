//! Tunables for the buffer subsystem

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Storage-engine block-size ceiling. No handle may exceed this.
pub const MAX_BLOCK_SIZE: usize = 16 << 20;

/// Default size of the chunks scattered handles are built from.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Default lower bound on handle age when relocation trips over a pin.
pub const DEFAULT_MOVE_GRACE: Duration = Duration::from_secs(5 * 60);

/// Configuration for an [`AbdContext`](crate::AbdContext)
///
/// `chunk_size` is frozen once the context is built: scattered handles
/// record it at creation and iteration asserts the two still agree.
/// `scatter_enabled` may be flipped at runtime and affects future
/// allocations only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbdConfig {
    /// Size of the fixed chunks scattered handles are built from (bytes).
    /// Must be a nonzero power of two.
    pub chunk_size: usize,
    /// Allocate scattered by default. When false, `alloc` degrades to
    /// `alloc_linear`.
    pub scatter_enabled: bool,
    /// Debug builds assert a handle was at least this old when relocation
    /// fails on its pin. A pin on a just-created handle is a consumer bug.
    pub move_grace: Duration,
}

impl Default for AbdConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            scatter_enabled: true,
            move_grace: DEFAULT_MOVE_GRACE,
        }
    }
}

impl AbdConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || !self.chunk_size.is_power_of_two() {
            return Err(Error::Config(format!(
                "chunk_size must be a nonzero power of two, got {}",
                self.chunk_size
            )));
        }
        if self.chunk_size > MAX_BLOCK_SIZE {
            return Err(Error::Config(format!(
                "chunk_size {} exceeds maximum block size {}",
                self.chunk_size, MAX_BLOCK_SIZE
            )));
        }
        Ok(())
    }
}
