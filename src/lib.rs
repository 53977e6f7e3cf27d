// ArcBuf - ARC buffer data
// Linear/scattered in-memory byte buffers for the storage engine

#![warn(rust_2018_idioms)]

pub mod buf;
pub mod config;
pub mod pool;
pub mod stats;

// Re-exports for convenience
pub use buf::{Abd, AbdContext, AbdFlags, BorrowedBuf};
pub use config::{AbdConfig, DEFAULT_CHUNK_SIZE, MAX_BLOCK_SIZE};
pub use stats::AbdStatsSnapshot;

/// ArcBuf error types
pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Config error: {0}")]
        Config(String),
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_format() {
        // VERSION is a static string, always valid
        let _version: &str = VERSION;
        // Just ensure the constant is accessible
    }
}
