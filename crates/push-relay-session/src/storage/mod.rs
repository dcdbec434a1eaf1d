//! Key-value store implementations.

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "file")]
pub mod file;

#[cfg(feature = "memory")]
pub use memory::MemoryStore;

#[cfg(feature = "file")]
pub use file::JsonFileStore;
