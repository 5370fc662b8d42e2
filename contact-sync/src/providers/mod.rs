//! Reference contact sources

pub mod folder;
pub mod memory;

pub use folder::FolderSource;
pub use memory::MemorySource;
