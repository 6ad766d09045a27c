//! Storage adapters for the key database.

pub mod file;
pub mod ram;

pub use file::FileKeyStore;
pub use ram::RamKeyStore;
