//! Bundled plugin implementations: an in-process virtual bus for tests and
//! multi-network setups on one machine, a file-backed storage backend, and
//! a SocketCAN transport behind the `socketcan` feature.
pub mod file_storage;
pub mod virtual_can;

#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub mod socketcan;
