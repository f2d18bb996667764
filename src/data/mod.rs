//! On-disk and shared-memory data structures.
#[cfg(feature = "storage_hdf5")]
pub mod hdf5_store;
pub mod status;
