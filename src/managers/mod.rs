//! Storage backends shipped with the crate.

#[cfg(feature = "manager-moka")]
pub mod moka;
