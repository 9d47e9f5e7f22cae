#![forbid(unsafe_code)]
//! Filesystem, hashing, path-rule and process helpers for Shipyard.

pub mod error;
pub mod fs;
pub mod hash;
pub mod paths;
pub mod process;
