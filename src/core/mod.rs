//! core
//!
//! Keyspace layout shared by every flat-store adapter.
//!
//! - [`path`] - node path validation and the depth-prefixed key encoding

pub mod path;
