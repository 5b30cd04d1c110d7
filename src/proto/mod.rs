//! proto
//!
//! The coordination protocol's wire format, limited to what the server,
//! the bridge and `zkctl` exchange.
//!
//! # Modules
//!
//! - `types`: requests, responses, stats, ACLs, error codes
//! - `codec`: jute encoding and decoding
//! - `frame`: length-prefixed framing over async streams

pub mod codec;
pub mod frame;
mod types;

pub use codec::CodecError;
pub use types::*;
