//! zetcd - a ZooKeeper personality over a flat, etcd-style keyspace
//!
//! zetcd speaks the ZooKeeper client protocol and serves it from one of
//! three personalities:
//!
//! - backend: the hierarchical tree is stored in an etcd v3 keyspace
//! - bridge: sessions are forwarded to an upstream ensemble
//! - oracle: both run side by side and their answers are cross-checked
//!
//! # Architecture
//!
//! - [`cli`] - argument parsing and the two binaries' entry points
//! - [`config`] - file and flag configuration, resolved to one mode
//! - [`server`] - accept loop and per-session dispatch
//! - [`personality`] - capability traits and personality construction
//! - [`backend`] - the protocol over a flat keyspace (etcd or in-memory)
//! - [`bridge`] - forwarding to an upstream ensemble
//! - [`oracle`] - reference/candidate cross-checking
//! - [`proto`] - wire types, codec and framing
//! - [`core`] - path validation and key encoding
//! - [`telemetry`] - log subscriber setup
//!
//! # Guarantees
//!
//! 1. Requests of one session are answered in the order they arrive
//! 2. Every write to the keyspace is a compare-and-swap transaction
//! 3. Ephemeral nodes do not outlive their session
//! 4. An oracle never lets the candidate's answer reach the client

pub mod backend;
pub mod bridge;
pub mod cli;
pub mod config;
pub mod core;
pub mod oracle;
pub mod personality;
pub mod proto;
pub mod server;
pub mod telemetry;
