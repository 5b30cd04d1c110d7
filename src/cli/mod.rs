//! cli
//!
//! Command-line entry points for both binaries.
//!
//! # Responsibilities
//!
//! - Parse arguments and install the log subscriber
//! - Resolve configuration before any socket is opened
//! - Hand off to [`crate::server`] (`zetcd`) or a client session (`zkctl`)
//!
//! Nothing here knows about personalities beyond
//! [`crate::personality::from_config`].

pub mod args;
pub mod ctl;
pub mod serve;

pub use args::{CtlArgs, CtlCommand, ServeArgs, Shell};
