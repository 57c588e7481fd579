//! GASNet Core: Active Messages, job bootstrap, segment registration, and
//! handler-safe locks over a reliable RDMA fabric.
//!
//! [`endpoint::Endpoint`] is the process-wide context object described in
//! the design notes ("encapsulate global mutable state in one object
//! constructed at init and destroyed at finalize"); everything else in this
//! crate is a component it wires together.

pub mod am;
pub mod bootstrap;
pub mod buffer;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod firehose;
pub mod segment;
pub mod sync;
pub mod trace;
pub mod transport;

pub use endpoint::Endpoint;
pub use error::{Error, Result};
