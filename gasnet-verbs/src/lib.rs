//! Safe wrapper over the InfiniBand verbs surface (`libibverbs` via
//! `rdma-sys`) used by `gasnet-core::engine` and `gasnet-core::connection`.
//!
//! This crate knows nothing about Active Messages, credits, or firehoses —
//! it only exposes queue pairs, completion queues, and memory regions.
//! Everything GASNet-specific lives in `gasnet-core`, generic over the
//! `gasnet_core::transport::Transport` trait that this crate implements.

pub mod context;
pub mod cq;
pub mod error;
pub mod mr;
pub mod pd;
pub mod qp;

pub use context::{Context, Gid};
pub use cq::{Cq, Wc, WcOpcode, WcStatus};
pub use error::{Error, Result};
pub use mr::Mr;
pub use pd::Pd;
pub use qp::{Qp, QpCaps, QpEndpoint, QpState, QpType};
