//! Bootstrap conduits (C8) for `gasnet-core`.
//!
//! [`tcp::TcpBootstrap`] is the real out-of-band conduit: a star topology
//! rooted at node 0, used only to get every node's RDMA address data
//! exchanged once at `attach` time — it never touches the data path.
//! [`loopback::LoopbackBootstrap`] runs a multi-node job in one process
//! (several simulated nodes sharing a [`gasnet_core::transport::sim::Fabric`]),
//! for integration tests that need more than one node without real sockets.

pub mod loopback;
pub mod tcp;
