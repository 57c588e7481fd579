//! Bootstrap adapter (C8): the thin trait the core depends on for job
//! spawn, initial address exchange, and the handful of blocking collectives
//! it needs (spec §1, §4.2, §6). Concrete implementations — a real
//! out-of-band TCP bootstrap, or an in-process one for tests — live in the
//! `gasnet-bootstrap` crate; this crate only sees the trait, the same way
//! `rpc_protocol` only sees `Transport`-style traits and never a concrete
//! socket type in its core logic.

use crate::error::Result;

/// A handful of blocking collectives over the job's fixed node set. Every
/// method is collective: all nodes must call it, in the same order, or the
/// job deadlocks — exactly the restriction real GASNet bootstrap conduits
/// document.
pub trait Bootstrap: Send + Sync {
    fn num_nodes(&self) -> u32;
    fn my_node(&self) -> u32;

    /// Block until every node has called `barrier`.
    fn barrier(&self);

    /// Gather one fixed-size record from every node, return all `N` in node
    /// order (spec §4.2's address-exchange all-to-all is one `exchange`
    /// call with a `PeerAddr`-sized record).
    fn exchange(&self, mine: &[u8]) -> Result<Vec<Vec<u8>>>;

    /// Broadcast `data` from `root`; every node (including root) gets the
    /// same bytes back.
    fn broadcast(&self, root: u32, data: &[u8]) -> Result<Vec<u8>>;

    /// Each node contributes one record of `mine.len()` bytes; every node
    /// gets back one record from every other node, indexed by source node
    /// (an alltoall, as distinct from `exchange` which assumes uniform
    /// fixed-size records known in advance — here sizes may differ by
    /// sender and are carried alongside the payload).
    fn alltoall(&self, mine: &[u8]) -> Result<Vec<Vec<u8>>>;
}

#[cfg(test)]
pub(crate) mod test_support {
    //! A trivial single-process `Bootstrap` used only by this crate's own
    //! unit tests that need *a* bootstrap but aren't testing bootstrap
    //! itself (real multi-node bootstrap tests live in `gasnet-bootstrap`).
    use super::*;

    pub struct SoloBootstrap;

    impl Bootstrap for SoloBootstrap {
        fn num_nodes(&self) -> u32 {
            1
        }
        fn my_node(&self) -> u32 {
            0
        }
        fn barrier(&self) {}
        fn exchange(&self, mine: &[u8]) -> Result<Vec<Vec<u8>>> {
            Ok(vec![mine.to_vec()])
        }
        fn broadcast(&self, _root: u32, data: &[u8]) -> Result<Vec<u8>> {
            Ok(data.to_vec())
        }
        fn alltoall(&self, mine: &[u8]) -> Result<Vec<Vec<u8>>> {
            Ok(vec![mine.to_vec()])
        }
    }
}
