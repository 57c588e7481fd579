//! In-process bootstrap for multi-node integration tests: every simulated
//! node runs in the same process (typically alongside a shared
//! `gasnet_core::transport::sim::Fabric`), so collectives are a
//! generation-counted rendezvous over a `Mutex`/`Condvar` instead of sockets.

use std::sync::{Arc, Condvar, Mutex};

use gasnet_core::bootstrap::Bootstrap;
use gasnet_core::error::Result;

struct RendState {
    generation: u64,
    arrived: usize,
    records: Vec<Vec<u8>>,
    result: Vec<Vec<u8>>,
}

/// One generation-counted barrier that every node's call passes through,
/// each contributing a record and all leaving with the same assembled set —
/// the in-process analogue of `tcp::TcpBootstrap`'s `collect_at_root`.
struct Rendezvous {
    num_nodes: usize,
    state: Mutex<RendState>,
    cond: Condvar,
}

impl Rendezvous {
    fn new(num_nodes: usize) -> Self {
        Rendezvous {
            num_nodes,
            state: Mutex::new(RendState {
                generation: 0,
                arrived: 0,
                records: vec![Vec::new(); num_nodes],
                result: Vec::new(),
            }),
            cond: Condvar::new(),
        }
    }

    fn collect(&self, my_node: usize, mine: &[u8]) -> Vec<Vec<u8>> {
        let mut guard = self.state.lock().unwrap();
        let gen = guard.generation;
        guard.records[my_node] = mine.to_vec();
        guard.arrived += 1;
        if guard.arrived == self.num_nodes {
            guard.result = std::mem::replace(&mut guard.records, vec![Vec::new(); self.num_nodes]);
            guard.arrived = 0;
            guard.generation += 1;
            self.cond.notify_all();
        } else {
            while guard.generation == gen {
                guard = self.cond.wait(guard).unwrap();
            }
        }
        guard.result.clone()
    }
}

/// A job of `num_nodes` in-process nodes sharing one [`Rendezvous`].
pub struct LoopbackJob {
    rendezvous: Arc<Rendezvous>,
    num_nodes: u32,
}

impl LoopbackJob {
    pub fn new(num_nodes: u32) -> Self {
        LoopbackJob { rendezvous: Arc::new(Rendezvous::new(num_nodes as usize)), num_nodes }
    }

    /// One node's `Bootstrap` handle. Call once per rank, `0..num_nodes`.
    pub fn node(&self, my_node: u32) -> LoopbackBootstrap {
        assert!(my_node < self.num_nodes);
        LoopbackBootstrap { rendezvous: self.rendezvous.clone(), my_node, num_nodes: self.num_nodes }
    }
}

pub struct LoopbackBootstrap {
    rendezvous: Arc<Rendezvous>,
    my_node: u32,
    num_nodes: u32,
}

impl Bootstrap for LoopbackBootstrap {
    fn num_nodes(&self) -> u32 {
        self.num_nodes
    }

    fn my_node(&self) -> u32 {
        self.my_node
    }

    fn barrier(&self) {
        self.rendezvous.collect(self.my_node as usize, &[]);
    }

    fn exchange(&self, mine: &[u8]) -> Result<Vec<Vec<u8>>> {
        Ok(self.rendezvous.collect(self.my_node as usize, mine))
    }

    fn broadcast(&self, root: u32, data: &[u8]) -> Result<Vec<u8>> {
        let mine = if self.my_node == root { data } else { &[] };
        let records = self.rendezvous.collect(self.my_node as usize, mine);
        Ok(records[root as usize].clone())
    }

    fn alltoall(&self, mine: &[u8]) -> Result<Vec<Vec<u8>>> {
        Ok(self.rendezvous.collect(self.my_node as usize, mine))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn exchange_delivers_every_node_its_neighbors_record() {
        let job = LoopbackJob::new(4);
        let handles: Vec<_> = (0..4)
            .map(|rank| {
                let bootstrap = job.node(rank);
                thread::spawn(move || {
                    let mine = vec![rank as u8];
                    let all = bootstrap.exchange(&mine).unwrap();
                    assert_eq!(all.len(), 4);
                    for (i, rec) in all.iter().enumerate() {
                        assert_eq!(rec, &vec![i as u8]);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn barrier_releases_only_once_every_node_arrives() {
        let job = LoopbackJob::new(3);
        let order = Arc::new(Mutex::new(Vec::new()));
        let handles: Vec<_> = (0..3)
            .map(|rank| {
                let bootstrap = job.node(rank);
                let order = order.clone();
                thread::spawn(move || {
                    order.lock().unwrap().push(rank);
                    bootstrap.barrier();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(order.lock().unwrap().len(), 3);
    }

    #[test]
    fn broadcast_fans_out_the_roots_payload() {
        let job = LoopbackJob::new(3);
        let handles: Vec<_> = (0..3)
            .map(|rank| {
                let bootstrap = job.node(rank);
                thread::spawn(move || {
                    let data = if rank == 1 { b"from root".to_vec() } else { Vec::new() };
                    let got = bootstrap.broadcast(1, &data).unwrap();
                    assert_eq!(got, b"from root");
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }
}
