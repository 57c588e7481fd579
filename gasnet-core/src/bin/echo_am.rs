//! Scenario 1 from spec §8: node 0 sends an AM Short request to node 1,
//! node 1's handler replies, node 0 observes the reply. Runs two simulated
//! nodes over the loopback fabric, each on its own thread.
//!
//! The bootstrap here is a minimal two-node rendezvous defined locally
//! rather than pulling in `gasnet-bootstrap` (which itself depends on this
//! crate — a demo binary living inside `gasnet-core` can't take that crate
//! as a normal dependency without a cycle; `gasnet-bootstrap`'s own
//! `LoopbackJob` is the one to reach for from outside this crate, as the
//! `gasnet-extended` demos do).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use gasnet_core::am::{AmToken, HandlerRange};
use gasnet_core::bootstrap::Bootstrap;
use gasnet_core::config::Config;
use gasnet_core::endpoint::Endpoint;
use gasnet_core::error::Result;
use gasnet_core::transport::sim::Fabric;

const ECHO_HANDLER: u8 = 200;

static REPLY_SEEN: AtomicBool = AtomicBool::new(false);

fn echo_handler(token: &AmToken<'_>, args: &[u32]) {
    log::debug!("echo handler invoked with args {:?}", args);
    if token.is_request() {
        token.reply(args, &[]);
    } else {
        REPLY_SEEN.store(true, Ordering::Release);
    }
}

/// A bootstrap for exactly two nodes, synchronized by a shared `Barrier`.
/// Good enough for this one demo; `gasnet-bootstrap::loopback::LoopbackJob`
/// generalizes this to N nodes for everything else in the workspace.
struct TwoNodeBootstrap {
    my_node: u32,
    barrier: Arc<Barrier>,
    peer_record: Arc<std::sync::Mutex<[Vec<u8>; 2]>>,
}

impl Bootstrap for TwoNodeBootstrap {
    fn num_nodes(&self) -> u32 {
        2
    }

    fn my_node(&self) -> u32 {
        self.my_node
    }

    fn barrier(&self) {
        self.barrier.wait();
    }

    fn exchange(&self, mine: &[u8]) -> Result<Vec<Vec<u8>>> {
        self.peer_record.lock().unwrap()[self.my_node as usize] = mine.to_vec();
        self.barrier.wait();
        let snapshot = self.peer_record.lock().unwrap().clone();
        self.barrier.wait();
        Ok(snapshot.to_vec())
    }

    fn broadcast(&self, root: u32, data: &[u8]) -> Result<Vec<u8>> {
        let all = self.exchange(if self.my_node == root { data } else { &[] })?;
        Ok(all[root as usize].clone())
    }

    fn alltoall(&self, mine: &[u8]) -> Result<Vec<Vec<u8>>> {
        self.exchange(mine)
    }
}

fn main() {
    env_logger::init();

    let fabric = Fabric::new();
    let barrier = Arc::new(Barrier::new(2));
    let peer_record = Arc::new(std::sync::Mutex::new([Vec::new(), Vec::new()]));

    let handles: Vec<_> = (0..2u32)
        .map(|rank| {
            let transport = fabric.node();
            let bootstrap = TwoNodeBootstrap { my_node: rank, barrier: barrier.clone(), peer_record: peer_record.clone() };
            thread::spawn(move || {
                let endpoint = Endpoint::attach(
                    Box::new(bootstrap),
                    transport,
                    Config::default(),
                    1,
                    1,
                    vec![(ECHO_HANDLER, HandlerRange::Client, echo_handler)],
                )
                .expect("attach");

                if endpoint.my_node() == 0 {
                    endpoint.am_request_short(1, ECHO_HANDLER, &[42]).expect("send echo request");
                    while !REPLY_SEEN.load(Ordering::Acquire) {
                        endpoint.am_poll();
                        thread::yield_now();
                    }
                    println!("node 0: echo request to node 1 acknowledged");
                } else {
                    for _ in 0..64 {
                        endpoint.am_poll();
                        thread::yield_now();
                    }
                }

                endpoint.exit(0);
                endpoint.finalize();
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
}
