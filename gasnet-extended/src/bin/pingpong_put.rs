//! Scenario 2 from spec §8: node 0 puts a buffer into node 1's segment,
//! waits for completion, node 1 puts it back, repeated a few times. Runs
//! two simulated nodes over the loopback fabric, each on its own thread.

use std::thread;

use gasnet_bootstrap::loopback::LoopbackJob;
use gasnet_core::config::Config;
use gasnet_core::endpoint::Endpoint;
use gasnet_core::transport::sim::Fabric;
use gasnet_extended::explicit::{put_nb, wait_syncnb};

const SEGMENT_LEN: u64 = 4096;
const ROUNDS: u32 = 8;

fn main() {
    env_logger::init();

    let fabric = Fabric::new();
    let job = LoopbackJob::new(2);

    let handles: Vec<_> = (0..2u32)
        .map(|rank| {
            let transport = fabric.node();
            let bootstrap = job.node(rank);
            thread::spawn(move || {
                let endpoint =
                    Endpoint::attach(Box::new(bootstrap), transport, Config::default(), SEGMENT_LEN, 1, vec![])
                        .expect("attach");
                let peer = 1 - endpoint.my_node();
                let dst_base = endpoint.segment_table().get(peer).base;

                let mut payload = vec![endpoint.my_node() as u8; 64];
                for round in 0..ROUNDS {
                    unsafe {
                        let h = put_nb(endpoint.engine(), peer, dst_base, payload.as_ptr(), payload.len(), None);
                        wait_syncnb(endpoint.engine(), h);
                    }
                    payload[0] = payload[0].wrapping_add(1);
                    log::debug!("node {}: round {round} put complete", endpoint.my_node());
                }
                println!("node {}: completed {ROUNDS} put rounds", endpoint.my_node());

                endpoint.exit(0);
                endpoint.finalize();
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
}
