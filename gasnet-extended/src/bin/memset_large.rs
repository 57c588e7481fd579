//! Scenario 3 from spec §8: node 0 issues a memset against node 1's segment
//! large enough to cross `MEMSET_PUT_LIMIT`, exercising the AM-driven large
//! path in `gasnet_extended::memset` rather than the chunked-RDMA-put small
//! path. Runs two simulated nodes over the loopback fabric.

use std::thread;

use gasnet_bootstrap::loopback::LoopbackJob;
use gasnet_core::config::Config;
use gasnet_core::endpoint::Endpoint;
use gasnet_core::transport::sim::Fabric;
use gasnet_extended::explicit::{memset_nb, wait_syncnb};

const SEGMENT_LEN: u64 = (gasnet_core::config::MEMSET_PUT_LIMIT as u64) * 2;

fn main() {
    env_logger::init();

    let fabric = Fabric::new();
    let job = LoopbackJob::new(2);

    let handles: Vec<_> = (0..2u32)
        .map(|rank| {
            let transport = fabric.node();
            let bootstrap = job.node(rank);
            thread::spawn(move || {
                let endpoint = Endpoint::attach(
                    Box::new(bootstrap),
                    transport,
                    Config::default(),
                    SEGMENT_LEN,
                    1,
                    gasnet_extended::handlers(),
                )
                .expect("attach");

                if endpoint.my_node() == 0 {
                    let len = gasnet_core::config::MEMSET_PUT_LIMIT + 8192;
                    let dst_base = endpoint.segment_table().get(1).base;
                    unsafe {
                        let h = memset_nb(endpoint.engine(), 1, dst_base, 0x7E, len);
                        wait_syncnb(endpoint.engine(), h);
                    }
                    println!("node 0: large memset of {len} bytes on node 1 completed");
                } else {
                    // Service node 0's AM-driven memset request.
                    for _ in 0..256 {
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
