//! Connection manager (C4, spec §4.2): per-peer QP lifecycle, address
//! exchange, and the RESET→INIT→RTR→RTS state machine.

use std::sync::Mutex;

use crate::bootstrap::Bootstrap;
use crate::error::{fatal, Result};
use crate::segment::NodeId;
use crate::sync::Semaphore;
use crate::transport::{PeerAddr, Transport};

/// Per-peer QP lifecycle state. Transitions strictly left to right (spec
/// §4.2's diagram); going backwards or skipping a state is a logic bug.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Reset,
    Init,
    Rtr,
    Rts,
}

/// One peer's connection record (spec §3 "Connection record (per peer)").
/// Invariant: both credit semaphores never exceed their initial allocation
/// (checked by [`Semaphore::is_conserved`] in the testable-properties
/// suite).
pub struct Connection<T: Transport> {
    pub qp: T::Qp,
    pub state: Mutex<ConnState>,
    pub send_credits: Semaphore,
    pub am_credits: Semaphore,
    pub remote_rkey: Mutex<u32>,
    pub peer_addr: Mutex<PeerAddr>,
}

impl<T: Transport> Connection<T> {
    fn new(qp: T::Qp, network_depth: u32) -> Self {
        Connection {
            qp,
            state: Mutex::new(ConnState::Reset),
            send_credits: Semaphore::new(network_depth),
            am_credits: Semaphore::new(network_depth),
            remote_rkey: Mutex::new(0),
            peer_addr: Mutex::new(PeerAddr::default()),
        }
    }

    pub fn state(&self) -> ConnState {
        *self.state.lock().unwrap()
    }
}

/// Port-striping tie-break (spec §4.2): logical QP `i` to a peer uses port
/// `i mod num_ports` on both ends, computed independently and identically
/// by both sides.
pub fn port_for_qp(qp_index: usize, num_ports: u8) -> u8 {
    (qp_index % num_ports.max(1) as usize) as u8
}

/// Drives every peer's QP through RESET→INIT→RTR→RTS via one bootstrap
/// all-to-all of address records plus a closing barrier (spec §4.2).
pub struct ConnectionManager<T: Transport> {
    transport: T,
    connections: Vec<Connection<T>>,
    num_ports: u8,
}

impl<T: Transport> ConnectionManager<T> {
    /// Create (but do not yet connect) one QP per peer, including a
    /// loopback-shaped entry for `self` (never transitioned past `Reset` —
    /// self-traffic takes the AM self-loop path in spec §4.5 and never
    /// touches a QP).
    pub fn new(transport: T, num_nodes: u32, network_depth: u32, num_ports: u8) -> Self {
        let connections = (0..num_nodes)
            .map(|_| {
                let qp = transport.create_qp();
                Connection::new(qp, network_depth)
            })
            .collect();
        ConnectionManager {
            transport,
            connections,
            num_ports,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn connection(&self, peer: NodeId) -> &Connection<T> {
        &self.connections[peer as usize]
    }

    /// Run the collective connect sequence described in spec §4.2: address
    /// exchange, then drive every non-self peer to `Rts`, then a closing
    /// barrier "so no side posts before the other is RTR".
    pub fn connect_all(&self, bootstrap: &dyn Bootstrap, port_num: u8, local_psn: u32) -> Result<()> {
        let my_node = bootstrap.my_node();

        for (i, conn) in self.connections.iter().enumerate() {
            if i as u32 == my_node {
                continue;
            }
            self.transport.modify_to_init(&conn.qp, port_num);
            *conn.state.lock().unwrap() = ConnState::Init;
        }

        let mut mine = Vec::with_capacity(self.connections.len());
        for conn in &self.connections {
            mine.push(self.transport.local_addr(&conn.qp));
        }
        let encoded = encode_addrs(&mine);
        let all = bootstrap.exchange(&encoded)?;

        for (i, conn) in self.connections.iter().enumerate() {
            if i as u32 == my_node {
                continue;
            }
            let peer_addrs = decode_addrs(&all[i]);
            let peer_addr = peer_addrs
                .get(my_node as usize)
                .copied()
                .unwrap_or_else(|| fatal("connect_all", "peer did not publish an address for us"));

            self.transport.modify_to_rtr(&conn.qp, peer_addr);
            *conn.peer_addr.lock().unwrap() = peer_addr;
            *conn.state.lock().unwrap() = ConnState::Rtr;

            self.transport.modify_to_rts(&conn.qp, local_psn);
            *conn.state.lock().unwrap() = ConnState::Rts;
        }

        bootstrap.barrier();
        Ok(())
    }

    pub fn num_ports(&self) -> u8 {
        self.num_ports
    }

    pub fn num_peers(&self) -> usize {
        self.connections.len()
    }
}

fn encode_addrs(addrs: &[PeerAddr]) -> Vec<u8> {
    let mut out = Vec::with_capacity(addrs.len() * 11);
    for a in addrs {
        out.extend_from_slice(&a.lid.to_le_bytes());
        out.extend_from_slice(&a.qpn.to_le_bytes());
        out.extend_from_slice(&a.psn.to_le_bytes());
        out.push(a.port_num);
    }
    out
}

fn decode_addrs(bytes: &[u8]) -> Vec<PeerAddr> {
    bytes
        .chunks_exact(11)
        .map(|c| PeerAddr {
            lid: u16::from_le_bytes([c[0], c[1]]),
            qpn: u32::from_le_bytes([c[2], c[3], c[4], c[5]]),
            psn: u32::from_le_bytes([c[6], c[7], c[8], c[9]]),
            port_num: c[10],
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_striping_is_a_pure_deterministic_mapping() {
        assert_eq!(port_for_qp(0, 2), 0);
        assert_eq!(port_for_qp(1, 2), 1);
        assert_eq!(port_for_qp(2, 2), 0);
        assert_eq!(port_for_qp(5, 4), 1);
    }

    #[test]
    fn addr_round_trips_through_wire_encoding() {
        let addrs = vec![
            PeerAddr { lid: 1, qpn: 2, psn: 3, port_num: 1 },
            PeerAddr { lid: 7, qpn: 900, psn: 12345, port_num: 2 },
        ];
        let decoded = decode_addrs(&encode_addrs(&addrs));
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[1].qpn, 900);
        assert_eq!(decoded[1].psn, 12345);
    }

    #[test]
    fn connect_all_over_loopback_reaches_rts() {
        use crate::bootstrap::test_support::SoloBootstrap;
        use crate::transport::sim::Fabric;

        let fabric = Fabric::new();
        let node = fabric.node();
        let mgr = ConnectionManager::new(node, 1, 16, 1);
        let bootstrap = SoloBootstrap;
        mgr.connect_all(&bootstrap, 1, 0).unwrap();
        // Single-node job: the only "connection" is the self entry, which
        // `connect_all` deliberately skips, so it stays in `Reset`.
        assert_eq!(mgr.connection(0).state(), ConnState::Reset);
    }
}
