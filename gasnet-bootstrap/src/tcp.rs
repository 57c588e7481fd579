//! Out-of-band TCP bootstrap: a star topology rooted at node 0.
//!
//! Every collective funnels through one primitive, `collect_at_root`: each
//! leaf sends one record to the root, the root assembles all `N` records (its
//! own plus every leaf's, placed by rank) and fans the assembled set back out.
//! `exchange`, `alltoall`, `broadcast`, and `barrier` are all this primitive
//! with a different choice of what each node contributes and which part of
//! the result it keeps — there's exactly one network rendezvous pattern in
//! this file, not four.
//!
//! Framing borrows the shape of `rpc_protocol`'s record-mark scheme (a
//! length prefix ahead of each message) without its RPC call/reply semantics,
//! since a bootstrap collective has no notion of a procedure number or a
//! transaction id — just "my record" and "the assembled result".

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Mutex;

use gasnet_core::error::{fatal, Result};

enum Role {
    /// Node 0: one persistent connection per other node, indexed by
    /// `rank - 1`.
    Root { peers: Vec<Mutex<TcpStream>> },
    /// Any other node: one persistent connection to node 0.
    Leaf { root: Mutex<TcpStream> },
}

pub struct TcpBootstrap {
    my_node: u32,
    num_nodes: u32,
    role: Role,
}

impl TcpBootstrap {
    /// Call on node 0: listen on `listen_addr` and accept exactly
    /// `num_nodes - 1` connections, each announcing its rank as the first
    /// four bytes written.
    pub fn root(listen_addr: SocketAddr, num_nodes: u32) -> io::Result<Self> {
        let listener = TcpListener::bind(listen_addr)?;
        let mut peers: Vec<Option<Mutex<TcpStream>>> = (0..num_nodes - 1).map(|_| None).collect();
        for _ in 0..num_nodes - 1 {
            let (mut stream, _) = listener.accept()?;
            stream.set_nodelay(true)?;
            let rank = read_u32(&mut stream)?;
            peers[rank as usize - 1] = Some(Mutex::new(stream));
        }
        let peers = peers
            .into_iter()
            .map(|p| p.expect("every rank 1..num_nodes announced itself"))
            .collect();
        Ok(TcpBootstrap { my_node: 0, num_nodes, role: Role::Root { peers } })
    }

    /// Call on any node other than 0: connect to the root and announce
    /// `my_node`.
    pub fn leaf(root_addr: SocketAddr, my_node: u32, num_nodes: u32) -> io::Result<Self> {
        assert!(my_node != 0, "node 0 is the conduit root; call TcpBootstrap::root instead");
        let mut stream = TcpStream::connect(root_addr)?;
        stream.set_nodelay(true)?;
        write_u32(&mut stream, my_node)?;
        Ok(TcpBootstrap { my_node, num_nodes, role: Role::Leaf { root: Mutex::new(stream) } })
    }

    /// Gather `mine` from every node, placed at its rank, fanned back out to
    /// all. The one network rendezvous every collective below reduces to.
    fn collect_at_root(&self, mine: &[u8]) -> Vec<Vec<u8>> {
        match &self.role {
            Role::Root { peers } => {
                let mut records = vec![Vec::new(); self.num_nodes as usize];
                records[0] = mine.to_vec();
                for (i, peer) in peers.iter().enumerate() {
                    let mut s = peer.lock().unwrap();
                    records[i + 1] = recv_frame(&mut *s)
                        .unwrap_or_else(|e| fatal("tcp bootstrap collect", e));
                }
                let encoded = encode_records(&records);
                for peer in peers {
                    let mut s = peer.lock().unwrap();
                    send_frame(&mut *s, &encoded).unwrap_or_else(|e| fatal("tcp bootstrap fan-out", e));
                }
                records
            }
            Role::Leaf { root } => {
                let mut s = root.lock().unwrap();
                send_frame(&mut *s, mine).unwrap_or_else(|e| fatal("tcp bootstrap contribute", e));
                let reply = recv_frame(&mut *s).unwrap_or_else(|e| fatal("tcp bootstrap reply", e));
                decode_records(&reply)
            }
        }
    }
}

impl gasnet_core::bootstrap::Bootstrap for TcpBootstrap {
    fn num_nodes(&self) -> u32 {
        self.num_nodes
    }

    fn my_node(&self) -> u32 {
        self.my_node
    }

    fn barrier(&self) {
        self.collect_at_root(&[]);
    }

    fn exchange(&self, mine: &[u8]) -> Result<Vec<Vec<u8>>> {
        Ok(self.collect_at_root(mine))
    }

    fn broadcast(&self, root: u32, data: &[u8]) -> Result<Vec<u8>> {
        let mine = if self.my_node == root { data } else { &[] };
        let records = self.collect_at_root(mine);
        Ok(records[root as usize].clone())
    }

    fn alltoall(&self, mine: &[u8]) -> Result<Vec<Vec<u8>>> {
        Ok(self.collect_at_root(mine))
    }
}

fn read_u32(stream: &mut TcpStream) -> io::Result<u32> {
    let mut bytes = [0u8; 4];
    stream.read_exact(&mut bytes)?;
    Ok(u32::from_be_bytes(bytes))
}

fn write_u32(stream: &mut TcpStream, v: u32) -> io::Result<()> {
    stream.write_all(&v.to_be_bytes())
}

fn send_frame(stream: &mut TcpStream, payload: &[u8]) -> io::Result<()> {
    write_u32(stream, payload.len() as u32)?;
    stream.write_all(payload)
}

fn recv_frame(stream: &mut TcpStream) -> io::Result<Vec<u8>> {
    let len = read_u32(stream)? as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf)?;
    Ok(buf)
}

fn encode_records(records: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(records.len() as u32).to_be_bytes());
    for r in records {
        out.extend_from_slice(&(r.len() as u32).to_be_bytes());
        out.extend_from_slice(r);
    }
    out
}

fn decode_records(bytes: &[u8]) -> Vec<Vec<u8>> {
    let count = u32::from_be_bytes(bytes[0..4].try_into().unwrap()) as usize;
    let mut out = Vec::with_capacity(count);
    let mut off = 4;
    for _ in 0..count {
        let len = u32::from_be_bytes(bytes[off..off + 4].try_into().unwrap()) as usize;
        off += 4;
        out.push(bytes[off..off + len].to_vec());
        off += len;
    }
    out
}
