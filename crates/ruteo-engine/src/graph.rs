//! The connection graph and its scheduler.
//!
//! Everything here runs under the engine's graph lock. A change to the
//! set of active clients or connections triggers [`Graph::sort`]: feed
//! sets are rebuilt from scratch, closed transitively, the client list is
//! re-ordered topologically (driver last, stable otherwise), and the
//! chain is re-threaded through the wakeup FIFOs. The chain is never
//! patched incrementally — a cycle sees the old order or the new one,
//! never a mix.

use std::collections::HashMap;

use tracing::debug;

use ruteo_core::shm_layout::ClientKind;
use ruteo_core::{ClientId, PortId};

use crate::client::InternalClient;
use crate::error::EngineError;
use crate::fifo::FifoSet;
use crate::scope::MixBuffer;

/// A directed edge from an output port to an input port.
///
/// Owner ids are cached so feed queries never touch the port table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connection {
    /// Source (output) port.
    pub src_port: PortId,
    /// Destination (input) port.
    pub dst_port: PortId,
    /// Owner of the source port.
    pub src_client: ClientId,
    /// Owner of the destination port.
    pub dst_client: ClientId,
}

/// The mutable graph state: clients in chain order plus the edges.
pub struct Graph {
    /// All clients; after [`Graph::sort`] the order is the chain.
    pub clients: Vec<InternalClient>,
    /// Every connection; each edge appears exactly once and is queried
    /// from both ends.
    pub connections: Vec<Connection>,
    /// Engine-side mix buffers for fan-in inputs of in-process clients.
    pub mix_buffers: HashMap<PortId, MixBuffer>,
    /// The transport timebase client, if any.
    pub timebase: Option<ClientId>,
    /// Active external clients; also the next FIFO number to create.
    pub external_count: u32,
}

impl Graph {
    /// An empty graph.
    pub fn new() -> Self {
        Self {
            clients: Vec::new(),
            connections: Vec::new(),
            mix_buffers: HashMap::new(),
            timebase: None,
            external_count: 0,
        }
    }

    /// Find a client by id.
    pub fn client(&self, id: ClientId) -> Option<&InternalClient> {
        self.clients.iter().find(|c| c.id() == id)
    }

    /// Find a client by id, mutably.
    pub fn client_mut(&mut self, id: ClientId) -> Option<&mut InternalClient> {
        self.clients.iter_mut().find(|c| c.id() == id)
    }

    /// Find a client by name.
    pub fn client_by_name(&self, name: &str) -> Option<&InternalClient> {
        self.clients.iter().find(|c| c.control.name() == name)
    }

    /// Connections arriving at `port`.
    pub fn sources_of(&self, port: PortId) -> impl Iterator<Item = &Connection> {
        self.connections.iter().filter(move |c| c.dst_port == port)
    }

    /// Number of connections into `port`.
    pub fn fan_in(&self, port: PortId) -> usize {
        self.sources_of(port).count()
    }

    /// All connections touching `port`, either end.
    pub fn connections_of(&self, port: PortId) -> Vec<Connection> {
        self.connections
            .iter()
            .filter(|c| c.src_port == port || c.dst_port == port)
            .copied()
            .collect()
    }

    /// Does any port of `src` connect into `dst`? Direct feeds only.
    pub fn feeds(&self, src: ClientId, dst: ClientId) -> bool {
        self.connections
            .iter()
            .any(|c| c.src_client == src && c.dst_client == dst)
    }

    /// Would adding an edge `src_client -> dst_client` close a loop?
    ///
    /// True when `dst_client` already (transitively) feeds `src_client`.
    /// A client looping onto itself is allowed — it reads its own
    /// previous period, which deadlocks nothing.
    pub fn would_cycle(&self, src_client: ClientId, dst_client: ClientId) -> bool {
        if src_client == dst_client {
            return false;
        }
        let mut stack = vec![dst_client];
        let mut visited = Vec::new();
        while let Some(c) = stack.pop() {
            if c == src_client {
                return true;
            }
            if visited.contains(&c) {
                continue;
            }
            visited.push(c);
            for conn in &self.connections {
                if conn.src_client == c {
                    stack.push(conn.dst_client);
                }
            }
        }
        false
    }

    /// Rebuild feed sets, re-sort the chain and re-thread the FIFOs.
    ///
    /// Returns the clients whose `(rank, successor)` changed and must be
    /// told their new order.
    pub fn sort(&mut self, fifos: &mut FifoSet) -> Result<Vec<(ClientId, u32)>, EngineError> {
        self.build_fed_by();
        self.order_clients();
        self.rechain(fifos)
    }

    /// Direct feed sets, then the transitive closure.
    fn build_fed_by(&mut self) {
        let ids: Vec<ClientId> = self.clients.iter().map(InternalClient::id).collect();

        for client in &mut self.clients {
            client.fed_by.clear();
        }
        for &dst in &ids {
            for &src in &ids {
                if self.feeds(src, dst) {
                    self.client_mut(dst).unwrap().fed_by.push(src);
                }
            }
        }

        // Transitive closure: everyone feeding my feeder feeds me. The
        // visited set keeps the traversal finite even over a self-loop.
        for &id in &ids {
            let mut acc = self.client(id).unwrap().fed_by.clone();
            let mut stack = acc.clone();
            let mut visited = vec![id];
            while let Some(c) = stack.pop() {
                if visited.contains(&c) {
                    continue;
                }
                visited.push(c);
                for f in self.client(c).map(|c| c.fed_by.clone()).unwrap_or_default() {
                    if !acc.contains(&f) {
                        acc.push(f);
                        stack.push(f);
                    }
                }
            }
            self.client_mut(id).unwrap().fed_by = acc;
        }
    }

    /// Stable topological order over the transitive feed sets; the driver
    /// goes last, clients with no ordering between them keep their
    /// relative positions.
    fn order_clients(&mut self) {
        let n = self.clients.len();
        let mut placed: Vec<InternalClient> = Vec::with_capacity(n);
        let mut remaining: Vec<InternalClient> = std::mem::take(&mut self.clients);

        while !remaining.is_empty() {
            let next = remaining
                .iter()
                .position(|c| {
                    // The driver feeds everyone but is still forced last,
                    // so it neither blocks anyone nor places early.
                    c.control.kind() != ClientKind::Driver
                        && !remaining.iter().any(|other| {
                            other.id() != c.id()
                                && other.control.kind() != ClientKind::Driver
                                && c.fed_by.contains(&other.id())
                        })
                })
                // All remaining clients are drivers (or an impossible
                // loop survived validation): take them in current order.
                .unwrap_or(0);
            placed.push(remaining.remove(next));
        }

        self.clients = placed;
    }

    /// Walk the sorted list, assigning subgraph FIFOs.
    ///
    /// An external client starting a subgraph gets `fifo-<rank>` as its
    /// start fd; the subgraph's wait fd is the FIFO after its last
    /// external member. Only clients whose `(rank, successor)` actually
    /// changed are reported for notification.
    fn rechain(&mut self, fifos: &mut FifoSet) -> Result<Vec<(ClientId, u32)>, EngineError> {
        let mut notify = Vec::new();
        let mut rank: u32 = 0;
        let mut subgraph_head: Option<usize> = None;

        let successors: Vec<Option<ClientId>> = {
            let active: Vec<usize> = (0..self.clients.len())
                .filter(|&i| self.clients[i].control.active())
                .collect();
            let mut out = vec![None; self.clients.len()];
            for pair in active.windows(2) {
                out[pair[0]] = Some(self.clients[pair[1]].id());
            }
            out
        };

        for i in 0..self.clients.len() {
            if !self.clients[i].control.active() {
                continue;
            }
            let changed = {
                let c = &self.clients[i];
                c.rank != rank || c.next_in_chain != successors[i]
            };

            if self.clients[i].is_in_process() {
                if let Some(head) = subgraph_head.take() {
                    self.clients[head].subgraph_wait = Some(fifos.ensure(rank)?);
                }
                let c = &mut self.clients[i];
                c.rank = rank;
                c.next_in_chain = successors[i];
                c.subgraph_start = None;
                c.subgraph_wait = None;
            } else {
                let start = fifos.ensure(rank)?;
                fifos.ensure(rank + 1)?;
                {
                    let c = &mut self.clients[i];
                    c.rank = rank;
                    c.next_in_chain = successors[i];
                    if subgraph_head.is_none() {
                        subgraph_head = Some(i);
                        c.subgraph_start = Some(start);
                    } else {
                        c.subgraph_start = None;
                    }
                    c.subgraph_wait = None;
                }
                if changed {
                    notify.push((self.clients[i].id(), rank));
                }
                rank += 1;
            }
        }

        if let Some(head) = subgraph_head {
            self.clients[head].subgraph_wait = Some(fifos.ensure(rank)?);
        }

        debug!(
            chain = ?self
                .clients
                .iter()
                .filter(|c| c.control.active())
                .map(|c| c.control.name())
                .collect::<Vec<_>>(),
            "chain rebuilt"
        );
        Ok(notify)
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}
