// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The in-memory routing fabric: one entry per live connection, reachable
//! three ways at once.
//!
//! Every connected peer appears in `peers_by_address`, in the bucket for
//! its log distance, and in the XOR trie — inserted and removed together,
//! always from the driver task, so the three views never disagree and no
//! locking is needed.

use crate::{
    peer_store::Direction,
    transport::ConnHandle,
    trie::XorTrie,
};
use bytes::Bytes;
use std::{collections::HashMap, sync::Arc, sync::RwLock};
use weft_protocol::{messages::PeerInfo, NodeId, NODE_ID_BITS};

/// Soft capacity of each bucket.
pub const BUCKET_SIZE: usize = 2;

/// A connected, authenticated peer.
pub struct LivePeer {
    /// Row key in the peer table.
    pub row_id: u64,
    /// Identity derived from the public key presented at handshake.
    pub node_id: NodeId,
    /// Log distance to the local node; never zero for an admitted peer.
    pub distance: u16,
    pub direction: Direction,
    pub public_key: Bytes,
    pub conn: ConnHandle,
    /// Dialable `host:port`. A `GetPeers` port announcement can rewrite it
    /// mid-connection, hence the cell.
    address: RwLock<String>,
}

impl LivePeer {
    pub fn new(
        row_id: u64,
        node_id: NodeId,
        distance: u16,
        direction: Direction,
        public_key: Bytes,
        address: String,
        conn: ConnHandle,
    ) -> Self {
        Self {
            row_id,
            node_id,
            distance,
            direction,
            public_key,
            conn,
            address: RwLock::new(address),
        }
    }

    pub fn address(&self) -> String {
        self.address
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub(crate) fn set_address(&self, address: String) {
        *self
            .address
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = address;
    }

    /// Ready to carry lookup traffic.
    pub fn ready(&self) -> bool {
        self.conn.is_open()
    }

    /// The wire record other peers learn us by.
    pub fn to_peer_info(&self) -> PeerInfo {
        PeerInfo {
            address: self.address(),
            public_key: self.public_key.clone(),
        }
    }
}

impl std::fmt::Debug for LivePeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "LivePeer(row={}, {:?}, d={}, {})",
            self.row_id,
            self.node_id,
            self.distance,
            self.address()
        )
    }
}

/// The three coupled views over the live peer set.
pub struct RoutingTable {
    local_id: NodeId,
    peers_by_address: HashMap<String, Arc<LivePeer>>,
    buckets: Vec<HashMap<String, Arc<LivePeer>>>,
    trie: XorTrie<Arc<LivePeer>>,
}

impl RoutingTable {
    pub fn new(local_id: NodeId) -> Self {
        Self {
            local_id,
            peers_by_address: HashMap::new(),
            buckets: (0..NODE_ID_BITS).map(|_| HashMap::new()).collect(),
            trie: XorTrie::new(local_id),
        }
    }

    pub fn len(&self) -> usize {
        self.peers_by_address.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers_by_address.is_empty()
    }

    pub fn bucket_fill(&self, distance: u16) -> usize {
        match distance {
            0 => 0,
            d => self.buckets[(d - 1) as usize].len(),
        }
    }

    pub fn get_by_address(&self, address: &str) -> Option<&Arc<LivePeer>> {
        self.peers_by_address.get(address)
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.trie.get(node_id).is_some()
    }

    /// All live peers, in no particular order.
    pub fn connected_peers(&self) -> Vec<Arc<LivePeer>> {
        self.peers_by_address.values().cloned().collect()
    }

    /// Add a peer to all three structures. Fails when the address is
    /// already occupied by a different connection.
    pub fn insert(&mut self, peer: Arc<LivePeer>) -> bool {
        let address = peer.address();
        if let Some(existing) = self.peers_by_address.get(&address) {
            if !Arc::ptr_eq(existing, &peer) {
                error!(
                    "Somehow we are trying to connect to an address [{address}] already connected!"
                );
                return false;
            }
        }
        let _ = self
            .peers_by_address
            .insert(address.clone(), Arc::clone(&peer));
        let _ = self.buckets[(peer.distance - 1) as usize].insert(address, Arc::clone(&peer));
        let node_id = peer.node_id;
        let _ = self.trie.insert(&node_id, peer);
        true
    }

    /// Remove a peer from all three structures.
    pub fn remove(&mut self, peer: &Arc<LivePeer>) {
        let address = peer.address();
        let _ = self.peers_by_address.remove(&address);
        let _ = self.buckets[(peer.distance - 1) as usize].remove(&address);
        let _ = self.trie.remove(&peer.node_id);
    }

    /// Re-key a peer whose dialback address changed mid-connection.
    pub fn update_address(&mut self, peer: &Arc<LivePeer>, new_address: String) {
        let old = peer.address();
        if old == new_address {
            return;
        }
        let _ = self.peers_by_address.remove(&old);
        let _ = self.buckets[(peer.distance - 1) as usize].remove(&old);
        peer.set_address(new_address.clone());
        let _ = self
            .peers_by_address
            .insert(new_address.clone(), Arc::clone(peer));
        let _ =
            self.buckets[(peer.distance - 1) as usize].insert(new_address, Arc::clone(peer));
    }

    /// The admission gate for a new connection.
    ///
    /// Localhost admin sessions always pass. Beyond the hard ceiling nobody
    /// passes. Inbound connections pass up to that ceiling. Otherwise the
    /// peer needs either room in its bucket, or to be nearer to us than
    /// enough of the bucket's current occupants: it is accepted iff fewer
    /// than [`BUCKET_SIZE`] already-connected peers at the same log
    /// distance are closer in XOR.
    pub fn is_connection_desirable(
        &self,
        node_id: &NodeId,
        distance: u16,
        direction: Direction,
        is_admin_session: bool,
        hard_maximum_connections: usize,
    ) -> bool {
        if is_admin_session {
            return true;
        }
        if self.len() >= hard_maximum_connections {
            return false;
        }
        if direction == Direction::Inbound {
            return true;
        }
        if self.bucket_fill(distance) < BUCKET_SIZE {
            return true;
        }

        if self.contains(node_id) {
            info!("Peer already connected, undesirable");
            return false;
        }

        let closer_in_bucket = self
            .trie
            .iter_closer_than(node_id)
            .filter_map(|(_, slot)| slot.entry())
            .filter(|other| other.distance == distance)
            .count();
        if closer_in_bucket >= BUCKET_SIZE {
            info!("Peer is further than BUCKET_SIZE connected peers, undesirable");
            false
        } else {
            true
        }
    }

    /// Seed a lookup: every live peer re-keyed by distance to `target`.
    pub fn trie_for_target(&self, target: NodeId) -> XorTrie<Arc<LivePeer>> {
        let mut trie = XorTrie::new(target);
        for peer in self.peers_by_address.values() {
            let _ = trie.insert(&peer.node_id, Arc::clone(peer));
        }
        trie
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::spawn_mux;

    fn conn() -> ConnHandle {
        let (a, _b) = tokio::io::duplex(1024);
        let (handle, _incoming) = spawn_mux(a, true);
        handle
    }

    fn peer(local: &NodeId, key: &[u8], address: &str, direction: Direction) -> Arc<LivePeer> {
        let public_key = Bytes::copy_from_slice(key);
        let node_id = NodeId::from_public_key(&public_key);
        Arc::new(LivePeer::new(
            1,
            node_id,
            local.log_distance(&node_id),
            direction,
            public_key,
            address.to_string(),
            conn(),
        ))
    }

    /// Find keys whose identity lands at the wanted log distance, ordered
    /// by raw XOR to local.
    fn keys_in_bucket(local: &NodeId, distance: u16, count: usize) -> Vec<Vec<u8>> {
        let mut found: Vec<(weft_protocol::Distance, Vec<u8>)> = Vec::new();
        for i in 0u32.. {
            let key = format!("bucket probe {i}").into_bytes();
            let id = NodeId::from_public_key(&key);
            if local.log_distance(&id) == distance {
                found.push((local.distance(&id), key));
                if found.len() == count {
                    break;
                }
            }
        }
        found.sort_by(|a, b| a.0.cmp(&b.0));
        found.into_iter().map(|(_, key)| key).collect()
    }

    #[tokio::test]
    async fn membership_is_all_or_none() {
        let local = NodeId::from_public_key(b"local");
        let mut table = RoutingTable::new(local);
        let p = peer(&local, b"peer one", "10.0.0.1:1", Direction::Outbound);

        assert!(table.insert(Arc::clone(&p)));
        assert_eq!(table.len(), 1);
        assert_eq!(table.bucket_fill(p.distance), 1);
        assert!(table.contains(&p.node_id));

        table.remove(&p);
        assert_eq!(table.len(), 0);
        assert_eq!(table.bucket_fill(p.distance), 0);
        assert!(!table.contains(&p.node_id));
    }

    #[tokio::test]
    async fn occupied_address_is_rejected() {
        let local = NodeId::from_public_key(b"local");
        let mut table = RoutingTable::new(local);
        let first = peer(&local, b"peer one", "10.0.0.1:1", Direction::Outbound);
        let second = peer(&local, b"peer two", "10.0.0.1:1", Direction::Outbound);

        assert!(table.insert(first));
        assert!(!table.insert(second));
    }

    // Bucket admission: with two peers at one log distance, a third that
    // is XOR-farther than both is refused; one XOR-closer than at least
    // one sitting member is accepted.
    #[tokio::test]
    async fn full_bucket_admits_only_closer_peers() {
        let local = NodeId::from_public_key(b"local");
        let mut table = RoutingTable::new(local);

        let distance = 509;
        let keys = keys_in_bucket(&local, distance, 4);
        // Fill the bucket with the two middle peers.
        for (i, key) in keys[1..3].iter().enumerate() {
            let p = peer(&local, key, &format!("10.0.0.{i}:1"), Direction::Outbound);
            assert!(table.insert(p));
        }
        assert_eq!(table.bucket_fill(distance), BUCKET_SIZE);

        let farther = NodeId::from_public_key(&keys[3]);
        assert!(!table.is_connection_desirable(
            &farther,
            distance,
            Direction::Outbound,
            false,
            128
        ));

        let closer = NodeId::from_public_key(&keys[0]);
        assert!(table.is_connection_desirable(
            &closer,
            distance,
            Direction::Outbound,
            false,
            128
        ));
    }

    #[tokio::test]
    async fn inbound_is_admitted_up_to_the_hard_cap() {
        let local = NodeId::from_public_key(b"local");
        let mut table = RoutingTable::new(local);
        let candidate = NodeId::from_public_key(b"inbound candidate");
        let distance = local.log_distance(&candidate);

        assert!(table.is_connection_desirable(
            &candidate,
            distance,
            Direction::Inbound,
            false,
            2
        ));

        // Two live peers reach the (artificially low) hard cap.
        for (i, key) in [b"a".as_ref(), b"b".as_ref()].iter().enumerate() {
            let p = peer(&local, key, &format!("10.0.1.{i}:1"), Direction::Inbound);
            assert!(table.insert(p));
        }
        assert!(!table.is_connection_desirable(
            &candidate,
            distance,
            Direction::Inbound,
            false,
            2
        ));
        // The admin session still passes.
        assert!(table.is_connection_desirable(
            &candidate,
            distance,
            Direction::Inbound,
            true,
            2
        ));
    }

    #[tokio::test]
    async fn trie_for_target_orders_by_distance_to_target() {
        let local = NodeId::from_public_key(b"local");
        let mut table = RoutingTable::new(local);
        let peers: Vec<_> = (0..5)
            .map(|i| {
                peer(
                    &local,
                    format!("peer {i}").as_bytes(),
                    &format!("10.0.2.{i}:1"),
                    Direction::Outbound,
                )
            })
            .collect();
        for p in &peers {
            assert!(table.insert(Arc::clone(p)));
        }

        let target = NodeId::from_public_key(b"a lookup target");
        let trie = table.trie_for_target(target);
        let ordered: Vec<_> = trie
            .iter_closest()
            .filter_map(|(d, slot)| slot.entry().map(|p| (*d, p.node_id)))
            .collect();
        assert_eq!(ordered.len(), peers.len());
        for pair in ordered.windows(2) {
            assert!(pair[0].0 < pair[1].0);
        }
    }
}
