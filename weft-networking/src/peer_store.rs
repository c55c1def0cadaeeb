// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The persisted peer table.
//!
//! One row per peer ever heard of. The table is held in memory behind a
//! single mutex — the "table lock" every compound admission operation runs
//! under — and snapshotted to `peers.json` in the node's storage dir.
//!
//! Two rules are enforced at the row level and nowhere else:
//! * an announced node id is never stored; identity is always recomputed
//!   from the public key on admission;
//! * a row whose derived distance to the local node is zero is ourselves
//!   and is deleted on sight.

use crate::error::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::{
    cmp::Reverse,
    collections::{BTreeMap, HashMap},
    path::PathBuf,
    sync::Mutex,
    time::{Duration, SystemTime},
};
use weft_protocol::NodeId;

/// How long a failed dial parks a row before it may be retried.
pub const CONNECT_RETRY_GRACE: Duration = Duration::from_secs(5 * 60);

/// Who initiated the connection a row was learned from. Outbound rows sort
/// first among dial candidates.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// A persisted peer row.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerRecord {
    pub id: u64,
    pub address: String,
    pub public_key: Option<Bytes>,
    pub node_id: Option<NodeId>,
    /// Log distance to the local node; only present once the identity is.
    pub distance: Option<u16>,
    pub direction: Direction,
    pub connected: bool,
    pub last_connect_attempt: Option<SystemTime>,
}

/// A peer to be admitted to the table: an address, a public key, or both.
#[derive(Clone, Debug)]
pub struct PeerCandidate {
    pub address: String,
    pub public_key: Option<Bytes>,
    pub direction: Direction,
}

impl PeerCandidate {
    pub fn from_address(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            public_key: None,
            direction: Direction::Outbound,
        }
    }
}

/// Outcome of an authentication lookup against the table.
#[derive(Debug)]
pub enum AdmitOutcome {
    /// Admit; the row snapshot reflects the authenticated state.
    Admit(PeerRecord),
    /// The remote is ourselves; the row (if any) has been deleted.
    SelfConnection,
    /// We dialled expecting one identity and reached another.
    IdentityMismatch,
    /// A connection to this identity is already live.
    AlreadyConnected,
}

#[derive(Default, Serialize, Deserialize)]
struct Tables {
    next_id: u64,
    rows: BTreeMap<u64, PeerRecord>,
    #[serde(skip)]
    by_node_id: HashMap<NodeId, u64>,
    #[serde(skip)]
    by_address: HashMap<String, u64>,
    #[serde(skip)]
    dirty: bool,
}

impl Tables {
    fn rebuild_indexes(&mut self) {
        self.by_node_id.clear();
        self.by_address.clear();
        for (id, row) in &self.rows {
            if let Some(node_id) = row.node_id {
                let _ = self.by_node_id.insert(node_id, *id);
            }
            let _ = self.by_address.insert(row.address.clone(), *id);
        }
    }

    fn insert_row(&mut self, mut row: PeerRecord) -> u64 {
        self.next_id += 1;
        row.id = self.next_id;
        if let Some(node_id) = row.node_id {
            let _ = self.by_node_id.insert(node_id, row.id);
        }
        let _ = self.by_address.insert(row.address.clone(), row.id);
        let id = row.id;
        let _ = self.rows.insert(id, row);
        self.dirty = true;
        id
    }

    fn delete_row(&mut self, id: u64) {
        if let Some(row) = self.rows.remove(&id) {
            if let Some(node_id) = row.node_id {
                let _ = self.by_node_id.remove(&node_id);
            }
            let _ = self.by_address.remove(&row.address);
            self.dirty = true;
        }
    }

    fn reindex_address(&mut self, id: u64, old: &str, new: String) {
        let _ = self.by_address.remove(old);
        let _ = self.by_address.insert(new, id);
        self.dirty = true;
    }
}

/// The peer table plus its snapshot location.
pub struct PeerStore {
    local_id: NodeId,
    snapshot_path: PathBuf,
    inner: Mutex<Tables>,
}

impl PeerStore {
    pub fn new(local_id: NodeId, snapshot_path: PathBuf) -> Self {
        Self {
            local_id,
            snapshot_path,
            inner: Mutex::new(Tables::default()),
        }
    }

    /// Load the snapshot left by a previous run, if any. Rows are brought
    /// up as disconnected; liveness never survives a restart.
    pub async fn load(&self) -> Result<usize> {
        let raw = match tokio::fs::read(&self.snapshot_path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };
        let mut tables: Tables = serde_json::from_slice(&raw)?;
        for row in tables.rows.values_mut() {
            row.connected = false;
        }
        tables.rebuild_indexes();
        let count = tables.rows.len();
        *self.lock() = tables;
        Ok(count)
    }

    /// Write the snapshot if anything changed since the last flush.
    pub async fn flush(&self) -> Result<()> {
        let serialized = {
            let mut tables = self.lock();
            if !tables.dirty {
                return Ok(());
            }
            tables.dirty = false;
            serde_json::to_vec(&*tables)?
        };
        let tmp = self.snapshot_path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &serialized).await?;
        tokio::fs::rename(&tmp, &self.snapshot_path).await?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Admit a batch of candidates, deduplicating by node id (when a public
    /// key is present) or by address. Returns the row ids actually added.
    pub fn add_peers(&self, candidates: Vec<PeerCandidate>) -> Vec<u64> {
        let mut tables = self.lock();
        let mut added = Vec::new();

        for candidate in candidates {
            let (node_id, distance) = match &candidate.public_key {
                Some(public_key) => {
                    let node_id = NodeId::from_public_key(public_key);
                    let distance = self.local_id.log_distance(&node_id);
                    if distance == 0 {
                        debug!("Candidate [{}] is ourselves; skipping", candidate.address);
                        continue;
                    }
                    (Some(node_id), Some(distance))
                }
                None => (None, None),
            };

            let duplicate = match node_id {
                Some(node_id) => tables.by_node_id.contains_key(&node_id),
                None => tables.by_address.contains_key(&candidate.address),
            };
            if duplicate {
                trace!("Peer [{}] already in table", candidate.address);
                continue;
            }

            let id = tables.insert_row(PeerRecord {
                id: 0,
                address: candidate.address,
                public_key: candidate.public_key,
                node_id,
                distance,
                direction: candidate.direction,
                connected: false,
                last_connect_attempt: None,
            });
            added.push(id);
        }

        if !added.is_empty() {
            info!("Added {} new peer rows", added.len());
        }
        added
    }

    pub fn count(&self) -> usize {
        self.lock().rows.len()
    }

    pub fn get(&self, id: u64) -> Option<PeerRecord> {
        self.lock().rows.get(&id).cloned()
    }

    pub fn find_by_node_id(&self, node_id: &NodeId) -> Option<PeerRecord> {
        let tables = self.lock();
        let id = tables.by_node_id.get(node_id)?;
        tables.rows.get(id).cloned()
    }

    /// The smallest known distance among dialable rows; the dial loop's
    /// starting bucket.
    pub fn min_unconnected_distance(&self) -> Option<u16> {
        self.lock()
            .rows
            .values()
            .filter(|row| !row.connected)
            .filter_map(|row| row.distance)
            .filter(|distance| *distance != 0)
            .min()
    }

    /// Dial candidates at exactly `distance`, freshest-direction first then
    /// by node id, skipping rows attempted within the grace period.
    pub fn candidates_at_distance(&self, distance: u16, limit: usize) -> Vec<PeerRecord> {
        let cutoff = SystemTime::now() - CONNECT_RETRY_GRACE;
        let mut rows: Vec<PeerRecord> = self
            .lock()
            .rows
            .values()
            .filter(|row| row.distance == Some(distance) && !row.connected)
            .filter(|row| match row.last_connect_attempt {
                None => true,
                Some(at) => at < cutoff,
            })
            .cloned()
            .collect();
        rows.sort_by_key(|row| (Reverse(row.direction), row.node_id));
        rows.truncate(limit);
        rows
    }

    /// Claim a row for an outgoing dial. Refuses when the peer connected to
    /// us in the meantime.
    pub fn begin_connect(&self, id: u64) -> bool {
        let mut tables = self.lock();
        let Some(row) = tables.rows.get_mut(&id) else {
            return false;
        };
        if row.connected {
            debug!("Peer [{id}] connected to us in the mean time");
            return false;
        }
        row.connected = true;
        row.last_connect_attempt = Some(SystemTime::now());
        tables.dirty = true;
        true
    }

    pub fn mark_disconnected(&self, id: u64) {
        let mut tables = self.lock();
        if let Some(row) = tables.rows.get_mut(&id) {
            row.connected = false;
            tables.dirty = true;
        }
    }

    /// Outbound admission: the row exists; learn or verify the identity the
    /// remote authenticated with.
    pub fn authenticate_outbound(&self, id: u64, public_key: &Bytes) -> AdmitOutcome {
        let node_id = NodeId::from_public_key(public_key);
        let distance = self.local_id.log_distance(&node_id);

        let mut tables = self.lock();
        let Some(row) = tables.rows.get_mut(&id) else {
            return AdmitOutcome::IdentityMismatch;
        };

        match row.node_id {
            None => {
                // A manually added address; learn the identity now.
                if distance == 0 {
                    info!("Peer is us! (Has the same ID!)");
                    tables.delete_row(id);
                    return AdmitOutcome::SelfConnection;
                }
                row.node_id = Some(node_id);
                row.public_key = Some(public_key.clone());
                row.distance = Some(distance);
                row.direction = Direction::Outbound;
                let snapshot = row.clone();
                tables.dirty = true;
                let _ = tables.by_node_id.insert(node_id, id);
                AdmitOutcome::Admit(snapshot)
            }
            Some(expected) if expected != node_id => {
                // We dialled a specific identity and reached someone else.
                row.connected = false;
                tables.dirty = true;
                AdmitOutcome::IdentityMismatch
            }
            Some(_) => AdmitOutcome::Admit(row.clone()),
        }
    }

    /// Inbound admission: find or create the row for the authenticated key,
    /// fixing up the recorded host when the remote moved.
    pub fn authenticate_inbound(
        &self,
        public_key: &Bytes,
        observed_host: &str,
        announced_port: u16,
    ) -> AdmitOutcome {
        let node_id = NodeId::from_public_key(public_key);
        let distance = self.local_id.log_distance(&node_id);
        if distance == 0 {
            info!("Peer is us! (Has the same ID!)");
            return AdmitOutcome::SelfConnection;
        }

        let mut tables = self.lock();
        match tables.by_node_id.get(&node_id).copied() {
            None => {
                let address = format!("{observed_host}:{announced_port}");
                let id = tables.insert_row(PeerRecord {
                    id: 0,
                    address,
                    public_key: Some(public_key.clone()),
                    node_id: Some(node_id),
                    distance: Some(distance),
                    direction: Direction::Inbound,
                    connected: true,
                    last_connect_attempt: None,
                });
                match tables.rows.get(&id).cloned() {
                    Some(row) => AdmitOutcome::Admit(row),
                    None => AdmitOutcome::IdentityMismatch,
                }
            }
            Some(id) => {
                let Some(row) = tables.rows.get(&id).cloned() else {
                    return AdmitOutcome::IdentityMismatch;
                };
                if row.connected {
                    info!("Already connected to peer, refusing redundant connection");
                    return AdmitOutcome::AlreadyConnected;
                }
                let (recorded_host, port) =
                    row.address.rsplit_once(':').unwrap_or((row.address.as_str(), "0"));
                let new_address = if recorded_host != observed_host {
                    info!("Remote peer host has changed, updating our record");
                    Some(format!("{observed_host}:{port}"))
                } else {
                    None
                };
                if let Some(new_address) = new_address.clone() {
                    tables.reindex_address(id, &row.address, new_address);
                }
                let mut snapshot = row;
                if let Some(row) = tables.rows.get_mut(&id) {
                    if let Some(new_address) = new_address {
                        row.address = new_address;
                    }
                    row.connected = true;
                    snapshot = row.clone();
                }
                tables.dirty = true;
                AdmitOutcome::Admit(snapshot)
            }
        }
    }

    /// Rewrite a row's address, keeping the index coherent.
    pub fn update_address(&self, id: u64, new_address: String) {
        let mut tables = self.lock();
        let Some(row) = tables.rows.get(&id) else { return };
        let old = row.address.clone();
        if old == new_address {
            return;
        }
        tables.reindex_address(id, &old, new_address.clone());
        if let Some(row) = tables.rows.get_mut(&id) {
            row.address = new_address;
        }
    }

    pub fn delete(&self, id: u64) {
        self.lock().delete_row(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> PeerStore {
        let local = NodeId::from_public_key(b"local key");
        PeerStore::new(local, std::env::temp_dir().join("weft-peers-test.json"))
    }

    fn candidate(address: &str, key: &[u8]) -> PeerCandidate {
        PeerCandidate {
            address: address.to_string(),
            public_key: Some(Bytes::copy_from_slice(key)),
            direction: Direction::Outbound,
        }
    }

    #[test]
    fn add_peers_dedups_by_identity_and_address() {
        let store = store();
        let added = store.add_peers(vec![
            candidate("10.0.0.1:4250", b"peer one"),
            // Same key, different address: one identity, one row.
            candidate("10.0.0.2:4250", b"peer one"),
            PeerCandidate::from_address("10.0.0.3:4250"),
            PeerCandidate::from_address("10.0.0.3:4250"),
        ]);
        assert_eq!(added.len(), 2);
        assert_eq!(store.count(), 2);
    }

    #[test]
    fn own_key_is_never_admitted() {
        let store = store();
        let added = store.add_peers(vec![candidate("10.0.0.1:4250", b"local key")]);
        assert!(added.is_empty());
        assert_eq!(store.count(), 0);
    }

    #[test]
    fn announced_identity_is_recomputed_from_the_key() {
        // The candidate carries no node id at all; whatever the remote
        // claimed was discarded before this layer.
        let store = store();
        let ids = store.add_peers(vec![candidate("10.0.0.1:4250", b"peer one")]);
        let row = store.get(ids[0]).expect("row should exist");
        assert_eq!(
            row.node_id,
            Some(NodeId::from_public_key(b"peer one")),
        );
        assert!(row.distance.is_some());
    }

    #[test]
    fn begin_connect_refuses_already_connected_rows() {
        let store = store();
        let ids = store.add_peers(vec![candidate("10.0.0.1:4250", b"peer one")]);
        assert!(store.begin_connect(ids[0]));
        assert!(!store.begin_connect(ids[0]));
        store.mark_disconnected(ids[0]);
        // Still parked behind the retry grace.
        assert!(store.candidates_at_distance(
            store.get(ids[0]).unwrap().distance.unwrap(), 10
        ).is_empty());
    }

    #[test]
    fn outbound_mismatch_is_refused() {
        let store = store();
        let ids = store.add_peers(vec![candidate("10.0.0.1:4250", b"expected peer")]);
        assert!(store.begin_connect(ids[0]));
        let outcome = store.authenticate_outbound(ids[0], &Bytes::from_static(b"someone else"));
        assert!(matches!(outcome, AdmitOutcome::IdentityMismatch));
        assert!(!store.get(ids[0]).unwrap().connected);
    }

    #[test]
    fn inbound_unknown_peer_gets_a_row() {
        let store = store();
        let outcome =
            store.authenticate_inbound(&Bytes::from_static(b"incoming"), "192.0.2.7", 4250);
        match outcome {
            AdmitOutcome::Admit(row) => {
                assert_eq!(row.address, "192.0.2.7:4250");
                assert_eq!(row.direction, Direction::Inbound);
                assert!(row.connected);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn inbound_redundant_connection_is_refused() {
        let store = store();
        let key = Bytes::from_static(b"incoming");
        assert!(matches!(
            store.authenticate_inbound(&key, "192.0.2.7", 4250),
            AdmitOutcome::Admit(_)
        ));
        assert!(matches!(
            store.authenticate_inbound(&key, "192.0.2.7", 4250),
            AdmitOutcome::AlreadyConnected
        ));
    }

    #[test]
    fn inbound_host_change_updates_the_row() {
        let store = store();
        let key = Bytes::from_static(b"mobile peer");
        let row = match store.authenticate_inbound(&key, "192.0.2.7", 4250) {
            AdmitOutcome::Admit(row) => row,
            other => panic!("unexpected outcome {other:?}"),
        };
        store.mark_disconnected(row.id);

        match store.authenticate_inbound(&key, "198.51.100.9", 4250) {
            AdmitOutcome::Admit(updated) => {
                assert_eq!(updated.id, row.id);
                assert_eq!(updated.address, "198.51.100.9:4250");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn dial_candidates_prefer_outbound_rows() {
        let store = store();
        // Find two keys landing in the same bucket relative to local.
        let mut outbound_key = None;
        let mut inbound_key = None;
        let local = NodeId::from_public_key(b"local key");
        for i in 0u32..10_000 {
            let key = format!("probe {i}").into_bytes();
            let d = local.log_distance(&NodeId::from_public_key(&key));
            if d == 510 {
                if outbound_key.is_none() {
                    outbound_key = Some(key);
                } else if inbound_key.is_none() {
                    inbound_key = Some(key);
                    break;
                }
            }
        }
        let (outbound_key, inbound_key) =
            (outbound_key.expect("probe found"), inbound_key.expect("probe found"));

        let _ = store.add_peers(vec![
            PeerCandidate {
                address: "10.0.0.1:1".into(),
                public_key: Some(Bytes::from(inbound_key)),
                direction: Direction::Inbound,
            },
            PeerCandidate {
                address: "10.0.0.2:2".into(),
                public_key: Some(Bytes::from(outbound_key)),
                direction: Direction::Outbound,
            },
        ]);

        let candidates = store.candidates_at_distance(510, 10);
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].direction, Direction::Outbound);
    }
}
