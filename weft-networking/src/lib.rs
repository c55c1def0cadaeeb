// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The Weft overlay engine.
//!
//! All routing state lives on a single driver task ([`EngineDriver`]);
//! everything else — lookups, relays, dial attempts, channel servers —
//! runs as tasks that reach the driver through the [`Network`] handle's
//! command channel. The persistent stores carry their own table locks and
//! are shared directly.

#[macro_use]
extern crate tracing;

mod block_store;
mod channels;
mod cmd;
mod crypto;
mod dial;
mod driver;
mod error;
mod event;
mod lookup;
mod peer_store;
mod relay;
mod routing;
mod stabilize;
mod transport;
mod trie;

pub use self::{
    block_store::{BlockRecord, BlockStore, BlockStoreConfig, StoreOutcome, MAX_DATA_BLOCK_SIZE},
    cmd::LocalState,
    crypto::{decrypt_and_verify, decrypt_data_block, encrypt_data_block},
    driver::{EngineBuilder, EngineDriver, MAXIMUM_CONNECTIONS, MINIMUM_CONNECTIONS},
    error::Error,
    event::NetworkEvent,
    lookup::{LookupResult, MAX_CONCURRENT_QUERIES},
    peer_store::{Direction, PeerCandidate, PeerRecord, PeerStore},
    relay::RELAY_FANOUT,
    routing::{LivePeer, RoutingTable, BUCKET_SIZE},
    transport::{ChannelId, ConnHandle, HandshakeInfo},
    trie::{Slot, XorTrie},
};

use self::{
    cmd::{NetworkCmd, PendingConn},
    error::Result,
};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use weft_protocol::{messages::DataMode, messages::PeerInfo, DataKey, NodeId};

/// API to interact with the engine driver and the stores it answers for.
#[derive(Clone)]
pub struct Network {
    cmd_sender: mpsc::Sender<NetworkCmd>,
    event_sender: mpsc::Sender<NetworkEvent>,
    local_id: NodeId,
    public_key: Bytes,
    bind_address: String,
    listen_port: u16,
    peer_store: Arc<PeerStore>,
    block_store: Arc<BlockStore>,
}

impl Network {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        cmd_sender: mpsc::Sender<NetworkCmd>,
        event_sender: mpsc::Sender<NetworkEvent>,
        local_id: NodeId,
        public_key: Bytes,
        bind_address: String,
        listen_port: u16,
        peer_store: PeerStore,
        block_store: BlockStore,
    ) -> Self {
        Self {
            cmd_sender,
            event_sender,
            local_id,
            public_key,
            bind_address,
            listen_port,
            peer_store: Arc::new(peer_store),
            block_store: Arc::new(block_store),
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    pub fn public_key(&self) -> &Bytes {
        &self.public_key
    }

    /// The `host:port` other peers can dial us back on.
    pub fn bind_address(&self) -> &str {
        &self.bind_address
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    pub fn peer_store(&self) -> &PeerStore {
        &self.peer_store
    }

    pub fn block_store(&self) -> &BlockStore {
        &self.block_store
    }

    // ---- public operations ----

    /// Remember a peer address and, when `force`, dial it regardless of
    /// population and desirability.
    pub fn add_peer(&self, address: impl Into<String>, force: bool) -> usize {
        self.add_peer_candidates(vec![PeerCandidate::from_address(address)], force)
    }

    /// Admit a batch of wire peer records.
    pub fn add_peer_infos(&self, infos: Vec<PeerInfo>) -> usize {
        let candidates = infos
            .into_iter()
            .map(|info| PeerCandidate {
                address: info.address,
                public_key: Some(info.public_key),
                direction: Direction::Outbound,
            })
            .collect();
        self.add_peer_candidates(candidates, false)
    }

    /// Admit peer candidates into the table and nudge the dial loop when
    /// any were new.
    pub fn add_peer_candidates(&self, candidates: Vec<PeerCandidate>, force: bool) -> usize {
        let added = self.peer_store.add_peers(candidates);
        let count = added.len();
        if count > 0 {
            self.send_cmd(NetworkCmd::TriggerDial {
                forced: if force { added } else { Vec::new() },
            });
        }
        count
    }

    /// Iterative `FindNode`: the closest peers to `target` the overlay
    /// could reach, discovered through tunnels.
    pub async fn find_node(&self, target: NodeId) -> Result<Vec<PeerInfo>> {
        let result = lookup::send_find_node(self, target, DataMode::None, None, None).await?;
        Ok(result.peers)
    }

    /// Fetch and decrypt the block addressed by `data_key`. `Ok(None)`
    /// when no reachable holder produced a copy that verifies.
    pub async fn get_data(&self, data_key: &DataKey) -> Result<Option<Vec<u8>>> {
        let data_id = data_key.data_id();
        let result = lookup::send_find_node(
            self,
            data_id.into(),
            DataMode::Get,
            None,
            Some(*data_key),
        )
        .await?;
        Ok(result.data)
    }

    /// Store `data` at the willing nodes closest to its id (possibly
    /// including ourselves). Returns the key the caller needs to fetch and
    /// decrypt it later.
    pub async fn store_data(&self, data: Bytes) -> Result<DataKey> {
        if data.len() > MAX_DATA_BLOCK_SIZE {
            return Err(Error::BlockTooLarge {
                size: data.len(),
                max: MAX_DATA_BLOCK_SIZE,
            });
        }
        let data_key = DataKey::from_plaintext(&data);
        let data_id = data_key.data_id();
        let _ = lookup::send_find_node(
            self,
            data_id.into(),
            DataMode::Store,
            Some(data),
            None,
        )
        .await?;
        Ok(data_key)
    }

    /// Run one stabilization sweep now.
    pub async fn stabilize(&self) -> Result<()> {
        stabilize::do_stabilize(self).await
    }

    /// Stop the engine: the listener closes and no new connections are
    /// accepted; channels already open drain as their tasks finish.
    pub fn shutdown(&self) {
        self.send_cmd(NetworkCmd::Shutdown);
    }

    /// Snapshot of the driver's view of the world.
    pub async fn local_state(&self) -> Result<LocalState> {
        let (reply, rx) = oneshot::channel();
        self.send_cmd_now(NetworkCmd::GetLocalState { reply }).await?;
        rx.await.map_err(|_| Error::InternalMsgChannelDropped)
    }

    // ---- crate-internal plumbing ----

    /// Send a command without waiting; a full channel drops it with an
    /// error log, exactly like a lost datagram.
    pub(crate) fn send_cmd(&self, cmd: NetworkCmd) {
        let sender = self.cmd_sender.clone();
        let _handle = tokio::spawn(async move {
            if let Err(err) = sender.send(cmd).await {
                error!("Engine driver is gone; dropping command: {err}");
            }
        });
    }

    pub(crate) async fn send_cmd_now(&self, cmd: NetworkCmd) -> Result<()> {
        self.cmd_sender
            .send(cmd)
            .await
            .map_err(|_| Error::InternalMsgChannelDropped)
    }

    /// Forward an event to the upper layers, without blocking the caller.
    pub(crate) fn notify(&self, event: NetworkEvent) {
        let sender = self.event_sender.clone();
        let _handle = tokio::spawn(async move {
            if let Err(err) = sender.send(event).await {
                trace!("No one is consuming network events: {err}");
            }
        });
    }

    /// Submit a handshaken connection for admission.
    pub(crate) async fn admit(&self, pending: PendingConn) -> Result<Arc<LivePeer>> {
        let (reply, rx) = oneshot::channel();
        self.send_cmd_now(NetworkCmd::AdmitPeer { pending, reply })
            .await?;
        rx.await.map_err(|_| Error::InternalMsgChannelDropped)?
    }

    /// Snapshot of the live peer set.
    pub(crate) async fn connected_peers(
        &self,
        except: Option<NodeId>,
    ) -> Result<Vec<Arc<LivePeer>>> {
        let (reply, rx) = oneshot::channel();
        self.send_cmd_now(NetworkCmd::GetConnectedPeers { except, reply })
            .await?;
        rx.await.map_err(|_| Error::InternalMsgChannelDropped)
    }

    /// How many live peers occupy the bucket at `distance`. Reports a full
    /// bucket when the driver is unreachable, which stops dialling.
    pub(crate) async fn bucket_fill(&self, distance: u16) -> usize {
        let (reply, rx) = oneshot::channel();
        if self
            .send_cmd_now(NetworkCmd::GetBucketFill { distance, reply })
            .await
            .is_err()
        {
            return BUCKET_SIZE;
        }
        rx.await.unwrap_or(BUCKET_SIZE)
    }
}
