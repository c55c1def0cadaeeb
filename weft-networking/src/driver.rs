// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use crate::{
    block_store::{BlockStore, BlockStoreConfig},
    cmd::{NetworkCmd, PendingConn},
    dial,
    error::{Error, Result},
    event::NetworkEvent,
    peer_store::{Direction, PeerStore},
    routing::RoutingTable,
    stabilize,
    transport::{exchange_handshake, spawn_mux, HandshakeInfo},
    Network,
};
use bytes::Bytes;
use std::{
    collections::HashSet,
    net::SocketAddr,
    path::PathBuf,
    time::{Duration, Instant},
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use weft_protocol::NodeId;

/// Keep at least this many connections before the dial loop goes quiet.
pub const MINIMUM_CONNECTIONS: usize = 10;
/// Target connection count the dial loop works towards.
pub const MAXIMUM_CONNECTIONS: usize = 64;
/// Absolute ceiling; beyond this even inbound connections are refused.
pub const HARD_MAXIMUM_CONNECTIONS: usize = MAXIMUM_CONNECTIONS * 2;

/// Once above the minimum, the dial loop will not re-run more often than
/// this.
const DIAL_THROTTLE: Duration = Duration::from_secs(15);
/// A follow-up dial run is scheduled this long after each one.
const DIAL_RESCHEDULE_INTERVAL: Duration = Duration::from_secs(60);
/// How often the stabilisation sweep may start.
const STABILIZE_INTERVAL: Duration = Duration::from_secs(120);
/// How often dirty store snapshots are flushed.
const FLUSH_INTERVAL: Duration = Duration::from_secs(30);
/// A handshake that takes longer than this is abandoned.
pub(crate) const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const ENGINE_CHANNEL_SIZE: usize = 10_000;

/// Default cap on the local datastore.
const DEFAULT_MAX_DATASTORE_BYTES: u64 = 8 * 1024 * 1024 * 1024;

#[derive(Debug)]
pub struct EngineBuilder {
    public_key: Bytes,
    root_dir: PathBuf,
    instance: String,
    listen_addr: Option<SocketAddr>,
    announce_host: Option<String>,
    max_datastore_bytes: u64,
}

impl EngineBuilder {
    pub fn new(public_key: Bytes, root_dir: PathBuf) -> Self {
        Self {
            public_key,
            root_dir,
            instance: "0".to_string(),
            listen_addr: None,
            announce_host: None,
            max_datastore_bytes: DEFAULT_MAX_DATASTORE_BYTES,
        }
    }

    pub fn listen_addr(&mut self, listen_addr: SocketAddr) {
        self.listen_addr = Some(listen_addr);
    }

    /// Name of this node instance; storage lives under
    /// `{root_dir}/{instance}/`.
    pub fn instance(&mut self, instance: impl Into<String>) {
        self.instance = instance.into();
    }

    /// The host other peers should dial us back on, when it differs from
    /// the listen host (e.g. binding a wildcard address).
    pub fn announce_host(&mut self, host: impl Into<String>) {
        self.announce_host = Some(host.into());
    }

    pub fn max_datastore_bytes(&mut self, max: u64) {
        self.max_datastore_bytes = max;
    }

    /// Bind the listener and assemble the engine. Returns the `Network`
    /// handle for callers, the event stream, and the driver to be spawned.
    pub async fn build(
        self,
    ) -> Result<(Network, mpsc::Receiver<NetworkEvent>, EngineDriver)> {
        let local_id = NodeId::from_public_key(&self.public_key);
        info!(
            "Node (PID: {}) starting with id {local_id:?}",
            std::process::id()
        );

        let listen_addr = self.listen_addr.ok_or(Error::ListenAddressNotProvided)?;
        let listener = TcpListener::bind(listen_addr).await?;
        let local_addr = listener.local_addr()?;
        let announce_host = self
            .announce_host
            .unwrap_or_else(|| local_addr.ip().to_string());
        let bind_address = format!("{announce_host}:{}", local_addr.port());
        info!("Node listening on [{bind_address}]");

        let storage_dir = self.root_dir.join(&self.instance);
        std::fs::create_dir_all(&storage_dir).map_err(|source| {
            Error::FailedToCreateStorageDir {
                path: storage_dir.clone(),
                source,
            }
        })?;

        let peer_store = PeerStore::new(local_id, storage_dir.join("peers.json"));
        let loaded = peer_store.load().await?;
        if loaded > 0 {
            info!("Loaded {loaded} peer rows from the previous run");
        }

        let block_store = BlockStore::with_config(
            local_id,
            BlockStoreConfig {
                storage_dir: storage_dir.join("blocks"),
                max_bytes: self.max_datastore_bytes,
            },
        )?;
        let loaded = block_store.load().await?;
        if loaded > 0 {
            info!("Loaded {loaded} block rows from the previous run");
        }

        let (cmd_sender, cmd_receiver) = mpsc::channel(ENGINE_CHANNEL_SIZE);
        let (event_sender, event_receiver) = mpsc::channel(ENGINE_CHANNEL_SIZE);

        let network = Network::new(
            cmd_sender,
            event_sender,
            local_id,
            self.public_key,
            bind_address,
            local_addr.port(),
            peer_store,
            block_store,
        );

        let driver = EngineDriver {
            network: network.clone(),
            routing: RoutingTable::new(local_id),
            cmd_receiver,
            listener,
            forced_connects: HashSet::new(),
            dialing: false,
            last_dial_cycle: None,
            stabilizing: false,
            external_address: None,
        };

        Ok((network, event_receiver, driver))
    }
}

pub struct EngineDriver {
    pub(crate) network: Network,
    pub(crate) routing: RoutingTable,
    cmd_receiver: mpsc::Receiver<NetworkCmd>,
    listener: TcpListener,
    pub(crate) forced_connects: HashSet<u64>,
    pub(crate) dialing: bool,
    last_dial_cycle: Option<Instant>,
    pub(crate) stabilizing: bool,
    pub(crate) external_address: Option<String>,
}

impl EngineDriver {
    /// Drive the engine until the command channel closes. All routing state
    /// is owned here and mutated only on this task.
    pub async fn run(mut self) {
        let mut dial_interval = tokio::time::interval(DIAL_RESCHEDULE_INTERVAL);
        let mut stabilize_interval = tokio::time::interval(STABILIZE_INTERVAL);
        let mut flush_interval = tokio::time::interval(FLUSH_INTERVAL);

        loop {
            tokio::select! {
                some_cmd = self.cmd_receiver.recv() => match some_cmd {
                    Some(NetworkCmd::Shutdown) => {
                        info!("Engine asked to stop; closing the listener");
                        break;
                    }
                    Some(cmd) => {
                        trace!("Handling {cmd:?}");
                        self.handle_cmd(cmd);
                    }
                    None => {
                        info!("Engine command channel closed; shutting down");
                        break;
                    }
                },
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, remote_addr)) => {
                        let _handle = tokio::spawn(accept_inbound(
                            self.network.clone(),
                            stream,
                            remote_addr,
                        ));
                    }
                    Err(err) => {
                        warn!("Error accepting a connection: {err:?}");
                    }
                },
                _ = dial_interval.tick() => {
                    self.maybe_start_dial_cycle();
                }
                _ = stabilize_interval.tick() => {
                    self.maybe_start_stabilize();
                }
                _ = flush_interval.tick() => {
                    let network = self.network.clone();
                    let _handle = tokio::spawn(async move {
                        if let Err(err) = network.peer_store().flush().await {
                            warn!("Peer snapshot flush failed: {err:?}");
                        }
                        if let Err(err) = network.block_store().flush().await {
                            warn!("Block snapshot flush failed: {err:?}");
                        }
                    });
                }
            }
        }
    }

    /// Start a dial cycle unless the population or the throttle says no.
    pub(crate) fn maybe_start_dial_cycle(&mut self) {
        let connected = self.routing.len();
        if connected >= MAXIMUM_CONNECTIONS {
            return;
        }
        if connected >= MINIMUM_CONNECTIONS {
            if let Some(last) = self.last_dial_cycle {
                if last.elapsed() < DIAL_THROTTLE {
                    return;
                }
            }
        }
        if self.dialing {
            return;
        }
        self.last_dial_cycle = Some(Instant::now());
        self.dialing = true;

        let needed = MAXIMUM_CONNECTIONS - connected;
        let forced: Vec<u64> = self.forced_connects.drain().collect();
        let network = self.network.clone();
        let _handle = tokio::spawn(async move {
            dial::run_dial_cycle(network.clone(), needed, forced).await;
            network.send_cmd(NetworkCmd::DialCycleFinished);
        });
    }

    fn maybe_start_stabilize(&mut self) {
        if self.stabilizing || self.routing.is_empty() {
            return;
        }
        self.stabilizing = true;
        let network = self.network.clone();
        let _handle = tokio::spawn(async move {
            if let Err(err) = stabilize::do_stabilize(&network).await {
                warn!("Stabilize sweep failed: {err:?}");
            }
            network.send_cmd(NetworkCmd::StabilizeFinished);
        });
    }
}

/// Handshake an accepted socket and submit it for admission.
async fn accept_inbound(network: Network, mut stream: TcpStream, remote_addr: SocketAddr) {
    trace!("Inbound connection from [{remote_addr}]");
    let ours = HandshakeInfo::new(network.public_key().clone(), network.listen_port());
    let handshake = match tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        exchange_handshake(&mut stream, &ours),
    )
    .await
    {
        Ok(Ok(handshake)) => handshake,
        Ok(Err(err)) => {
            debug!("Handshake with [{remote_addr}] failed: {err:?}");
            return;
        }
        Err(_) => {
            debug!("Handshake with [{remote_addr}] timed out");
            return;
        }
    };

    let (conn, incoming) = spawn_mux(stream, false);
    let _ = network
        .admit(PendingConn {
            conn,
            incoming,
            handshake,
            remote_host: remote_addr.ip().to_string(),
            direction: Direction::Inbound,
            row_id: None,
            forced: false,
        })
        .await;
}
