// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use crate::{
    channels,
    driver::{EngineDriver, HARD_MAXIMUM_CONNECTIONS},
    error::{Error, Result},
    event::NetworkEvent,
    peer_store::{AdmitOutcome, Direction},
    routing::LivePeer,
    transport::{ConnHandle, HandshakeInfo, IncomingChannel},
};
use std::{fmt::Debug, sync::Arc};
use tokio::sync::{mpsc, oneshot};
use weft_protocol::NodeId;

/// A connection that completed its handshake and awaits admission.
pub(crate) struct PendingConn {
    pub conn: ConnHandle,
    pub incoming: mpsc::UnboundedReceiver<IncomingChannel>,
    pub handshake: HandshakeInfo,
    /// The host we observed on the socket, which overrides whatever the
    /// peer record used to say.
    pub remote_host: String,
    pub direction: Direction,
    /// The row an outbound dial started from.
    pub row_id: Option<u64>,
    /// Forced connects skip the desirability gate.
    pub forced: bool,
}

/// Commands to send to the engine driver.
pub(crate) enum NetworkCmd {
    /// Run admission over a handshaken connection.
    AdmitPeer {
        pending: PendingConn,
        reply: oneshot::Sender<Result<Arc<LivePeer>>>,
    },
    /// A live connection went away; tear down its routing entries.
    ConnectionLost { address: String },
    /// Snapshot of the live peer set, optionally excluding one identity.
    GetConnectedPeers {
        except: Option<NodeId>,
        reply: oneshot::Sender<Vec<Arc<LivePeer>>>,
    },
    /// How full one bucket is; the dial loop plans around this.
    GetBucketFill {
        distance: u16,
        reply: oneshot::Sender<usize>,
    },
    GetLocalState {
        reply: oneshot::Sender<LocalState>,
    },
    /// A `GetPeers` announced a different port for a connected peer.
    UpdatePeerAddress {
        old_address: String,
        new_address: String,
    },
    /// New rows exist (or a caller wants connections now); run the dial
    /// loop if its throttle allows.
    TriggerDial { forced: Vec<u64> },
    DialCycleFinished,
    StabilizeFinished,
    /// A peer reported the address it reached us on.
    SetExternalAddress { address: String },
    /// Stop accepting connections and exit the driver loop; existing
    /// channels drain as their tasks finish.
    Shutdown,
}

impl Debug for NetworkCmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkCmd::AdmitPeer { pending, .. } => write!(
                f,
                "NetworkCmd::AdmitPeer {{ host: {}, direction: {:?} }}",
                pending.remote_host, pending.direction
            ),
            NetworkCmd::ConnectionLost { address } => {
                write!(f, "NetworkCmd::ConnectionLost {{ {address} }}")
            }
            NetworkCmd::GetConnectedPeers { except, .. } => {
                write!(f, "NetworkCmd::GetConnectedPeers {{ except: {except:?} }}")
            }
            NetworkCmd::GetBucketFill { distance, .. } => {
                write!(f, "NetworkCmd::GetBucketFill {{ {distance} }}")
            }
            NetworkCmd::GetLocalState { .. } => write!(f, "NetworkCmd::GetLocalState"),
            NetworkCmd::UpdatePeerAddress {
                old_address,
                new_address,
            } => write!(
                f,
                "NetworkCmd::UpdatePeerAddress {{ {old_address} -> {new_address} }}"
            ),
            NetworkCmd::TriggerDial { forced } => {
                write!(f, "NetworkCmd::TriggerDial {{ forced: {} }}", forced.len())
            }
            NetworkCmd::DialCycleFinished => write!(f, "NetworkCmd::DialCycleFinished"),
            NetworkCmd::StabilizeFinished => write!(f, "NetworkCmd::StabilizeFinished"),
            NetworkCmd::SetExternalAddress { address } => {
                write!(f, "NetworkCmd::SetExternalAddress {{ {address} }}")
            }
            NetworkCmd::Shutdown => write!(f, "NetworkCmd::Shutdown"),
        }
    }
}

/// Snapshot of information kept in the driver's local state.
#[derive(Debug, Clone)]
pub struct LocalState {
    pub local_id: NodeId,
    pub connected_peers: Vec<(NodeId, String)>,
    pub known_peer_count: usize,
    pub block_count: usize,
    pub datastore_bytes: u64,
    pub external_address: Option<String>,
}

impl EngineDriver {
    pub(crate) fn handle_cmd(&mut self, cmd: NetworkCmd) {
        match cmd {
            NetworkCmd::AdmitPeer { pending, reply } => {
                let result = self.admit_peer(pending);
                let _ = reply.send(result);
            }
            NetworkCmd::ConnectionLost { address } => {
                let Some(peer) = self.routing.get_by_address(&address).cloned() else {
                    return;
                };
                info!("Connection to peer {peer:?} lost");
                self.routing.remove(&peer);
                self.network.peer_store().mark_disconnected(peer.row_id);
                self.network.notify(NetworkEvent::PeerDisconnected {
                    node_id: peer.node_id,
                    address,
                });
            }
            NetworkCmd::GetConnectedPeers { except, reply } => {
                let peers = self
                    .routing
                    .connected_peers()
                    .into_iter()
                    .filter(|peer| Some(peer.node_id) != except)
                    .collect();
                let _ = reply.send(peers);
            }
            NetworkCmd::GetBucketFill { distance, reply } => {
                let _ = reply.send(self.routing.bucket_fill(distance));
            }
            NetworkCmd::GetLocalState { reply } => {
                let state = LocalState {
                    local_id: *self.routing.local_id(),
                    connected_peers: self
                        .routing
                        .connected_peers()
                        .iter()
                        .map(|peer| (peer.node_id, peer.address()))
                        .collect(),
                    known_peer_count: self.network.peer_store().count(),
                    block_count: self.network.block_store().block_count(),
                    datastore_bytes: self.network.block_store().used_bytes(),
                    external_address: self.external_address.clone(),
                };
                let _ = reply.send(state);
            }
            NetworkCmd::UpdatePeerAddress {
                old_address,
                new_address,
            } => {
                let Some(peer) = self.routing.get_by_address(&old_address).cloned() else {
                    return;
                };
                info!("Remote peer said its port changed, updating [{old_address}] to [{new_address}]");
                self.routing.update_address(&peer, new_address.clone());
                self.network
                    .peer_store()
                    .update_address(peer.row_id, new_address);
            }
            NetworkCmd::TriggerDial { forced } => {
                self.forced_connects.extend(forced);
                self.maybe_start_dial_cycle();
            }
            NetworkCmd::DialCycleFinished => {
                self.dialing = false;
            }
            NetworkCmd::StabilizeFinished => {
                self.stabilizing = false;
            }
            NetworkCmd::SetExternalAddress { address } => {
                if self.external_address.as_deref() != Some(address.as_str()) {
                    self.external_address = Some(address.clone());
                    self.network
                        .notify(NetworkEvent::ExternalAddressReported(address));
                }
            }
            // Intercepted by the run loop; nothing to do here.
            NetworkCmd::Shutdown => {}
        }
    }

    /// The admission path: authenticate against the peer table, consult the
    /// desirability gate, then enter the routing structures and start the
    /// connection's channel server.
    fn admit_peer(&mut self, pending: PendingConn) -> Result<Arc<LivePeer>> {
        let PendingConn {
            conn,
            incoming,
            handshake,
            remote_host,
            direction,
            row_id,
            forced,
        } = pending;

        let outcome = match direction {
            Direction::Outbound => {
                let Some(row_id) = row_id else {
                    conn.shutdown();
                    return Err(Error::ConnectionRefused(remote_host));
                };
                self.network
                    .peer_store()
                    .authenticate_outbound(row_id, &handshake.public_key)
            }
            Direction::Inbound => self.network.peer_store().authenticate_inbound(
                &handshake.public_key,
                &remote_host,
                handshake.listen_port,
            ),
        };

        let row = match outcome {
            AdmitOutcome::Admit(row) => row,
            AdmitOutcome::SelfConnection => {
                conn.shutdown();
                return Err(Error::SelfConnection);
            }
            AdmitOutcome::IdentityMismatch => {
                conn.shutdown();
                return Err(Error::UnexpectedPeerIdentity {
                    address: remote_host,
                });
            }
            AdmitOutcome::AlreadyConnected => {
                conn.shutdown();
                return Err(Error::ConnectionRefused(remote_host));
            }
        };

        let (Some(node_id), Some(distance), Some(public_key)) =
            (row.node_id, row.distance, row.public_key.clone())
        else {
            conn.shutdown();
            return Err(Error::ConnectionRefused(remote_host));
        };

        if self.routing.contains(&node_id) {
            // The row's connected flag belongs to the connection already in
            // the table; leave it alone.
            info!("Already connected to {node_id:?}, refusing redundant connection");
            conn.shutdown();
            return Err(Error::ConnectionRefused(row.address));
        }

        let is_admin_session = channels::is_admin_session(&remote_host, &handshake.version);
        if !forced
            && !self.routing.is_connection_desirable(
                &node_id,
                distance,
                direction,
                is_admin_session,
                HARD_MAXIMUM_CONNECTIONS,
            )
        {
            info!("Peer connection unwanted, disconnecting");
            self.network.peer_store().mark_disconnected(row.id);
            conn.shutdown();
            return Err(Error::ConnectionRefused(row.address));
        }

        let peer = Arc::new(LivePeer::new(
            row.id,
            node_id,
            distance,
            direction,
            public_key,
            row.address.clone(),
            conn,
        ));
        if !self.routing.insert(Arc::clone(&peer)) {
            self.network.peer_store().mark_disconnected(row.id);
            peer.conn.shutdown();
            return Err(Error::ConnectionRefused(row.address));
        }

        info!("Peer {peer:?} has authenticated and entered the routing table");
        let _handle = tokio::spawn(channels::serve_connection(
            self.network.clone(),
            Arc::clone(&peer),
            incoming,
        ));
        if direction == Direction::Outbound {
            let _handle = tokio::spawn(channels::announce(
                self.network.clone(),
                Arc::clone(&peer),
            ));
        }

        self.network.notify(NetworkEvent::PeerConnected {
            node_id,
            address: peer.address(),
        });
        Ok(peer)
    }
}
