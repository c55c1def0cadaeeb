// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Per-connection channel service.
//!
//! Each admitted connection gets one task that accepts remotely opened
//! channels and dispatches their first frames: peer exchange, address
//! exchange, and `FindNode` requests (which hand the whole channel to the
//! relay server). A malformed frame is logged and skipped; only the
//! channel's closure ends its loop.

use crate::{
    cmd::NetworkCmd,
    relay,
    routing::LivePeer,
    transport::{ChannelId, ChannelRx, IncomingChannel, CHANNEL_MPEER, CHANNEL_SESSION},
    Network,
};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use weft_protocol::messages::{Message, PeerInfo, MSG_FIND_NODE, MSG_NODE_INFO};

/// Peer lists are sent in batches of this many records.
const PEER_LIST_CHUNK: usize = 25;

/// Localhost connections presenting an admin banner bypass the
/// desirability gate; they are operator tooling, not overlay peers.
pub(crate) fn is_admin_session(remote_host: &str, version: &str) -> bool {
    let loopback =
        remote_host.starts_with("127.") || remote_host == "::1" || remote_host == "localhost";
    loopback && version.starts_with("weft/admin")
}

/// Accept channels on a live connection until it goes away, then report
/// the loss to the driver.
pub(crate) async fn serve_connection(
    network: Network,
    peer: Arc<LivePeer>,
    mut incoming: mpsc::UnboundedReceiver<IncomingChannel>,
) {
    while let Some(channel) = incoming.recv().await {
        match channel.kind.as_str() {
            CHANNEL_MPEER => {
                let _handle = tokio::spawn(run_overlay_channel(
                    network.clone(),
                    Arc::clone(&peer),
                    channel.id,
                    channel.rx,
                ));
            }
            CHANNEL_SESSION => {
                // The admin shell lives outside the engine; refuse here.
                debug!("Refusing a session channel from {peer:?}");
                peer.conn.close_channel(channel.id);
            }
            other => {
                debug!("Refusing channel of unknown kind [{other}] from {peer:?}");
                peer.conn.close_channel(channel.id);
            }
        }
    }

    network.send_cmd(NetworkCmd::ConnectionLost {
        address: peer.address(),
    });
}

/// Read overlay packets off one channel. A `FindNode` consumes the channel
/// for the rest of its life; everything else is handled frame by frame.
pub(crate) async fn run_overlay_channel(
    network: Network,
    peer: Arc<LivePeer>,
    cid: ChannelId,
    mut rx: ChannelRx,
) {
    while let Some(frame) = rx.recv().await {
        let packet_type = match Message::peek_type(&frame) {
            Ok(packet_type) => packet_type,
            Err(_) => continue,
        };
        if packet_type == MSG_FIND_NODE {
            match Message::decode(frame.clone()) {
                Ok(Message::FindNode { target, mode }) => {
                    relay::process_find_node_request(
                        &network, &peer, target, mode, frame, cid, &mut rx,
                    )
                    .await;
                }
                other => {
                    warn!("Malformed FindNode from {peer:?}: {other:?}; ignoring");
                    continue;
                }
            }
            return;
        }
        handle_overlay_frame(&network, &peer, cid, frame).await;
    }
}

async fn handle_overlay_frame(network: &Network, peer: &Arc<LivePeer>, cid: ChannelId, frame: Bytes) {
    let msg = match Message::decode(frame) {
        Ok(msg) => msg,
        Err(err) => {
            warn!("Malformed packet from {peer:?}: {err}; ignoring");
            return;
        }
    };

    match msg {
        Message::GetPeers { sender_port } => {
            handle_get_peers(network, peer, cid, sender_port).await;
        }
        Message::PeerList { peers } => {
            debug!("Received a PeerList of {} records from {peer:?}", peers.len());
            let _ = network.add_peer_infos(peers);
        }
        Message::NodeInfo { sender_address } => {
            trace!("{peer:?} announces its address as [{sender_address}]");
            // Tell the remote the address we actually know it by.
            let reply = Message::NodeInfo {
                sender_address: peer.address(),
            };
            peer.conn.write_channel_data(cid, reply.encode());
        }
        other => {
            warn!("Ignoring unexpected {other:?} from {peer:?}");
        }
    }
}

/// Serve a `GetPeers`: echo when we are the serving side, repair the
/// peer's recorded port if its announcement disagrees, then stream our
/// live peer list in chunks.
async fn handle_get_peers(
    network: &Network,
    peer: &Arc<LivePeer>,
    cid: ChannelId,
    sender_port: u32,
) {
    use crate::peer_store::Direction;

    if peer.direction == Direction::Inbound {
        let echo = Message::GetPeers {
            sender_port: u32::from(network.listen_port()),
        };
        peer.conn.write_channel_data(cid, echo.encode());
    }

    let address = peer.address();
    if let Some((host, port)) = address.rsplit_once(':') {
        if port.parse::<u32>().ok() != Some(sender_port) && sender_port <= u32::from(u16::MAX) {
            network.send_cmd(NetworkCmd::UpdatePeerAddress {
                old_address: address.clone(),
                new_address: format!("{host}:{sender_port}"),
            });
        }
    }

    let peers = match network.connected_peers(None).await {
        Ok(peers) => peers,
        Err(_) => return,
    };
    let infos: Vec<PeerInfo> = peers.iter().map(|live| live.to_peer_info()).collect();

    if infos.is_empty() {
        peer.conn
            .write_channel_data(cid, Message::PeerList { peers: vec![] }.encode());
        return;
    }
    for chunk in infos.chunks(PEER_LIST_CHUNK) {
        let msg = Message::PeerList {
            peers: chunk.to_vec(),
        };
        peer.conn.write_channel_data(cid, msg.encode());
    }
}

/// Client half of connection setup: ask the new peer for its peer list
/// and learn our externally visible address from it.
pub(crate) async fn announce(network: Network, peer: Arc<LivePeer>) {
    // GetPeers exchange; responses flow through the regular handler loop.
    if let Some((cid, rx)) = peer.conn.open_channel(CHANNEL_MPEER).await {
        let msg = Message::GetPeers {
            sender_port: u32::from(network.listen_port()),
        };
        peer.conn.write_channel_data(cid, msg.encode());
        let _handle = tokio::spawn(run_overlay_channel(
            network.clone(),
            Arc::clone(&peer),
            cid,
            rx,
        ));
    }

    // NodeInfo exchange on its own short-lived channel.
    if let Some((cid, mut rx)) = peer.conn.open_channel(CHANNEL_MPEER).await {
        let msg = Message::NodeInfo {
            sender_address: network.bind_address().to_string(),
        };
        peer.conn.write_channel_data(cid, msg.encode());
        if let Some(frame) = rx.recv().await {
            if let Ok(Message::NodeInfo { sender_address }) =
                Message::decode_expecting(frame, MSG_NODE_INFO)
            {
                network.send_cmd(NetworkCmd::SetExternalAddress {
                    address: sender_address,
                });
            }
        }
        peer.conn.close_channel(cid);
    }
}
