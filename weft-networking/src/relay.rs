// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The server half of the lookup protocol: answering `FindNode` and
//! tunnelling the requester onwards.
//!
//! A node answering `FindNode` returns the closest of its own live peers
//! and then stays on the channel as a relay: the requester addresses those
//! peers by index, and this node opens one sub-channel per index,
//! forwarding wrapped requests down and wrapping responses on the way
//! back. When a sub-channel dies, the requester is owed one empty peer
//! list per unanswered request so its wave counters can drain.

use crate::{
    block_store::StoreOutcome,
    event::NetworkEvent,
    routing::LivePeer,
    transport::{ChannelId, ChannelRx, CHANNEL_MPEER},
    Network,
};
use bytes::Bytes;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use tokio::sync::mpsc;
use weft_protocol::{
    messages::{
        DataMode, Message, MSG_DATA_RESPONSE, MSG_DATA_STORED, MSG_GET_DATA, MSG_RELAY,
        MSG_STORE_DATA,
    },
    DataId, NodeId,
};

/// How many closer peers a `FindNode` answer carries. A policy knob, not a
/// protocol constant; requesters must not assume it.
pub const RELAY_FANOUT: usize = 3;

fn empty_peer_list() -> Bytes {
    Message::PeerList { peers: vec![] }.encode()
}

/// One ack per unanswered request lets the requester's counters reach
/// zero.
fn signal_tunnel_closed(requester: &Arc<LivePeer>, cid: ChannelId, index: u32, count: usize) {
    let pkt = Message::Relay {
        index,
        packets: vec![empty_peer_list()],
    }
    .encode();
    for _ in 0..count {
        requester.conn.write_channel_data(cid, pkt.clone());
    }
}

enum TunnelSlot {
    Fresh(Arc<LivePeer>),
    Open {
        jobs: mpsc::UnboundedSender<Bytes>,
        outstanding: Arc<AtomicUsize>,
    },
}

/// Serve one `FindNode` channel until either side walks away.
pub(crate) async fn process_find_node_request(
    network: &Network,
    requester: &Arc<LivePeer>,
    target: NodeId,
    mode: DataMode,
    find_node_frame: Bytes,
    cid: ChannelId,
    queue: &mut ChannelRx,
) {
    // Our own peers, re-keyed towards the target, with ourselves as the
    // stopping point: never relay to anyone farther than we are.
    let Ok(peers) = network.connected_peers(Some(requester.node_id)).await else {
        return;
    };
    let mut trie = crate::trie::XorTrie::new(target);
    for peer in peers {
        let id = peer.node_id;
        let _ = trie.insert(&id, peer);
    }
    trie.insert_sentinel(network.local_id());
    let closest: Vec<Arc<LivePeer>> = trie
        .closest_before_sentinel(RELAY_FANOUT)
        .into_iter()
        .map(Arc::clone)
        .collect();

    let mut will_store = false;
    let mut need_pruning = false;
    let mut data_present = false;
    match mode {
        DataMode::Get => {
            data_present = network.block_store().has_block(&DataId::from(target));
            info!("Writing DataPresence (data_present=[{data_present}]) response");
            requester.conn.write_channel_data(
                cid,
                Message::DataPresence {
                    present: data_present,
                }
                .encode(),
            );
        }
        DataMode::Store => {
            (will_store, need_pruning) = network
                .block_store()
                .check_do_want_data(&DataId::from(target));
            info!("Writing StorageInterest (will_store=[{will_store}]) response");
            requester.conn.write_channel_data(
                cid,
                Message::StorageInterest { will_store }.encode(),
            );
        }
        DataMode::None => {}
    }

    if closest.is_empty() {
        info!("No nodes closer than ourselves");
        if !will_store && !data_present {
            requester.conn.close_channel(cid);
            return;
        }
    }

    info!("Writing PeerList (size={}) response", closest.len());
    let peer_list = Message::PeerList {
        peers: closest.iter().map(|peer| peer.to_peer_info()).collect(),
    };
    requester.conn.write_channel_data(cid, peer_list.encode());

    let mut tunnels: Vec<TunnelSlot> = closest.into_iter().map(TunnelSlot::Fresh).collect();
    let open_tunnels = Arc::new(AtomicUsize::new(tunnels.len()));

    loop {
        let Some(pkt) = queue.recv().await else {
            // Requester channel closed (or the connection went down);
            // dropping the job senders tears the sub-tunnels down.
            return;
        };

        if open_tunnels.load(Ordering::Acquire) == 0 && !will_store && !data_present {
            requester.conn.close_channel(cid);
            return;
        }

        let packet_type = match Message::peek_type(&pkt) {
            Ok(packet_type) => packet_type,
            Err(_) => continue,
        };

        if will_store && packet_type == MSG_STORE_DATA {
            let Ok(Message::StoreData { data_id, data }) = Message::decode(pkt) else {
                warn!("Malformed StoreData from {requester:?}; skipping");
                continue;
            };
            info!("Received StoreData packet, storing");
            let stored = match network
                .block_store()
                .store_block(&data_id, data, need_pruning)
                .await
            {
                Ok(outcome) => {
                    if let StoreOutcome::Stored { pruned } = &outcome {
                        network.notify(NetworkEvent::BlockStored(data_id));
                        for pruned_id in pruned {
                            network.notify(NetworkEvent::BlockPruned(*pruned_id));
                        }
                    }
                    outcome.was_stored()
                }
                Err(err) => {
                    warn!("Failed to store a relayed block: {err:?}");
                    false
                }
            };
            requester
                .conn
                .write_channel_data(cid, Message::DataStored { stored }.encode());
            continue;
        }

        if data_present && packet_type == MSG_GET_DATA {
            info!("Received GetData packet, fetching");
            match network.block_store().retrieve(&DataId::from(target)).await {
                Ok(Some((ciphertext, original_size))) => {
                    let response = Message::DataResponse {
                        original_size: original_size as u32,
                        data: ciphertext,
                    };
                    requester.conn.write_channel_data(cid, response.encode());
                }
                other => {
                    warn!("Block for {target:?} went away before GetData: {other:?}");
                }
            }
            // Once the data is served there is nothing left to tunnel.
            requester.conn.close_channel(cid);
            return;
        }

        let Ok(Message::Relay { index, packets }) = Message::decode(pkt) else {
            warn!("Ignoring unrecognized packet on a FindNode channel");
            continue;
        };
        let slot_index = index as usize;
        if slot_index >= tunnels.len() {
            warn!("Relay index [{index}] out of range; skipping");
            continue;
        }

        enum SlotAction {
            Open(Arc<LivePeer>),
            Forward(mpsc::UnboundedSender<Bytes>, Arc<AtomicUsize>),
        }
        let action = match &tunnels[slot_index] {
            TunnelSlot::Fresh(neighbor) => SlotAction::Open(Arc::clone(neighbor)),
            TunnelSlot::Open { jobs, outstanding } => {
                SlotAction::Forward(jobs.clone(), Arc::clone(outstanding))
            }
        };

        match action {
            SlotAction::Open(neighbor) => {
                // The opening request must be empty; it means "open the
                // tunnel and forward the original FindNode".
                if !packets.is_empty() {
                    warn!(
                        "Peer sent invalid packet (not empty but tunnel not yet opened) \
                         for index [{index}]; skipping"
                    );
                    continue;
                }
                let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
                let outstanding = Arc::new(AtomicUsize::new(1));
                let _ = jobs_tx.send(find_node_frame.clone());

                let _handle = tokio::spawn(run_server_tunnel(
                    Arc::clone(requester),
                    cid,
                    index,
                    neighbor,
                    jobs_rx,
                    Arc::clone(&outstanding),
                    Arc::clone(&open_tunnels),
                    mode,
                ));
                tunnels[slot_index] = TunnelSlot::Open {
                    jobs: jobs_tx,
                    outstanding,
                };
            }
            SlotAction::Forward(jobs, outstanding) => {
                if packets.len() != 1 {
                    warn!(
                        "Peer sent a relay packet with {} embedded packets for tunnel \
                         [{index}]; skipping",
                        packets.len()
                    );
                    continue;
                }
                let inner = packets[0].clone();
                match Message::peek_type(&inner) {
                    Ok(MSG_RELAY) => {}
                    Ok(_) if mode.is_data() => {
                        // A Get/Store going to the immediate next hop; fine.
                    }
                    _ => {
                        warn!("Peer sent a non-relay packet for tunnel [{index}]; skipping");
                        continue;
                    }
                }
                outstanding.fetch_add(1, Ordering::AcqRel);
                if jobs.send(inner).is_err() {
                    // The tunnel task is gone; answer for it.
                    let _ = outstanding.fetch_update(
                        Ordering::AcqRel,
                        Ordering::Acquire,
                        |count| Some(count.saturating_sub(1)),
                    );
                    info!("Skipping request for disconnected tunnel [{index}]");
                    signal_tunnel_closed(requester, cid, index, 1);
                }
            }
        }
    }
}

/// One sub-tunnel: a channel to `neighbor` fed from the jobs queue, with
/// responses wrapped in `Relay{index}` back to the requester.
#[allow(clippy::too_many_arguments)]
async fn run_server_tunnel(
    requester: Arc<LivePeer>,
    requester_cid: ChannelId,
    index: u32,
    neighbor: Arc<LivePeer>,
    mut jobs_rx: mpsc::UnboundedReceiver<Bytes>,
    outstanding: Arc<AtomicUsize>,
    open_tunnels: Arc<AtomicUsize>,
    mode: DataMode,
) {
    info!(
        "Opening tunnel [{index}] to {neighbor:?} for {requester:?}"
    );

    let Some((cid, mut responses)) = neighbor.conn.open_channel(CHANNEL_MPEER).await else {
        let _ = open_tunnels.fetch_sub(1, Ordering::AcqRel);
        let owed = outstanding.swap(0, Ordering::AcqRel);
        signal_tunnel_closed(&requester, requester_cid, index, owed);
        return;
    };

    loop {
        tokio::select! {
            job = jobs_rx.recv() => {
                match job {
                    Some(pkt) => {
                        trace!("Relaying request (index={index}) to {neighbor:?}");
                        neighbor.conn.write_channel_data(cid, pkt);
                    }
                    None => {
                        // The requester side is done with us entirely.
                        neighbor.conn.close_channel(cid);
                        let _ = open_tunnels.fetch_sub(1, Ordering::AcqRel);
                        return;
                    }
                }
            }
            resp = responses.recv() => {
                let Some(pkt) = resp else { break };
                let mut packets = vec![pkt];
                if mode.is_data() {
                    match Message::peek_type(&packets[0]) {
                        Ok(MSG_RELAY) | Ok(MSG_DATA_RESPONSE) | Ok(MSG_DATA_STORED) => {}
                        _ => {
                            // The first data-mode response is a presence or
                            // interest packet followed by a peer list; they
                            // travel back as one relay frame.
                            match responses.recv().await {
                                Some(second) => packets.push(second),
                                None => break,
                            }
                        }
                    }
                }
                trace!("Relaying response (index={index}) from {neighbor:?}");
                let wrapped = Message::Relay { index, packets };
                requester
                    .conn
                    .write_channel_data(requester_cid, wrapped.encode());
                let _ = outstanding
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                        Some(count.saturating_sub(1))
                    });
            }
        }
    }

    // The neighbor hung up with requests possibly still unanswered.
    let _ = open_tunnels.fetch_sub(1, Ordering::AcqRel);
    let owed = outstanding.swap(0, Ordering::AcqRel);
    signal_tunnel_closed(&requester, requester_cid, index, owed);
    neighbor.conn.close_channel(cid);
}
