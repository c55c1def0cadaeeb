// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The iterative lookup engine.
//!
//! One sweep serves three purposes, selected by [`DataMode`]: plain peer
//! discovery, fetching a block, or placing a block. The engine queries a
//! bounded set of its closest live peers, then *keeps those channels open
//! as tunnels*: newly discovered, farther peers are reached by sending
//! nested `Relay` envelopes down the tunnel whose answers first mentioned
//! them, so the initiator never dials the deep nodes it queries. The sweep
//! deepens wave by wave until no closer peer turns up, then runs the data
//! phase against the closest willing holders.
//!
//! Concurrency bookkeeping mirrors the wire protocol: `query_cntr` counts
//! questions with no answer yet, each tunnel's `jobs` counts its share,
//! and a tunnel dying returns its share so waiters always drain.

use crate::{
    block_store::StoreOutcome,
    crypto,
    error::{Error, Result},
    event::NetworkEvent,
    routing::LivePeer,
    transport::{ChannelId, ChannelRx, CHANNEL_MPEER},
    trie::{Slot, XorTrie},
    Network,
};
use bytes::Bytes;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{Mutex, Notify};
use weft_protocol::{
    messages::{
        DataMode, Message, PeerInfo, MSG_DATA_PRESENCE, MSG_DATA_RESPONSE, MSG_DATA_STORED,
        MSG_PEER_LIST, MSG_RELAY, MSG_STORAGE_INTEREST,
    },
    DataId, DataKey, NodeId,
};

/// At most this many `FindNode` questions are outstanding at any instant.
pub const MAX_CONCURRENT_QUERIES: usize = 3;

/// What a finished sweep hands back.
#[derive(Debug, Default)]
pub struct LookupResult {
    /// Peers discovered through tunnels, closest to the target first.
    pub peers: Vec<PeerInfo>,
    /// The verified plaintext, in get mode.
    pub data: Option<Vec<u8>>,
}

/// A candidate in the sweep: an immediate peer (`path == None`) or a far
/// peer addressed by the tunnel indexes chosen at each hop.
struct VPeer {
    info: PeerInfo,
    node_id: NodeId,
    path: Option<Vec<u32>>,
    tunnel: Option<usize>,
    used: bool,
    will_store: bool,
    data_present: bool,
}

/// A root channel kept open to relay through.
struct Tunnel {
    peer: Arc<LivePeer>,
    root_vpeer: usize,
    cid: Option<ChannelId>,
    /// Held here between the root response and the first relay; the
    /// response task takes it.
    queue: Option<ChannelRx>,
    alive: bool,
    jobs: usize,
    task_running: bool,
}

struct Shared {
    vpeers: Vec<VPeer>,
    result_trie: XorTrie<usize>,
    tunnels: Vec<Tunnel>,
    far_peers_by_path: HashMap<Vec<u32>, usize>,
    query_cntr: usize,
    task_cntr: usize,
    sent_data_request: bool,
    data_out: Option<Vec<u8>>,
}

struct LookupCtx {
    network: Network,
    target: NodeId,
    mode: DataMode,
    data_key: Option<DataKey>,
    shared: Mutex<Shared>,
    done_all: Notify,
}

/// Run one full sweep. `data` is the block to place (store mode),
/// `data_key` the decryption key (get mode).
pub(crate) async fn send_find_node(
    network: &Network,
    target: NodeId,
    mode: DataMode,
    data: Option<Bytes>,
    data_key: Option<DataKey>,
) -> Result<LookupResult> {
    let peers = network.connected_peers(None).await?;
    if peers.is_empty() {
        info!("No connected nodes, unable to send FindNode");
        return Err(Error::NoConnectedPeers);
    }

    let known_peer_count = network.peer_store().count().max(1);
    let maximum_depth = known_peer_count.ilog2() as usize;
    info!("Performing FindNode (mode={mode:?}) to a max depth of [{maximum_depth}]");

    // Seed the result trie: ourselves as the sentinel, every live peer as
    // an immediate candidate, the closest few as tunnel roots.
    let mut shared = Shared {
        vpeers: Vec::new(),
        result_trie: XorTrie::new(target),
        tunnels: Vec::new(),
        far_peers_by_path: HashMap::new(),
        query_cntr: 0,
        task_cntr: 0,
        sent_data_request: false,
        data_out: None,
    };
    shared.result_trie.insert_sentinel(network.local_id());

    let mut input = XorTrie::new(target);
    for peer in &peers {
        let id = peer.node_id;
        let _ = input.insert(&id, Arc::clone(peer));
    }
    for (_, slot) in input.iter_closest() {
        let Some(peer) = slot.entry() else { continue };
        let vpeer_index = shared.vpeers.len();
        shared.vpeers.push(VPeer {
            info: peer.to_peer_info(),
            node_id: peer.node_id,
            path: None,
            tunnel: None,
            used: false,
            will_store: false,
            data_present: false,
        });
        if !shared.result_trie.insert_if_vacant(&peer.node_id, vpeer_index) {
            let _ = shared.vpeers.pop();
            continue;
        }
        if shared.tunnels.len() < MAX_CONCURRENT_QUERIES && peer.ready() {
            shared.vpeers[vpeer_index].tunnel = Some(shared.tunnels.len());
            shared.tunnels.push(Tunnel {
                peer: Arc::clone(peer),
                root_vpeer: vpeer_index,
                cid: None,
                queue: None,
                alive: false,
                jobs: 0,
                task_running: false,
            });
        }
    }

    if shared.tunnels.is_empty() {
        info!("Cannot perform FindNode, as we know no closer nodes");
        return Ok(LookupResult::default());
    }

    let ctx = Arc::new(LookupCtx {
        network: network.clone(),
        target,
        mode,
        data_key,
        shared: Mutex::new(shared),
        done_all: Notify::new(),
    });

    // Root wave: one fresh channel per tunnel, results straight into the
    // trie.
    let find_node_frame = Message::FindNode { target, mode }.encode();
    let tunnel_count = ctx.shared.lock().await.tunnels.len();
    let root_queries = (0..tunnel_count)
        .map(|tunnel_index| root_query(Arc::clone(&ctx), tunnel_index, find_node_frame.clone()));
    let _ = futures::future::join_all(root_queries).await;

    // Iterative deepening. At least one wave always runs: the root
    // responses may name peers we have no rows for yet, and relaying is
    // the only way to reach them.
    for _depth in 1..=maximum_depth.max(1) {
        let sent = run_wave(&ctx).await;
        if sent == 0 {
            info!("FindNode search has ended at closest nodes");
            break;
        }
        wait_done_all(&ctx).await;
        if ctx.shared.lock().await.task_cntr == 0 {
            info!("All tasks exited");
            break;
        }
    }

    // Data phase.
    match mode {
        DataMode::Get => data_phase_get(&ctx).await?,
        DataMode::Store => {
            if let Some(data) = data {
                data_phase_store(&ctx, data).await?;
            }
        }
        DataMode::None => {}
    }

    // Close everything now that we are done.
    let mut guard = ctx.shared.lock().await;
    for tunnel in &guard.tunnels {
        if let Some(cid) = tunnel.cid {
            tunnel.peer.conn.close_channel(cid);
        }
    }

    let mut result = LookupResult {
        peers: Vec::new(),
        data: guard.data_out.take(),
    };
    for (_, slot) in guard.result_trie.iter_closest() {
        let Slot::Entry(vpeer_index) = slot else { continue };
        let vpeer = &guard.vpeers[*vpeer_index];
        if vpeer.path.is_some() {
            result.peers.push(vpeer.info.clone());
        }
    }
    info!("FindNode found [{}] peers", result.peers.len());
    Ok(result)
}

/// Open a channel to one root peer, send the `FindNode`, fold its first
/// response(s) into the shared state, and park the response queue on the
/// tunnel for the deepening waves.
async fn root_query(ctx: Arc<LookupCtx>, tunnel_index: usize, find_node_frame: Bytes) {
    let peer = {
        let guard = ctx.shared.lock().await;
        Arc::clone(&guard.tunnels[tunnel_index].peer)
    };

    let Some((cid, mut rx)) = peer.conn.open_channel(CHANNEL_MPEER).await else {
        return;
    };
    {
        let mut guard = ctx.shared.lock().await;
        guard.tunnels[tunnel_index].cid = Some(cid);
    }
    trace!("Sending root level FindNode to {peer:?}");
    peer.conn.write_channel_data(cid, find_node_frame);

    let Some(mut pkt) = rx.recv().await else {
        return;
    };

    if ctx.mode.is_data() {
        {
            let mut guard = ctx.shared.lock().await;
            let root_vpeer = guard.tunnels[tunnel_index].root_vpeer;
            match (ctx.mode, Message::decode(pkt.clone())) {
                (DataMode::Get, Ok(Message::DataPresence { present })) => {
                    guard.vpeers[root_vpeer].data_present = present;
                }
                (DataMode::Store, Ok(Message::StorageInterest { will_store })) => {
                    guard.vpeers[root_vpeer].will_store = will_store;
                }
                (_, other) => {
                    debug!("Unexpected first data-mode packet from {peer:?}: {other:?}");
                }
            }
        }
        match rx.recv().await {
            Some(next) => pkt = next,
            None => {
                // Channel closed between the header and the peer list; the
                // tunnel stays parked and a later handler drains nothing.
                let mut guard = ctx.shared.lock().await;
                guard.tunnels[tunnel_index].queue = Some(rx);
                guard.tunnels[tunnel_index].alive = true;
                return;
            }
        }
    }

    match Message::decode_expecting(pkt, MSG_PEER_LIST) {
        Ok(Message::PeerList { peers }) => {
            trace!(
                "Root level FindNode to {peer:?} returned {} peers",
                peers.len()
            );
            let mut guard = ctx.shared.lock().await;
            for (index, info) in peers.into_iter().enumerate() {
                register_far_peer(&mut guard, ctx.mode, info, vec![index as u32], tunnel_index);
            }
        }
        other => {
            debug!("Root response from {peer:?} was not a PeerList: {other:?}");
        }
    }

    let mut guard = ctx.shared.lock().await;
    guard.tunnels[tunnel_index].queue = Some(rx);
    guard.tunnels[tunnel_index].alive = true;
}

/// Record a peer learned through a tunnel. First report of an identity or
/// of a path wins; later duplicates are dropped.
fn register_far_peer(
    guard: &mut Shared,
    mode: DataMode,
    info: PeerInfo,
    path: Vec<u32>,
    tunnel_index: usize,
) {
    let node_id = info.node_id();
    let vpeer_index = guard.vpeers.len();
    guard.vpeers.push(VPeer {
        info,
        node_id,
        path: Some(path.clone()),
        tunnel: Some(tunnel_index),
        used: false,
        will_store: false,
        data_present: false,
    });
    let _ = guard.result_trie.insert_if_vacant(&node_id, vpeer_index);
    if mode.is_data() {
        let _ = guard.far_peers_by_path.entry(path).or_insert(vpeer_index);
    }
}

/// Send one wave of relayed `FindNode`s at the closest unqueried far
/// peers. Returns how many went out.
async fn run_wave(ctx: &Arc<LookupCtx>) -> usize {
    let mut to_spawn: Vec<(usize, ChannelRx)> = Vec::new();
    let sent;
    {
        let mut guard = ctx.shared.lock().await;
        let tunnel_count = guard.tunnels.len();
        let order: Vec<Option<usize>> = guard
            .result_trie
            .iter_closest()
            .map(|(_, slot)| match slot {
                Slot::Sentinel => None,
                Slot::Entry(index) => Some(*index),
            })
            .collect();

        let mut sent_now = 0;
        let mut direct_passed = 0;
        for slot in order {
            // The sentinel is ourselves; results beyond it do not matter,
            // but results between remain fair game, so just skip it.
            let Some(vpeer_index) = slot else { continue };

            let (path, used, tunnel) = {
                let vpeer = &guard.vpeers[vpeer_index];
                (vpeer.path.clone(), vpeer.used, vpeer.tunnel)
            };
            let Some(path) = path else {
                // Immediate peers were asked at the root; once we have
                // walked past as many as we opened tunnels to, everything
                // farther is not worth relaying to.
                direct_passed += 1;
                if direct_passed == tunnel_count {
                    break;
                }
                continue;
            };
            if used {
                continue;
            }
            let Some(tunnel_index) = tunnel else { continue };
            let (alive, cid, peer) = {
                let tunnel = &guard.tunnels[tunnel_index];
                (tunnel.alive, tunnel.cid, Arc::clone(&tunnel.peer))
            };
            if !alive {
                continue;
            }
            let Some(cid) = cid else { continue };

            trace!("Sending FindNode to path {path:?}");
            peer.conn
                .write_channel_data(cid, generate_relay_packets(&path, None));
            guard.vpeers[vpeer_index].used = true;
            guard.query_cntr += 1;
            guard.tunnels[tunnel_index].jobs += 1;
            sent_now += 1;

            if !guard.tunnels[tunnel_index].task_running {
                guard.tunnels[tunnel_index].task_running = true;
                guard.task_cntr += 1;
                if let Some(rx) = guard.tunnels[tunnel_index].queue.take() {
                    to_spawn.push((tunnel_index, rx));
                }
            }

            if guard.query_cntr == MAX_CONCURRENT_QUERIES {
                break;
            }
        }
        sent = sent_now;
    }

    for (tunnel_index, rx) in to_spawn {
        let _handle = tokio::spawn(process_relay_responses(Arc::clone(ctx), tunnel_index, rx));
    }
    sent
}

/// Block until every outstanding question has an answer (or its tunnel
/// died and refunded it).
async fn wait_done_all(ctx: &Arc<LookupCtx>) {
    loop {
        let notified = ctx.done_all.notified();
        if ctx.shared.lock().await.query_cntr == 0 {
            return;
        }
        notified.await;
    }
}

fn settle_one(guard: &mut Shared, tunnel_index: usize, ctx: &LookupCtx) {
    if guard.tunnels[tunnel_index].jobs > 0 {
        guard.tunnels[tunnel_index].jobs -= 1;
    }
    guard.query_cntr = guard.query_cntr.saturating_sub(1);
    if guard.query_cntr == 0 {
        ctx.done_all.notify_waiters();
    }
}

/// One tunnel's response pump: unwrap relay envelopes, fold peers and
/// flags into the shared state, and keep the counters honest. Exits when
/// the channel closes; any unanswered questions the tunnel still owed are
/// refunded on the way out.
async fn process_relay_responses(ctx: Arc<LookupCtx>, tunnel_index: usize, mut rx: ChannelRx) {
    while let Some(pkt) = rx.recv().await {
        let sent_data_request = ctx.shared.lock().await.sent_data_request;

        let is_relay = matches!(Message::peek_type(&pkt), Ok(MSG_RELAY));
        let (pkts, path) = if sent_data_request && !is_relay {
            // After the data phase starts, immediate peers answer without
            // an envelope.
            (vec![pkt], None)
        } else {
            trace!("Unwrapping relay packet");
            let (pkts, path) = unwrap_relay_packets(pkt, ctx.mode);
            (pkts, Some(path))
        };
        let Some(first) = pkts.first() else { continue };
        let Ok(first_type) = Message::peek_type(first) else {
            continue;
        };

        let peer_list_pkt = if ctx.mode.is_data() && first_type != MSG_PEER_LIST {
            // A node with no closer peers and no data closed its channel,
            // which surfaces here as data packets or flag packets instead
            // of a peer list.
            if sent_data_request {
                match ctx.mode {
                    DataMode::Get => {
                        if first_type != MSG_DATA_RESPONSE {
                            // Too late; only DataResponse matters now.
                            continue;
                        }
                        let Ok(Message::DataResponse {
                            original_size,
                            data,
                        }) = Message::decode(first.clone())
                        else {
                            continue;
                        };
                        let verified = verify_data_response(&ctx, original_size, data).await;
                        let mut guard = ctx.shared.lock().await;
                        let valid = verified.is_some();
                        if valid {
                            guard.data_out = verified;
                        }
                        settle_one(&mut guard, tunnel_index, &ctx);
                        if valid {
                            break;
                        }
                        continue;
                    }
                    DataMode::Store => {
                        if first_type != MSG_DATA_STORED {
                            continue;
                        }
                        trace!("Received DataStored through tunnel [{tunnel_index}]");
                        let mut guard = ctx.shared.lock().await;
                        settle_one(&mut guard, tunnel_index, &ctx);
                        continue;
                    }
                    DataMode::None => continue,
                }
            }

            // Pre-data-phase: the far peer's flag packet rides in front of
            // its peer list.
            if let Some(path) = &path {
                let mut guard = ctx.shared.lock().await;
                let flagged = guard.far_peers_by_path.get(path).copied();
                match (ctx.mode, Message::decode(first.clone())) {
                    (DataMode::Get, Ok(Message::DataPresence { present })) => {
                        match flagged {
                            Some(vpeer_index) if present => {
                                guard.vpeers[vpeer_index].data_present = true;
                            }
                            None => warn!("Far node not found in map for path {path:?}"),
                            _ => {}
                        }
                    }
                    (DataMode::Store, Ok(Message::StorageInterest { will_store })) => {
                        match flagged {
                            Some(vpeer_index) if will_store => {
                                guard.vpeers[vpeer_index].will_store = true;
                            }
                            None => warn!("Far node not found in map for path {path:?}"),
                            _ => {}
                        }
                    }
                    _ => {}
                }
            }
            match pkts.get(1) {
                Some(second) => second.clone(),
                None => continue,
            }
        } else {
            first.clone()
        };

        let Ok(Message::PeerList { peers }) = Message::decode(peer_list_pkt) else {
            warn!("Tunnel [{tunnel_index}] produced an undecodable peer list; dropping tunnel");
            break;
        };

        let Some(path) = path else {
            // A bare peer list with no envelope: answer accounting only.
            let mut guard = ctx.shared.lock().await;
            settle_one(&mut guard, tunnel_index, &ctx);
            continue;
        };

        let mut guard = ctx.shared.lock().await;
        debug!(
            "Tunnel [{tunnel_index}] returned a peer list of {} for path {path:?}",
            peers.len()
        );
        for (index, info) in peers.into_iter().enumerate() {
            let mut end_path = path.clone();
            end_path.push(index as u32);
            register_far_peer(&mut guard, ctx.mode, info, end_path, tunnel_index);
        }

        if guard.tunnels[tunnel_index].jobs == 0 {
            info!("Got extra result from tunnel (path={path:?})");
            continue;
        }
        settle_one(&mut guard, tunnel_index, &ctx);
    }

    // Tunnel is gone: refund whatever it still owed so waiters drain.
    let mut guard = ctx.shared.lock().await;
    let owed = guard.tunnels[tunnel_index].jobs;
    if owed > 0 {
        guard.tunnels[tunnel_index].jobs = 0;
        guard.query_cntr = guard.query_cntr.saturating_sub(owed);
        if guard.query_cntr == 0 {
            ctx.done_all.notify_waiters();
        }
    }
    guard.tunnels[tunnel_index].alive = false;
    guard.tunnels[tunnel_index].task_running = false;
    guard.task_cntr = guard.task_cntr.saturating_sub(1);
}

async fn verify_data_response(
    ctx: &Arc<LookupCtx>,
    original_size: u32,
    data: Bytes,
) -> Option<Vec<u8>> {
    let data_key = ctx.data_key?;
    tokio::task::spawn_blocking(move || {
        crypto::decrypt_and_verify(&data, original_size as usize, &data_key)
    })
    .await
    .ok()
    .flatten()
}

/// Walk the converged trie closest-first, pulling the block from each
/// willing holder in turn until one copy verifies.
async fn data_phase_get(ctx: &Arc<LookupCtx>) -> Result<()> {
    let order = snapshot_order(ctx).await;
    {
        ctx.shared.lock().await.sent_data_request = true;
    }

    for slot in order {
        let Some(vpeer_index) = slot else {
            // The sentinel: we may hold the block ourselves.
            let data_id = DataId::from(ctx.target);
            if !ctx.network.block_store().has_block(&data_id) {
                continue;
            }
            info!("We have the data; fetching");
            let Ok(Some((ciphertext, original_size))) =
                ctx.network.block_store().retrieve(&data_id).await
            else {
                continue;
            };
            match verify_data_response(ctx, original_size as u32, ciphertext).await {
                Some(plaintext) => {
                    ctx.shared.lock().await.data_out = Some(plaintext);
                    break;
                }
                None => {
                    warn!("Data from ourselves was invalid!");
                    continue;
                }
            }
        };

        if !send_data_phase_query(ctx, vpeer_index, Message::GetData.encode()).await {
            continue;
        }

        // One holder at a time, stopping at the first verified copy.
        wait_done_all(ctx).await;
        if ctx.shared.lock().await.data_out.is_some() {
            break;
        }
    }

    if ctx.shared.lock().await.data_out.is_none() {
        info!("Failed to find the data!");
    }
    Ok(())
}

/// Push the block to every willing holder among the closest found,
/// ourselves included when the admission check wants it.
async fn data_phase_store(ctx: &Arc<LookupCtx>, data: Bytes) -> Result<()> {
    let order = snapshot_order(ctx).await;
    {
        ctx.shared.lock().await.sent_data_request = true;
    }

    let data_id = DataId::from(ctx.target);
    for slot in order {
        let Some(vpeer_index) = slot else {
            let (will_store, need_pruning) =
                ctx.network.block_store().check_do_want_data(&data_id);
            if !will_store {
                continue;
            }
            info!("We are choosing to additionally store the data locally");
            match ctx
                .network
                .block_store()
                .store_block(&data_id, data.clone(), need_pruning)
                .await
            {
                Ok(StoreOutcome::Stored { pruned }) => {
                    ctx.network.notify(NetworkEvent::BlockStored(data_id));
                    for pruned_id in pruned {
                        ctx.network.notify(NetworkEvent::BlockPruned(pruned_id));
                    }
                }
                Ok(_) => {}
                Err(err) => info!("We failed to store the data: {err:?}"),
            }
            continue;
        };

        let msg = Message::StoreData {
            data_id: ctx.target.into(),
            data: data.clone(),
        };
        if !send_data_phase_query(ctx, vpeer_index, msg.encode()).await {
            continue;
        }

        if ctx.shared.lock().await.query_cntr == MAX_CONCURRENT_QUERIES {
            break;
        }
    }

    let outstanding = ctx.shared.lock().await.query_cntr;
    info!("Sent StoreData to [{outstanding}] nodes");
    if outstanding > 0 {
        wait_done_all(ctx).await;
    }
    Ok(())
}

/// The trie order frozen before the data phase mutates state underneath.
async fn snapshot_order(ctx: &Arc<LookupCtx>) -> Vec<Option<usize>> {
    ctx.shared
        .lock()
        .await
        .result_trie
        .iter_closest()
        .map(|(_, slot)| match slot {
            Slot::Sentinel => None,
            Slot::Entry(index) => Some(*index),
        })
        .collect()
}

/// Send one data-phase message to a candidate, if its flags and tunnel
/// allow. Returns whether a question is now outstanding.
async fn send_data_phase_query(ctx: &Arc<LookupCtx>, vpeer_index: usize, msg: Bytes) -> bool {
    let mut to_spawn: Option<(usize, ChannelRx)> = None;
    let sent;
    {
        let mut guard = ctx.shared.lock().await;
        let vpeer = &guard.vpeers[vpeer_index];
        let wanted = match ctx.mode {
            DataMode::Get => vpeer.data_present,
            DataMode::Store => vpeer.will_store,
            DataMode::None => false,
        };
        if !wanted {
            return false;
        }
        let Some(tunnel_index) = vpeer.tunnel else {
            return false;
        };
        let path = vpeer.path.clone();
        let (alive, cid, peer) = {
            let tunnel = &guard.tunnels[tunnel_index];
            (tunnel.alive, tunnel.cid, Arc::clone(&tunnel.peer))
        };
        if !alive {
            // Reached through a tunnel that has since closed.
            return false;
        }
        let Some(cid) = cid else { return false };

        debug!(
            "Sending data-phase message to [{}] via path {path:?}",
            guard.vpeers[vpeer_index].info.address
        );
        let pkt = match &path {
            Some(path) => generate_relay_packets(path, Some(msg)),
            None => msg,
        };
        peer.conn.write_channel_data(cid, pkt);
        guard.query_cntr += 1;
        guard.tunnels[tunnel_index].jobs += 1;

        if !guard.tunnels[tunnel_index].task_running {
            guard.tunnels[tunnel_index].task_running = true;
            guard.task_cntr += 1;
            if let Some(rx) = guard.tunnels[tunnel_index].queue.take() {
                to_spawn = Some((tunnel_index, rx));
            }
        }
        sent = true;
    }
    if let Some((tunnel_index, rx)) = to_spawn {
        let _handle = tokio::spawn(process_relay_responses(Arc::clone(ctx), tunnel_index, rx));
    }
    sent
}

/// Build the nested relay envelope for `path`. An empty innermost envelope
/// means "open this tunnel and forward the original FindNode"; a payload
/// rides as the innermost packet instead.
fn generate_relay_packets(path: &[u32], payload: Option<Bytes>) -> Bytes {
    let mut pkt = payload;
    for index in path.iter().rev() {
        let packets = match pkt.take() {
            Some(inner) => vec![inner],
            None => vec![],
        };
        pkt = Some(Message::Relay {
            index: *index,
            packets,
        }
        .encode());
    }
    pkt.unwrap_or_default()
}

/// Peel the relay envelopes off a tunnel response, accumulating the hop
/// path, until the terminal packet(s). A malformed envelope degrades to
/// "no result": an empty flag packet plus an empty peer list.
fn unwrap_relay_packets(pkt: Bytes, mode: DataMode) -> (Vec<Bytes>, Vec<u32>) {
    let mut path = Vec::new();
    let mut current = pkt;
    let mut result: Option<Vec<Bytes>> = None;

    loop {
        let Ok(Message::Relay { index, packets }) = Message::decode(current.clone()) else {
            break;
        };
        path.push(index);

        match packets.len() {
            1 => {
                let inner = packets.into_iter().next().unwrap_or_default();
                let inner_type = Message::peek_type(&inner).unwrap_or(0);
                if inner_type == MSG_PEER_LIST
                    || (mode == DataMode::Get && inner_type == MSG_DATA_RESPONSE)
                    || (mode == DataMode::Store && inner_type == MSG_DATA_STORED)
                {
                    result = Some(vec![inner]);
                } else if inner_type == MSG_RELAY {
                    current = inner;
                    continue;
                } else {
                    warn!("Unexpected packet type [{inner_type}] in relay chain; ignoring");
                }
            }
            2 => {
                // Data-mode terminals carry the flag packet and the peer
                // list together.
                let first_type = Message::peek_type(&packets[0]).unwrap_or(0);
                let second_type = Message::peek_type(&packets[1]).unwrap_or(0);
                let valid = match mode {
                    DataMode::Get => {
                        first_type == MSG_DATA_PRESENCE && second_type == MSG_PEER_LIST
                    }
                    DataMode::Store => {
                        first_type == MSG_STORAGE_INTEREST && second_type == MSG_PEER_LIST
                    }
                    DataMode::None => false,
                };
                if valid {
                    result = Some(packets);
                }
            }
            _ => {}
        }
        break;
    }

    match result {
        Some(pkts) => (pkts, path),
        None => {
            warn!("Unwrapping found invalid state");
            let mut pkts = Vec::new();
            match mode {
                DataMode::Get => pkts.push(Message::DataPresence { present: false }.encode()),
                DataMode::Store => {
                    pkts.push(Message::StorageInterest { will_store: false }.encode());
                }
                DataMode::None => {}
            }
            pkts.push(Message::PeerList { peers: vec![] }.encode());
            (pkts, path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_envelopes_nest_outermost_first() {
        let pkt = generate_relay_packets(&[2, 0, 5], None);
        let (pkts, path) = unwrap_relay_packets(pkt, DataMode::None);
        // An all-empty chain is the "open tunnel" form; unwrapping it
        // yields the no-result substitution but preserves the hop path.
        assert_eq!(path, vec![2, 0, 5]);
        assert_eq!(pkts.len(), 1);

        let payload = Message::GetData.encode();
        let pkt = generate_relay_packets(&[1], Some(payload.clone()));
        match Message::decode(pkt).expect("outer relay should decode") {
            Message::Relay { index, packets } => {
                assert_eq!(index, 1);
                assert_eq!(packets, vec![payload]);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn unwrap_reads_the_full_path_of_a_response() {
        let inner = Message::PeerList { peers: vec![] }.encode();
        let wrapped = Message::Relay {
            index: 4,
            packets: vec![Message::Relay {
                index: 7,
                packets: vec![inner.clone()],
            }
            .encode()],
        }
        .encode();

        let (pkts, path) = unwrap_relay_packets(wrapped, DataMode::None);
        assert_eq!(path, vec![4, 7]);
        assert_eq!(pkts, vec![inner]);
    }

    #[test]
    fn unwrap_accepts_the_two_packet_data_terminal() {
        let flag = Message::StorageInterest { will_store: true }.encode();
        let list = Message::PeerList { peers: vec![] }.encode();
        let wrapped = Message::Relay {
            index: 0,
            packets: vec![flag.clone(), list.clone()],
        }
        .encode();

        let (pkts, path) = unwrap_relay_packets(wrapped, DataMode::Store);
        assert_eq!(path, vec![0]);
        assert_eq!(pkts, vec![flag, list]);
    }

    #[test]
    fn malformed_envelopes_degrade_to_an_empty_result() {
        // A relay chain terminating in garbage must not kill the wave; it
        // becomes an empty flag + empty peer list.
        let wrapped = Message::Relay {
            index: 3,
            packets: vec![Message::GetData.encode()],
        }
        .encode();

        let (pkts, path) = unwrap_relay_packets(wrapped, DataMode::Store);
        assert_eq!(path, vec![3]);
        assert_eq!(pkts.len(), 2);
        assert!(matches!(
            Message::peek_type(&pkts[0]),
            Ok(MSG_STORAGE_INTEREST)
        ));
        assert!(matches!(Message::peek_type(&pkts[1]), Ok(MSG_PEER_LIST)));
    }
}
