// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The dial control loop.
//!
//! One cycle works from the closest unconnected bucket outward: a producer
//! fetches dial candidates per distance (twice the bucket's free room at a
//! time), a consumer dials them with a bounded number of sockets in flight,
//! and the cycle ends when enough connections landed or the candidate
//! supply ran dry. The bounded batch channel is the backpressure between
//! the two: the producer only fetches ahead by one distance.

use crate::{
    cmd::PendingConn,
    driver::HANDSHAKE_TIMEOUT,
    peer_store::{Direction, PeerRecord},
    routing::{LivePeer, BUCKET_SIZE},
    transport::{exchange_handshake, spawn_mux, HandshakeInfo},
    Network,
};
use futures::{stream::FuturesUnordered, StreamExt};
use std::{sync::Arc, time::Duration};
use tokio::{net::TcpStream, sync::mpsc};
use weft_protocol::NODE_ID_BITS;

/// At most this many TCP dials are in flight at once.
const MAX_CONCURRENT_DIALS: usize = 5;
/// A dial that has not completed within this window is abandoned.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Run one dial cycle: forced rows first, then the per-distance sweep.
pub(crate) async fn run_dial_cycle(network: Network, mut needed: usize, forced: Vec<u64>) {
    info!("Processing connection count (needed={needed})");

    for row_id in forced {
        let Some(row) = network.peer_store().get(row_id) else {
            continue;
        };
        if connect_peer(&network, row, true).await.is_some() {
            needed = needed.saturating_sub(1);
        }
    }
    if needed == 0 {
        return;
    }

    let Some(closest_distance) = network.peer_store().min_unconnected_distance() else {
        debug!("No dialable peer rows with a known distance");
        return;
    };

    // Producer: one batch of candidates per distance, restarting the sweep
    // from the closest bucket as long as the previous sweep found anything.
    // Attempted rows fall behind the retry grace, so sweeps terminate.
    let (batch_tx, mut batch_rx) = mpsc::channel::<Vec<PeerRecord>>(1);
    let producer_network = network.clone();
    let producer = tokio::spawn(async move {
        let mut distance = closest_distance;
        let mut fetched = false;
        loop {
            if usize::from(distance) > NODE_ID_BITS {
                if fetched {
                    fetched = false;
                    distance = closest_distance;
                    continue;
                }
                break;
            }

            let fill = producer_network.bucket_fill(distance).await;
            let room = BUCKET_SIZE.saturating_sub(fill);
            if room == 0 {
                distance += 1;
                continue;
            }

            let candidates = producer_network
                .peer_store()
                .candidates_at_distance(distance, room * 2);
            if candidates.is_empty() {
                distance += 1;
                continue;
            }

            fetched = true;
            if batch_tx.send(candidates).await.is_err() {
                // Consumer is satisfied and gone.
                return;
            }
            distance += 1;
        }
        info!("No more available peers to fetch");
    });

    // Consumer: drain batches, keeping at most MAX_CONCURRENT_DIALS sockets
    // in flight, and stop as soon as `needed` lands at zero.
    let mut in_flight = FuturesUnordered::new();
    let mut satisfied = false;

    'batches: while let Some(batch) = batch_rx.recv().await {
        for row in batch {
            let Some(distance) = row.distance else { continue };
            if BUCKET_SIZE.saturating_sub(network.bucket_fill(distance).await) == 0 {
                // The bucket filled while this batch sat in the queue.
                break;
            }

            let network = network.clone();
            in_flight.push(async move { connect_peer(&network, row, false).await });

            if in_flight.len() >= MAX_CONCURRENT_DIALS {
                if let Some(connected) = in_flight.next().await {
                    if connected.is_some() {
                        needed = needed.saturating_sub(1);
                    }
                    if needed == 0 {
                        info!("Connected to requested amount of peers");
                        satisfied = true;
                        break 'batches;
                    }
                }
            }
        }
    }
    drop(batch_rx);
    producer.abort();

    while let Some(connected) = in_flight.next().await {
        if connected.is_some() {
            needed = needed.saturating_sub(1);
        }
    }
    if satisfied {
        info!("Finished connecting");
    } else {
        info!("Finished connecting to all the peers we could find");
    }
}

/// Dial one peer row through handshake and admission. `None` on any
/// failure; the row is marked disconnected so the next cycle can retry it
/// after the grace period.
pub(crate) async fn connect_peer(
    network: &Network,
    row: PeerRecord,
    forced: bool,
) -> Option<Arc<LivePeer>> {
    if !network.peer_store().begin_connect(row.id) {
        return None;
    }

    info!("Connecting to peer (id={}, addr=[{}])", row.id, row.address);

    let connect = async {
        let mut stream = TcpStream::connect(&row.address).await?;
        let ours = HandshakeInfo::new(network.public_key().clone(), network.listen_port());
        let handshake = exchange_handshake(&mut stream, &ours).await?;
        let remote_host = stream
            .peer_addr()
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|_| {
                row.address
                    .rsplit_once(':')
                    .map(|(host, _)| host.to_string())
                    .unwrap_or_else(|| row.address.clone())
            });
        Ok::<_, crate::error::Error>((stream, handshake, remote_host))
    };

    let (stream, handshake, remote_host) =
        match tokio::time::timeout(CONNECT_TIMEOUT.max(HANDSHAKE_TIMEOUT), connect).await {
            Ok(Ok(parts)) => parts,
            Ok(Err(err)) => {
                info!("Connection to peer (id=[{}]) failed: {err:?}", row.id);
                network.peer_store().mark_disconnected(row.id);
                return None;
            }
            Err(_) => {
                info!("Connection to peer (id=[{}]) timed out", row.id);
                network.peer_store().mark_disconnected(row.id);
                return None;
            }
        };

    let (conn, incoming) = spawn_mux(stream, true);
    match network
        .admit(PendingConn {
            conn,
            incoming,
            handshake,
            remote_host,
            direction: Direction::Outbound,
            row_id: Some(row.id),
            forced,
        })
        .await
    {
        Ok(peer) => Some(peer),
        Err(err) => {
            debug!("Admission of dialled peer (id=[{}]) refused: {err:?}", row.id);
            None
        }
    }
}
