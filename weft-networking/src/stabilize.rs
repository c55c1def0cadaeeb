// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Stabilization: periodic probing of the id space to keep buckets
//! populated.
//!
//! One sweep looks for peers around ourselves, around our antipode, and
//! then once per bucket from the farthest inward, stopping once it reaches
//! the territory the first probe already covered. Peers found along the
//! way go through the regular admission pipeline, which derives their
//! identity from their keys; nothing a probe announced is trusted.

use crate::{
    error::{Error, Result},
    peer_store::{Direction, PeerCandidate},
    Network,
};
use weft_protocol::{
    messages::{DataMode, PeerInfo},
    NODE_ID_BITS,
};

/// Run one stabilization sweep.
pub(crate) async fn do_stabilize(network: &Network) -> Result<()> {
    let local_id = *network.local_id();

    // Closest to ourselves.
    let closest = match probe(network, local_id).await {
        Ok(found) => found,
        Err(Error::NoConnectedPeers) => {
            info!("No connected nodes, unable to perform stabilize");
            return Ok(());
        }
        Err(err) => return Err(err),
    };
    let closest_found_distance = closest
        .iter()
        .map(|info| local_id.log_distance(&info.node_id()))
        .filter(|distance| *distance != 0)
        .min();

    // Furthest from ourselves.
    let furthest = probe(network, local_id.inverted()).await.unwrap_or_default();

    let closest_found_distance = match closest_found_distance {
        Some(distance) => distance,
        None => {
            let distance = furthest
                .iter()
                .map(|info| local_id.log_distance(&info.node_id()))
                .filter(|distance| *distance != 0)
                .min()
                .unwrap_or(NODE_ID_BITS as u16);
            if usize::from(distance) == NODE_ID_BITS && furthest.is_empty() {
                info!(
                    "Don't know how close a bucket to stop at so not searching \
                     inbetween closest and furthest"
                );
                return Ok(());
            }
            distance
        }
    };

    // One probe per bucket, farthest first, stopping where the closest
    // probe already reached.
    for bit in (0..NODE_ID_BITS).rev() {
        if bit + 1 == usize::from(closest_found_distance) {
            break;
        }
        info!("Performing FindNode for bucket [{}]", bit + 1);
        let target = local_id.with_flipped_bit(bit);
        debug_assert_eq!(local_id.log_distance(&target) as usize, bit + 1);
        if probe(network, target).await.is_err() {
            break;
        }
    }
    Ok(())
}

/// One `FindNode` sweep towards `target`, feeding everything found back
/// through peer admission.
async fn probe(network: &Network, target: weft_protocol::NodeId) -> Result<Vec<PeerInfo>> {
    let result =
        crate::lookup::send_find_node(network, target, DataMode::None, None, None).await?;

    // The wire carries no node ids for peers, only keys; admission will
    // recompute every identity.
    let candidates: Vec<PeerCandidate> = result
        .peers
        .iter()
        .map(|info| PeerCandidate {
            address: info.address.clone(),
            public_key: Some(info.public_key.clone()),
            direction: Direction::Outbound,
        })
        .collect();
    let _ = network.add_peer_candidates(candidates, false);

    Ok(result.peers)
}
