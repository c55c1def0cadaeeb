// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use weft_protocol::{DataId, NodeId};

/// Events forwarded by the engine; to be used by the upper layers.
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    /// A peer passed admission and entered the routing structures.
    PeerConnected {
        node_id: NodeId,
        address: String,
    },
    /// A peer left the routing structures.
    PeerDisconnected {
        node_id: NodeId,
        address: String,
    },
    /// A block arrived over the overlay and was committed to the store.
    BlockStored(DataId),
    /// A block was evicted to make room for a closer one.
    BlockPruned(DataId),
    /// Another node told us the address it reached us on.
    ExternalAddressReported(String),
}
