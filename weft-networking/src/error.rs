// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use std::{io, path::PathBuf};
use thiserror::Error;
use tokio::sync::oneshot;

pub(super) type Result<T, E = Error> = std::result::Result<T, E>;

/// Internal error.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum Error {
    #[error("No connected peers, cannot run the operation")]
    NoConnectedPeers,

    #[error("Internal messaging channel was dropped")]
    InternalMsgChannelDropped,

    #[error("The engine command channel is at capacity")]
    NoCmdChannelCapacity,

    #[error("Connection to peer [{0}] was refused during admission")]
    ConnectionRefused(String),

    #[error("Handshake with [{0}] did not complete")]
    HandshakeFailed(String),

    #[error("Peer [{address}] authenticated with an unexpected identity")]
    UnexpectedPeerIdentity { address: String },

    #[error("Peer is ourselves (distance zero)")]
    SelfConnection,

    #[error("Could not create storage dir: {path:?}, error: {source}")]
    FailedToCreateStorageDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Block for {0:?} was not found locally")]
    BlockNotFound(weft_protocol::DataId),

    #[error("Retrieved data failed its hash check")]
    DataVerificationFailed,

    #[error("Data block of {size} bytes exceeds the maximum of {max}")]
    BlockTooLarge { size: usize, max: usize },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] weft_protocol::Error),

    #[error("Store snapshot serialisation failed: {0}")]
    Snapshot(#[from] serde_json::Error),

    #[error("The oneshot::sender has been dropped")]
    SenderDropped(#[from] oneshot::error::RecvError),

    #[error("Listen address was not provided during construction")]
    ListenAddressNotProvided,
}
