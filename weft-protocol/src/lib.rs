// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Wire protocol and addressing primitives shared by every Weft crate.
//!
//! The overlay lives in a single 512-bit XOR keyspace: node identities are
//! digests of public keys, data addresses are (double) digests of content,
//! and proximity between any two of them is the XOR metric. This crate owns
//! that keyspace ([`NodeId`], [`Distance`]) together with the byte-exact
//! overlay message family ([`messages`]) and the content addressing rules
//! ([`storage`]).

#[macro_use]
extern crate tracing;

/// Errors.
pub mod error;
/// Overlay message family and codec.
pub mod messages;
/// 512-bit identifiers and XOR distance math.
pub mod node_id;
/// Content addressing: data keys and data ids.
pub mod storage;
/// Length-prefixed wire primitives.
pub mod wire;

pub use error::Error;
pub use node_id::{Distance, NodeId, NODE_ID_BITS, NODE_ID_BYTES};
pub use storage::{DataId, DataKey};

/// Re-export of Bytes used throughout the protocol.
pub use bytes::Bytes;

/// The protocol identification string exchanged during the connection
/// handshake. The suffix is the crate version.
pub const PROTOCOL_VERSION_STR: &str = concat!("weft/node/", env!("CARGO_PKG_VERSION"));
