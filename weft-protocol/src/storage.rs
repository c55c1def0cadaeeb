// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Content addressing.
//!
//! A block of plaintext `x` is addressed twice over:
//!
//! * `data_key = H(x)` — handed to clients, doubles as the decryption key;
//! * `data_id = H(data_key)` — the address blocks are stored and looked up
//!   under.
//!
//! A node holding only ciphertext and its `data_id` cannot demonstrate
//! knowledge of the plaintext; fetching it usefully requires the `data_key`
//! the uploader kept.

use crate::{
    error::Result,
    node_id::{NodeId, NODE_ID_BYTES},
};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug, Display, Formatter};

/// `H(plaintext)` — the client-held retrieval key and decryption secret.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataKey(NodeId);

/// `H(data_key)` — the overlay address a block is stored under.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DataId(NodeId);

impl DataKey {
    pub fn from_plaintext(plaintext: &[u8]) -> Self {
        Self(NodeId::from_content(plaintext))
    }

    /// The address this key's block is stored under.
    pub fn data_id(&self) -> DataId {
        DataId(NodeId::from_content(self.0.as_bytes()))
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_BYTES] {
        self.0.as_bytes()
    }

    pub fn to_hex(&self) -> String {
        self.0.to_hex()
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        Ok(Self(NodeId::from_hex(s)?))
    }

    pub fn to_base58(&self) -> String {
        bs58::encode(self.0.as_bytes()).into_string()
    }

    pub fn from_base58(s: &str) -> Result<Self> {
        let bytes = bs58::decode(s).into_vec()?;
        Ok(Self(NodeId::try_from_slice(&bytes)?))
    }
}

impl DataId {
    pub fn from_bytes(bytes: [u8; NODE_ID_BYTES]) -> Self {
        Self(NodeId::from_bytes(bytes))
    }

    /// The id viewed as a point of the shared keyspace, for distance math
    /// against node identities.
    pub fn as_node_id(&self) -> &NodeId {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        self.0.to_hex()
    }
}

impl From<DataId> for NodeId {
    fn from(id: DataId) -> NodeId {
        id.0
    }
}

impl From<NodeId> for DataId {
    fn from(id: NodeId) -> DataId {
        DataId(id)
    }
}

impl Debug for DataKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "DataKey({})", &self.to_hex()[..8])
    }
}

impl Debug for DataId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "DataId({})", &self.to_hex()[..8])
    }
}

impl Display for DataId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_and_id_are_the_double_hash() {
        // Law: key_of(store(x)) == H(x) and id_of(store(x)) == H(H(x)).
        let plaintext = b"hello";
        let key = DataKey::from_plaintext(plaintext);
        assert_eq!(*key.as_bytes(), *NodeId::from_content(plaintext).as_bytes());

        let id = key.data_id();
        let expected = NodeId::from_content(NodeId::from_content(plaintext).as_bytes());
        assert_eq!(*id.as_node_id(), expected);
    }

    #[test]
    fn base58_and_hex_round_trip() -> eyre::Result<()> {
        let key = DataKey::from_plaintext(b"round trip");
        assert_eq!(DataKey::from_hex(&key.to_hex())?, key);
        assert_eq!(DataKey::from_base58(&key.to_base58())?, key);
        assert!(DataKey::from_base58("0OIl").is_err());
        Ok(())
    }
}
