// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha512};
use std::fmt::{self, Debug, Display, Formatter};

/// Width of the overlay keyspace.
pub const NODE_ID_BITS: usize = 512;
/// Width of the overlay keyspace in bytes.
pub const NODE_ID_BYTES: usize = NODE_ID_BITS / 8;

/// A 512-bit identifier in the overlay keyspace.
///
/// Node identities are derived from a peer's long-term public key via
/// [`NodeId::from_public_key`] and are never taken on trust from a remote
/// announcement. Data addresses live in the same keyspace (see
/// [`crate::storage`]) so that proximity between a node and a block is the
/// plain XOR metric.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; NODE_ID_BYTES]);

impl NodeId {
    /// Derive the identity of the holder of `public_key`.
    pub fn from_public_key(public_key: &[u8]) -> Self {
        Self(Sha512::digest(public_key).into())
    }

    /// Digest arbitrary content into the keyspace.
    pub fn from_content(content: &[u8]) -> Self {
        Self(Sha512::digest(content).into())
    }

    pub const fn from_bytes(bytes: [u8; NODE_ID_BYTES]) -> Self {
        Self(bytes)
    }

    /// Parse an id from a wire field, which must be exactly 64 bytes.
    pub fn try_from_slice(slice: &[u8]) -> Result<Self> {
        let bytes: [u8; NODE_ID_BYTES] =
            slice.try_into().map_err(|_| Error::InvalidIdLength {
                expected: NODE_ID_BYTES,
                found: slice.len(),
            })?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_BYTES] {
        &self.0
    }

    /// The raw XOR distance between two ids.
    pub fn distance(&self, other: &NodeId) -> Distance {
        let mut out = [0u8; NODE_ID_BYTES];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Distance(out)
    }

    /// The log distance between two ids: `0` iff equal, otherwise the
    /// 1-based index of the most significant differing bit. This is the
    /// bucket index of `other` relative to `self`.
    pub fn log_distance(&self, other: &NodeId) -> u16 {
        self.distance(other).log2()
    }

    /// The id with every bit flipped; the furthest point of the keyspace.
    pub fn inverted(&self) -> NodeId {
        let mut out = self.0;
        for byte in out.iter_mut() {
            *byte = !*byte;
        }
        Self(out)
    }

    /// Flip the single bit `bit` (counted from the least significant end),
    /// producing an id at log distance `bit + 1` from `self`. Used by the
    /// stabilisation walk to craft one probe target per bucket.
    pub fn with_flipped_bit(&self, bit: usize) -> NodeId {
        debug_assert!(bit < NODE_ID_BITS);
        let mut out = self.0;
        out[NODE_ID_BYTES - 1 - (bit >> 3)] ^= 1 << (bit & 7);
        Self(out)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)?;
        Self::try_from_slice(&bytes)
    }
}

impl Debug for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        // Only the leading bytes; full ids drown the logs.
        write!(f, "NodeId({})", &self.to_hex()[..8])
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        NodeId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// The raw 512-bit XOR of two ids.
///
/// Byte-wise big-endian ordering of the XOR is exactly the XOR-metric
/// ordering, so the derived `Ord` makes "closest first" a plain sort and
/// lets a `BTreeMap<Distance, _>` serve as the XOR-ordered prefix trie.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Distance(pub(crate) [u8; NODE_ID_BYTES]);

impl Distance {
    pub const ZERO: Distance = Distance([0u8; NODE_ID_BYTES]);
    pub const MAX: Distance = Distance([0xffu8; NODE_ID_BYTES]);

    /// `0` for the zero distance, otherwise 1 + the index of the most
    /// significant set bit: the value in `0..=512` used as bucket index.
    pub fn log2(&self) -> u16 {
        for (i, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                let msb_in_byte = 7 - byte.leading_zeros() as usize;
                let bit = (NODE_ID_BYTES - 1 - i) * 8 + msb_in_byte;
                return (bit + 1) as u16;
            }
        }
        0
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|byte| *byte == 0)
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_BYTES] {
        &self.0
    }
}

impl Debug for Distance {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Distance(log2={})", self.log2())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id_with_low_byte(byte: u8) -> NodeId {
        let mut bytes = [0u8; NODE_ID_BYTES];
        bytes[NODE_ID_BYTES - 1] = byte;
        NodeId::from_bytes(bytes)
    }

    #[test]
    fn log_distance_of_equal_ids_is_zero() {
        let id = NodeId::from_content(b"some peer");
        assert_eq!(id.log_distance(&id), 0);
        assert!(id.distance(&id).is_zero());
    }

    #[test]
    fn log_distance_is_one_based_msb_index() {
        let zero = NodeId::from_bytes([0u8; NODE_ID_BYTES]);
        assert_eq!(zero.log_distance(&id_with_low_byte(0b0000_0001)), 1);
        assert_eq!(zero.log_distance(&id_with_low_byte(0b0000_0010)), 2);
        assert_eq!(zero.log_distance(&id_with_low_byte(0b1000_0000)), 8);

        let mut high = [0u8; NODE_ID_BYTES];
        high[0] = 0b1000_0000;
        assert_eq!(zero.log_distance(&NodeId::from_bytes(high)), 512);
    }

    #[test]
    fn flipping_bit_b_lands_in_bucket_b_plus_one() {
        let id = NodeId::from_content(b"local node");
        for bit in [0usize, 1, 7, 8, 63, 200, 511] {
            let probe = id.with_flipped_bit(bit);
            assert_eq!(id.log_distance(&probe), (bit + 1) as u16, "bit {bit}");
        }
    }

    #[test]
    fn inverted_id_is_at_maximum_log_distance() {
        let id = NodeId::from_content(b"local node");
        assert_eq!(id.log_distance(&id.inverted()), 512);
    }

    #[test]
    fn distance_ordering_matches_xor_magnitude() {
        let origin = NodeId::from_bytes([0u8; NODE_ID_BYTES]);
        let near = origin.distance(&id_with_low_byte(0x01));
        let far = origin.distance(&id_with_low_byte(0xf0));
        assert!(near < far);
        assert!(Distance::ZERO < near);
        assert!(far < Distance::MAX);
    }

    #[test]
    fn node_id_hex_round_trip() -> eyre::Result<()> {
        let id = NodeId::from_public_key(b"a public key");
        let parsed = NodeId::from_hex(&id.to_hex())?;
        assert_eq!(id, parsed);
        assert!(NodeId::from_hex("abcd").is_err());
        Ok(())
    }

    #[test]
    fn serde_round_trips_as_hex_string() -> eyre::Result<()> {
        let id = NodeId::from_public_key(b"another key");
        let json = serde_json::to_string(&id)?;
        assert_eq!(json, format!("\"{}\"", id.to_hex()));
        let back: NodeId = serde_json::from_str(&json)?;
        assert_eq!(id, back);
        Ok(())
    }
}
