// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use thiserror::Error;

/// A specialised `Result` type for protocol serialisation.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Protocol level errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("Unrecognised packet type: {0}")]
    UnrecognisedPacketType(u8),

    #[error("Expected packet type {expected} but found {found}")]
    UnexpectedPacketType { expected: u8, found: u8 },

    #[error("Packet was truncated while reading {0}")]
    Truncated(&'static str),

    #[error("Length field of {field} exceeds the remaining packet bytes: {len}")]
    LengthOutOfBounds { field: &'static str, len: usize },

    #[error("A string field did not contain valid UTF-8")]
    InvalidString(#[from] std::string::FromUtf8Error),

    #[error("Peer address is not a valid `host:port` pair: {0}")]
    InvalidPeerAddress(String),

    #[error("Identifier must be {expected} bytes, got {found}")]
    InvalidIdLength { expected: usize, found: usize },

    #[error("Key is not valid hex")]
    HexDecode(#[from] hex::FromHexError),

    #[error("Key is not valid base58")]
    Base58Decode(#[from] bs58::decode::Error),
}
