// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The overlay message family.
//!
//! Every message is a single channel frame starting with a 1-byte packet
//! type. The codec is byte-exact: peers on other implementations produce and
//! consume these frames, so nothing here is serde-derived.

use crate::{
    error::{Error, Result},
    node_id::{NodeId, NODE_ID_BYTES},
    storage::DataId,
    wire,
};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt::{self, Debug, Formatter};

pub const MSG_GET_PEERS: u8 = 110;
pub const MSG_PEER_LIST: u8 = 111;
pub const MSG_NODE_INFO: u8 = 112;
pub const MSG_FIND_NODE: u8 = 150;
pub const MSG_RELAY: u8 = 160;
pub const MSG_DATA_PRESENCE: u8 = 170;
pub const MSG_STORAGE_INTEREST: u8 = 171;
pub const MSG_GET_DATA: u8 = 172;
pub const MSG_STORE_DATA: u8 = 173;
pub const MSG_DATA_STORED: u8 = 174;
pub const MSG_DATA_RESPONSE: u8 = 175;

/// What a `FindNode` sweep is ultimately for.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum DataMode {
    /// Plain peer discovery.
    #[default]
    None,
    /// The sweep ends by fetching a data block.
    Get,
    /// The sweep ends by pushing a data block to the willing closest nodes.
    Store,
}

impl DataMode {
    pub fn is_data(self) -> bool {
        !matches!(self, DataMode::None)
    }

    fn to_wire(self) -> u8 {
        match self {
            DataMode::None => 0,
            DataMode::Get => 1,
            DataMode::Store => 2,
        }
    }

    fn from_wire(value: u8) -> Result<Self> {
        match value {
            0 => Ok(DataMode::None),
            1 => Ok(DataMode::Get),
            2 => Ok(DataMode::Store),
            other => Err(Error::UnrecognisedPacketType(other)),
        }
    }
}

/// One record of a [`Message::PeerList`]: a dialable address plus the
/// peer's public key. The node id is deliberately absent from the wire;
/// receivers recompute it from the key.
#[derive(Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub address: String,
    pub public_key: Bytes,
}

impl PeerInfo {
    /// Identity as derived from the carried public key.
    pub fn node_id(&self) -> NodeId {
        NodeId::from_public_key(&self.public_key)
    }
}

impl Debug for PeerInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "PeerInfo({})", self.address)
    }
}

fn check_address(address: &str) -> bool {
    match address.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}

#[derive(Clone, PartialEq, Eq)]
pub enum Message {
    /// Ask a freshly connected peer for its peer list; carries our own
    /// listening port so the remote can fix up our dialback address.
    GetPeers { sender_port: u32 },
    /// A batch of known peers.
    PeerList { peers: Vec<PeerInfo> },
    /// Address exchange: tells the remote the address we reached it on.
    NodeInfo { sender_address: String },
    /// Root query of the iterative lookup.
    FindNode { target: NodeId, mode: DataMode },
    /// One hop of a tunnelled request or response. `packets` is empty to
    /// open tunnel `index`, or carries exactly one wrapped frame to forward
    /// (responses in data mode may carry two).
    Relay { index: u32, packets: Vec<Bytes> },
    /// "I hold the block you are sweeping for."
    DataPresence { present: bool },
    /// "I am willing to store the block you are sweeping with."
    StorageInterest { will_store: bool },
    /// Pull the block a `DataPresence{true}` responder holds.
    GetData,
    /// Push a block to a `StorageInterest{true}` responder.
    StoreData { data_id: DataId, data: Bytes },
    /// Outcome of a `StoreData`.
    DataStored { stored: bool },
    /// The ciphertext of a block, plus the plaintext length to truncate to
    /// after decryption.
    DataResponse { original_size: u32, data: Bytes },
}

impl Message {
    /// The 1-byte packet type, without parsing the body.
    pub fn peek_type(frame: &[u8]) -> Result<u8> {
        frame
            .first()
            .copied()
            .ok_or(Error::Truncated("packet_type"))
    }

    pub fn packet_type(&self) -> u8 {
        match self {
            Message::GetPeers { .. } => MSG_GET_PEERS,
            Message::PeerList { .. } => MSG_PEER_LIST,
            Message::NodeInfo { .. } => MSG_NODE_INFO,
            Message::FindNode { .. } => MSG_FIND_NODE,
            Message::Relay { .. } => MSG_RELAY,
            Message::DataPresence { .. } => MSG_DATA_PRESENCE,
            Message::StorageInterest { .. } => MSG_STORAGE_INTEREST,
            Message::GetData => MSG_GET_DATA,
            Message::StoreData { .. } => MSG_STORE_DATA,
            Message::DataStored { .. } => MSG_DATA_STORED,
            Message::DataResponse { .. } => MSG_DATA_RESPONSE,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(self.packet_type());
        match self {
            Message::GetPeers { sender_port } => {
                buf.put_u32(*sender_port);
            }
            Message::PeerList { peers } => {
                buf.put_u32(peers.len() as u32);
                for peer in peers {
                    wire::put_string(&mut buf, &peer.address);
                    wire::put_binary(&mut buf, &peer.public_key);
                }
            }
            Message::NodeInfo { sender_address } => {
                wire::put_string(&mut buf, sender_address);
            }
            Message::FindNode { target, mode } => {
                buf.put_slice(target.as_bytes());
                buf.put_u8(mode.to_wire());
            }
            Message::Relay { index, packets } => {
                buf.put_u32(*index);
                buf.put_u32(packets.len() as u32);
                for packet in packets {
                    wire::put_binary(&mut buf, packet);
                }
            }
            Message::DataPresence { present } => {
                buf.put_u8(u8::from(*present));
            }
            Message::StorageInterest { will_store } => {
                buf.put_u8(u8::from(*will_store));
            }
            Message::GetData => {}
            Message::StoreData { data_id, data } => {
                buf.put_slice(data_id.as_node_id().as_bytes());
                wire::put_binary(&mut buf, data);
            }
            Message::DataStored { stored } => {
                buf.put_u8(u8::from(*stored));
            }
            Message::DataResponse {
                original_size,
                data,
            } => {
                buf.put_u32(*original_size);
                wire::put_binary(&mut buf, data);
            }
        }
        buf.freeze()
    }

    pub fn decode(frame: Bytes) -> Result<Message> {
        let mut buf = frame;
        let packet_type = wire::get_u8(&mut buf, "packet_type")?;
        match packet_type {
            MSG_GET_PEERS => Ok(Message::GetPeers {
                sender_port: wire::get_u32(&mut buf, "sender_port")?,
            }),
            MSG_PEER_LIST => {
                let count = wire::get_u32(&mut buf, "peer count")?;
                let mut peers = Vec::with_capacity(count.min(1024) as usize);
                for _ in 0..count {
                    let address = wire::get_string(&mut buf, "peer address")?;
                    let public_key = wire::get_binary(&mut buf, "peer public key")?;
                    if !check_address(&address) {
                        warn!("Skipping peer record with bad address [{address}]");
                        continue;
                    }
                    peers.push(PeerInfo {
                        address,
                        public_key,
                    });
                }
                Ok(Message::PeerList { peers })
            }
            MSG_NODE_INFO => Ok(Message::NodeInfo {
                sender_address: wire::get_string(&mut buf, "sender_address")?,
            }),
            MSG_FIND_NODE => {
                let id_bytes = wire::get_fixed(&mut buf, NODE_ID_BYTES, "target id")?;
                let target = NodeId::try_from_slice(&id_bytes)?;
                // Plain (pre-data) senders omit the trailing mode byte.
                let mode = if buf.is_empty() {
                    DataMode::None
                } else {
                    DataMode::from_wire(wire::get_u8(&mut buf, "data mode")?)?
                };
                Ok(Message::FindNode { target, mode })
            }
            MSG_RELAY => {
                let index = wire::get_u32(&mut buf, "relay index")?;
                let count = wire::get_u32(&mut buf, "relay packet count")?;
                let mut packets = Vec::with_capacity(count.min(16) as usize);
                for _ in 0..count {
                    packets.push(wire::get_binary(&mut buf, "relayed packet")?);
                }
                Ok(Message::Relay { index, packets })
            }
            MSG_DATA_PRESENCE => Ok(Message::DataPresence {
                present: wire::get_u8(&mut buf, "present")? != 0,
            }),
            MSG_STORAGE_INTEREST => Ok(Message::StorageInterest {
                will_store: wire::get_u8(&mut buf, "will_store")? != 0,
            }),
            MSG_GET_DATA => Ok(Message::GetData),
            MSG_STORE_DATA => {
                let id_bytes = wire::get_fixed(&mut buf, NODE_ID_BYTES, "data id")?;
                Ok(Message::StoreData {
                    data_id: NodeId::try_from_slice(&id_bytes)?.into(),
                    data: wire::get_binary(&mut buf, "block data")?,
                })
            }
            MSG_DATA_STORED => Ok(Message::DataStored {
                stored: wire::get_u8(&mut buf, "stored")? != 0,
            }),
            MSG_DATA_RESPONSE => Ok(Message::DataResponse {
                original_size: wire::get_u32(&mut buf, "original_size")?,
                data: wire::get_binary(&mut buf, "block ciphertext")?,
            }),
            other => Err(Error::UnrecognisedPacketType(other)),
        }
    }

    /// Decode, additionally requiring a particular packet type.
    pub fn decode_expecting(frame: Bytes, expected: u8) -> Result<Message> {
        let found = Self::peek_type(&frame)?;
        if found != expected {
            return Err(Error::UnexpectedPacketType { expected, found });
        }
        Self::decode(frame)
    }
}

/// Debug without block payloads; a `StoreData` can be megabytes.
impl Debug for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Message::GetPeers { sender_port } => write!(f, "GetPeers(port={sender_port})"),
            Message::PeerList { peers } => write!(f, "PeerList(len={})", peers.len()),
            Message::NodeInfo { sender_address } => write!(f, "NodeInfo({sender_address})"),
            Message::FindNode { target, mode } => write!(f, "FindNode({target:?}, {mode:?})"),
            Message::Relay { index, packets } => {
                write!(f, "Relay(index={index}, packets={})", packets.len())
            }
            Message::DataPresence { present } => write!(f, "DataPresence({present})"),
            Message::StorageInterest { will_store } => write!(f, "StorageInterest({will_store})"),
            Message::GetData => write!(f, "GetData"),
            Message::StoreData { data_id, data } => {
                write!(f, "StoreData({data_id:?}, len={})", data.len())
            }
            Message::DataStored { stored } => write!(f, "DataStored({stored})"),
            Message::DataResponse {
                original_size,
                data,
            } => write!(
                f,
                "DataResponse(original_size={original_size}, len={})",
                data.len()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_node_without_mode_byte_is_plain() -> eyre::Result<()> {
        let target = NodeId::from_content(b"target");
        let mut frame = BytesMut::new();
        frame.put_u8(MSG_FIND_NODE);
        frame.put_slice(target.as_bytes());

        match Message::decode(frame.freeze())? {
            Message::FindNode { target: t, mode } => {
                assert_eq!(t, target);
                assert_eq!(mode, DataMode::None);
            }
            other => panic!("unexpected message {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn find_node_carries_its_mode() -> eyre::Result<()> {
        let msg = Message::FindNode {
            target: NodeId::from_content(b"t"),
            mode: DataMode::Store,
        };
        match Message::decode(msg.encode())? {
            Message::FindNode { mode, .. } => assert_eq!(mode, DataMode::Store),
            other => panic!("unexpected message {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn peer_list_skips_records_with_bad_addresses() -> eyre::Result<()> {
        let peers = vec![
            PeerInfo {
                address: "10.0.0.1:4250".into(),
                public_key: Bytes::from_static(b"key one"),
            },
            PeerInfo {
                address: "not-an-address".into(),
                public_key: Bytes::from_static(b"key two"),
            },
        ];
        match Message::decode(Message::PeerList { peers }.encode())? {
            Message::PeerList { peers } => {
                assert_eq!(peers.len(), 1);
                assert_eq!(peers[0].address, "10.0.0.1:4250");
            }
            other => panic!("unexpected message {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn relay_nests_whole_frames() -> eyre::Result<()> {
        let inner = Message::FindNode {
            target: NodeId::from_content(b"deep target"),
            mode: DataMode::Get,
        }
        .encode();
        let outer = Message::Relay {
            index: 2,
            packets: vec![inner.clone()],
        };
        match Message::decode(outer.encode())? {
            Message::Relay { index, packets } => {
                assert_eq!(index, 2);
                assert_eq!(packets, vec![inner]);
            }
            other => panic!("unexpected message {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn truncated_frames_are_rejected_not_panicked() {
        let frame = Message::StoreData {
            data_id: NodeId::from_content(b"block").into(),
            data: Bytes::from_static(b"payload"),
        }
        .encode();

        for cut in [0, 1, 32, 65, frame.len() - 1] {
            let truncated = frame.slice(..cut);
            assert!(
                Message::decode(truncated).is_err() || cut == frame.len(),
                "cut at {cut} should fail"
            );
        }
    }

    #[test]
    fn unknown_packet_type_is_an_error() {
        let err = Message::decode(Bytes::from_static(&[42u8]));
        assert!(matches!(err, Err(Error::UnrecognisedPacketType(42))));
    }

    #[test]
    fn decode_expecting_flags_a_mismatch() {
        let frame = Message::GetData.encode();
        let err = Message::decode_expecting(frame, MSG_PEER_LIST);
        assert!(matches!(
            err,
            Err(Error::UnexpectedPacketType {
                expected: MSG_PEER_LIST,
                found: MSG_GET_DATA,
            })
        ));
    }
}
