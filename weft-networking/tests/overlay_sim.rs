// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! End-to-end overlay scenarios over real sockets on localhost.

use bytes::Bytes;
use std::time::{Duration, Instant};
use weft_networking::{EngineBuilder, LocalState, Network};
use weft_protocol::{DataKey, NodeId};

async fn spawn_node(key: &[u8]) -> eyre::Result<Network> {
    let root_dir = std::env::temp_dir().join(format!(
        "weft-sim-{}-{}",
        std::process::id(),
        rand::random::<u64>()
    ));
    let mut builder = EngineBuilder::new(Bytes::copy_from_slice(key), root_dir);
    builder.listen_addr("127.0.0.1:0".parse()?);
    builder.max_datastore_bytes(64 * 1024 * 1024);
    let (network, _events, driver) = builder.build().await?;
    let _handle = tokio::spawn(driver.run());
    Ok(network)
}

async fn wait_for_state(
    network: &Network,
    what: &str,
    pred: impl Fn(&LocalState) -> bool,
) -> LocalState {
    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        if let Ok(state) = network.local_state().await {
            if pred(&state) {
                return state;
            }
        }
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Flip a byte in every stored block file under a node's storage dir, so
/// every `DataResponse` it serves fails the hash check.
fn corrupt_stored_blocks(network: &Network) -> usize {
    let mut corrupted = 0;
    let dir = network.block_store().storage_dir();
    for entry in std::fs::read_dir(dir).expect("storage dir should exist") {
        let path = entry.expect("dir entry").path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("blk") {
            continue;
        }
        let mut content = std::fs::read(&path).expect("block file should read");
        if let Some(first) = content.first_mut() {
            *first ^= 0x01;
        }
        std::fs::write(&path, content).expect("block file should write");
        corrupted += 1;
    }
    corrupted
}

#[tokio::test(flavor = "multi_thread")]
async fn two_node_store_and_fetch() -> eyre::Result<()> {
    let node_a = spawn_node(b"sim key a").await?;
    let node_b = spawn_node(b"sim key b").await?;

    assert_eq!(node_b.add_peer(node_a.bind_address(), true), 1);
    let _ = wait_for_state(&node_a, "a sees b", |s| s.connected_peers.len() == 1).await;
    let _ = wait_for_state(&node_b, "b sees a", |s| s.connected_peers.len() == 1).await;

    let key = node_a.store_data(Bytes::from_static(b"hello")).await?;
    // The addressing law: the key handed back is the plaintext hash.
    assert_eq!(key, DataKey::from_plaintext(b"hello"));

    let fetched = node_b.get_data(&key).await?;
    assert_eq!(fetched.as_deref(), Some(b"hello".as_ref()));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn store_reaches_a_peer_behind_a_relay() -> eyre::Result<()> {
    // a - b - c, with a and c strangers to each other at store time.
    let node_a = spawn_node(b"relay key a").await?;
    let node_b = spawn_node(b"relay key b").await?;
    let node_c = spawn_node(b"relay key c").await?;

    assert_eq!(node_a.add_peer(node_b.bind_address(), true), 1);
    let _ = wait_for_state(&node_a, "a sees b", |s| s.connected_peers.len() == 1).await;
    assert_eq!(node_c.add_peer(node_b.bind_address(), true), 1);
    let _ = wait_for_state(&node_c, "c sees b", |s| s.connected_peers.len() == 1).await;
    let _ = wait_for_state(&node_b, "b sees both", |s| s.connected_peers.len() == 2).await;

    // Craft a block whose id lies closer to c than to b, so the sweep must
    // push past b to reach c.
    let c_id = *node_c.local_id();
    let b_id = *node_b.local_id();
    let payload = (0u32..)
        .map(|i| format!("relayed block {i}").into_bytes())
        .find(|data| {
            let target: NodeId = DataKey::from_plaintext(data).data_id().into();
            target.distance(&c_id) < target.distance(&b_id)
        })
        .expect("some payload lands closer to c");

    let key = node_a.store_data(Bytes::from(payload.clone())).await?;

    // c holds the block even though a never dialled it.
    let _ = wait_for_state(&node_c, "c stores the block", |s| s.block_count >= 1).await;

    let fetched = node_a.get_data(&key).await?;
    assert_eq!(fetched.as_deref(), Some(payload.as_slice()));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn corrupted_copies_are_rejected_end_to_end() -> eyre::Result<()> {
    let node_a = spawn_node(b"corrupt key a").await?;
    let node_b = spawn_node(b"corrupt key b").await?;

    assert_eq!(node_b.add_peer(node_a.bind_address(), true), 1);
    let _ = wait_for_state(&node_a, "a sees b", |s| s.connected_peers.len() == 1).await;
    let _ = wait_for_state(&node_b, "b sees a", |s| s.connected_peers.len() == 1).await;

    let key = node_a.store_data(Bytes::from_static(b"precious data")).await?;
    let _ = wait_for_state(&node_a, "a stores locally", |s| s.block_count >= 1).await;
    let _ = wait_for_state(&node_b, "b stores a copy", |s| s.block_count >= 1).await;

    // Rot every copy on every node.
    assert!(corrupt_stored_blocks(&node_a) >= 1);
    assert!(corrupt_stored_blocks(&node_b) >= 1);

    // Every candidate fails the hash check, so the fetch comes back empty
    // rather than returning bad bytes.
    let fetched = node_a.get_data(&key).await?;
    assert_eq!(fetched, None);
    let fetched = node_b.get_data(&key).await?;
    assert_eq!(fetched, None);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn find_node_for_own_id_terminates_at_self() -> eyre::Result<()> {
    let node_a = spawn_node(b"self key a").await?;
    let node_b = spawn_node(b"self key b").await?;

    assert_eq!(node_b.add_peer(node_a.bind_address(), true), 1);
    let _ = wait_for_state(&node_a, "a sees b", |s| s.connected_peers.len() == 1).await;

    // Nobody can be closer to a's id than a itself, so the sweep ends in
    // one wave with no tunnelled discoveries.
    let found = node_a.find_node(*node_a.local_id()).await?;
    assert!(found.is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn peers_learn_each_other_through_the_exchange() -> eyre::Result<()> {
    // c connects to b after a did; the GetPeers exchange should teach c
    // about a without anyone configuring it.
    let node_a = spawn_node(b"exchange key a").await?;
    let node_b = spawn_node(b"exchange key b").await?;
    let node_c = spawn_node(b"exchange key c").await?;

    assert_eq!(node_a.add_peer(node_b.bind_address(), true), 1);
    let _ = wait_for_state(&node_b, "b sees a", |s| s.connected_peers.len() == 1).await;
    assert_eq!(node_c.add_peer(node_b.bind_address(), true), 1);
    let _ = wait_for_state(&node_c, "c sees b", |s| s.connected_peers.len() == 1).await;

    let _ = wait_for_state(&node_c, "c learns of a", |s| s.known_peer_count >= 2).await;
    Ok(())
}
