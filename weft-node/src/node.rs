// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use crate::gateway::{self, GatewayHandle};
use bytes::Bytes;
use std::{net::SocketAddr, path::PathBuf};
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use weft_networking::{EngineBuilder, Network, NetworkEvent};

/// Node level errors.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Engine error: {0}")]
    Engine(#[from] weft_networking::Error),

    #[error("Gateway error: {0}")]
    Gateway(#[from] hyper::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything needed to assemble and start one node.
pub struct NodeBuilder {
    public_key: Bytes,
    root_dir: PathBuf,
    instance: String,
    listen_addr: SocketAddr,
    announce_host: Option<String>,
    gateway_addr: Option<SocketAddr>,
    bootstrap_peers: Vec<String>,
    max_datastore_bytes: Option<u64>,
}

impl NodeBuilder {
    pub fn new(public_key: Bytes, root_dir: PathBuf, listen_addr: SocketAddr) -> Self {
        Self {
            public_key,
            root_dir,
            instance: "0".to_string(),
            listen_addr,
            announce_host: None,
            gateway_addr: None,
            bootstrap_peers: Vec::new(),
            max_datastore_bytes: None,
        }
    }

    pub fn instance(&mut self, instance: impl Into<String>) {
        self.instance = instance.into();
    }

    pub fn announce_host(&mut self, host: impl Into<String>) {
        self.announce_host = Some(host.into());
    }

    pub fn gateway_addr(&mut self, addr: SocketAddr) {
        self.gateway_addr = Some(addr);
    }

    pub fn bootstrap_peers(&mut self, peers: Vec<String>) {
        self.bootstrap_peers = peers;
    }

    pub fn max_datastore_bytes(&mut self, max: u64) {
        self.max_datastore_bytes = Some(max);
    }

    /// Start the engine driver, the event logger and (when configured)
    /// the gateway, then dial the bootstrap peers.
    pub async fn build_and_run(self) -> Result<RunningNode> {
        let mut engine = EngineBuilder::new(self.public_key, self.root_dir);
        engine.listen_addr(self.listen_addr);
        engine.instance(&self.instance);
        if let Some(host) = self.announce_host {
            engine.announce_host(host);
        }
        if let Some(max) = self.max_datastore_bytes {
            engine.max_datastore_bytes(max);
        }

        let (network, events, driver) = engine.build().await?;
        let _driver_handle = tokio::spawn(driver.run());
        let events_handle = tokio::spawn(log_events(events));

        for peer in &self.bootstrap_peers {
            let _ = network.add_peer(peer.clone(), true);
        }

        let gateway = match self.gateway_addr {
            Some(addr) => Some(gateway::serve(network.clone(), addr).await?),
            None => None,
        };

        Ok(RunningNode {
            network,
            gateway,
            events_handle,
        })
    }
}

/// A started node.
pub struct RunningNode {
    pub network: Network,
    pub gateway: Option<GatewayHandle>,
    events_handle: JoinHandle<()>,
}

impl RunningNode {
    /// Flush persistent state and stop the auxiliary tasks. The engine
    /// driver itself stops when the last `Network` handle is dropped.
    pub async fn shutdown(self) {
        if let Err(err) = self.network.peer_store().flush().await {
            warn!("Final peer snapshot flush failed: {err:?}");
        }
        if let Err(err) = self.network.block_store().flush().await {
            warn!("Final block snapshot flush failed: {err:?}");
        }
        if let Some(gateway) = &self.gateway {
            gateway.abort();
        }
        self.events_handle.abort();
        self.network.shutdown();
    }
}

async fn log_events(mut events: mpsc::Receiver<NetworkEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            NetworkEvent::PeerConnected { node_id, address } => {
                info!("Peer {node_id:?} connected from [{address}]");
            }
            NetworkEvent::PeerDisconnected { node_id, address } => {
                info!("Peer {node_id:?} at [{address}] disconnected");
            }
            NetworkEvent::BlockStored(data_id) => {
                info!("Stored block {data_id:?}");
            }
            NetworkEvent::BlockPruned(data_id) => {
                info!("Pruned block {data_id:?}");
            }
            NetworkEvent::ExternalAddressReported(address) => {
                info!("A peer reports our external address as [{address}]");
            }
        }
    }
}

/// First-bytes content type sniffing for gateway responses.
pub(crate) fn sniff_content_type(data: &[u8]) -> &'static str {
    if data.len() >= 2 && data[0] == 0xff && data[1] == 0xd8 {
        "image/jpeg"
    } else if data.len() >= 4 && data[0] == 0x89 && &data[1..4] == b"PNG" {
        "image/png"
    } else if data.len() >= 5 && &data[..5] == b"GIF89" {
        "image/gif"
    } else {
        "text/html"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn content_type_is_sniffed_from_magic_bytes() {
        assert_eq!(sniff_content_type(&[0xff, 0xd8, 0xff, 0xe0]), "image/jpeg");
        assert_eq!(sniff_content_type(&[0x89, b'P', b'N', b'G']), "image/png");
        assert_eq!(sniff_content_type(b"GIF89a..."), "image/gif");
        assert_eq!(sniff_content_type(b"<html>"), "text/html");
        assert_eq!(sniff_content_type(b""), "text/html");
    }

    async fn http_request(addr: SocketAddr, request: &str) -> eyre::Result<String> {
        let mut stream = tokio::net::TcpStream::connect(addr).await?;
        stream.write_all(request.as_bytes()).await?;
        let mut response = Vec::new();
        let _ = stream.read_to_end(&mut response).await?;
        Ok(String::from_utf8_lossy(&response).into_owned())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn gateway_serves_the_upload_form_and_maps_errors() -> eyre::Result<()> {
        let root_dir = std::env::temp_dir().join(format!(
            "weft-node-test-{}-{}",
            std::process::id(),
            rand::random::<u64>()
        ));
        let mut builder = NodeBuilder::new(
            Bytes::from_static(b"gateway test node"),
            root_dir,
            "127.0.0.1:0".parse()?,
        );
        builder.gateway_addr("127.0.0.1:0".parse()?);
        let node = builder.build_and_run().await?;
        let gateway_addr = node
            .gateway
            .as_ref()
            .map(|gateway| gateway.addr)
            .ok_or_else(|| eyre::eyre!("gateway should be running"))?;

        let response = http_request(
            gateway_addr,
            "GET /upload HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        )
        .await?;
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("fileToUpload"));

        // A path that is neither a key nor a route.
        let response = http_request(
            gateway_addr,
            "GET /definitely-not-a-key HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        )
        .await?;
        assert!(response.starts_with("HTTP/1.1 400"));

        // A well-formed key this lonely node cannot resolve.
        let missing = "ab".repeat(64);
        let response = http_request(
            gateway_addr,
            &format!("GET /{missing} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n"),
        )
        .await?;
        assert!(response.starts_with("HTTP/1.1 404"));

        node.shutdown().await;
        Ok(())
    }
}
