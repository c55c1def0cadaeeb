// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

#[macro_use]
extern crate tracing;

use clap::Parser;
use color_eyre::Result;
use std::{net::SocketAddr, path::PathBuf};
use tracing_subscriber::EnvFilter;
use weft_node::{identity, NodeBuilder};

#[derive(Parser, Debug)]
#[clap(name = "weftnode", version = env!("CARGO_PKG_VERSION"))]
struct Opt {
    /// Address the overlay listens on.
    #[clap(long, default_value = "0.0.0.0:4250")]
    listen_addr: SocketAddr,

    /// Host other peers should dial us back on, when it differs from the
    /// listen host (e.g. when listening on a wildcard address).
    #[clap(long)]
    announce_host: Option<String>,

    /// Address the HTTP gateway listens on. Pass `--no-gateway` to run a
    /// storage-only node.
    #[clap(long, default_value = "127.0.0.1:4251")]
    gateway_addr: SocketAddr,

    #[clap(long)]
    no_gateway: bool,

    /// Root directory for keys, peer snapshots and stored blocks.
    /// Defaults to a `weft` dir under the platform data dir.
    #[clap(long)]
    root_dir: Option<PathBuf>,

    /// Instance name, for running several nodes out of one root dir.
    #[clap(long, default_value = "0")]
    instance: String,

    /// A known peer to bootstrap from, as `host:port`. Repeatable.
    #[clap(long = "peer")]
    peers: Vec<String>,

    /// Cap on the local datastore, in bytes.
    #[clap(long)]
    max_datastore_bytes: Option<u64>,
}

fn default_root_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
        .join(".weft")
}

fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let opt = Opt::parse();
    let root_dir = opt.root_dir.clone().unwrap_or_else(default_root_dir);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(opt, root_dir))
}

async fn run(opt: Opt, root_dir: PathBuf) -> Result<()> {
    let public_key = identity::load_or_create(&root_dir.join(&opt.instance).join("identity"))?;

    let mut builder = NodeBuilder::new(public_key, root_dir, opt.listen_addr);
    builder.instance(&opt.instance);
    builder.bootstrap_peers(opt.peers.clone());
    if let Some(host) = opt.announce_host.clone() {
        builder.announce_host(host);
    }
    if !opt.no_gateway {
        builder.gateway_addr(opt.gateway_addr);
    }
    if let Some(max) = opt.max_datastore_bytes {
        builder.max_datastore_bytes(max);
    }

    let node = builder.build_and_run().await?;
    info!(
        "weftnode up; overlay on [{}], id {:?}",
        node.network.bind_address(),
        node.network.local_id()
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    node.shutdown().await;
    Ok(())
}
