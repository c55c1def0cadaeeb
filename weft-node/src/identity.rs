// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Long-term node identity.
//!
//! The overlay derives a node's id from the public half of its key
//! material. Key generation and the secure transport that proves
//! possession are external concerns; what the node keeps here is the
//! public blob whose digest is its stable identity across restarts.

use bytes::Bytes;
use rand::RngCore;
use std::{io, path::Path};

const IDENTITY_LEN: usize = 64;

/// Load the node's public identity material, creating it on first run.
pub fn load_or_create(path: &Path) -> io::Result<Bytes> {
    match std::fs::read(path) {
        Ok(existing) if !existing.is_empty() => Ok(Bytes::from(existing)),
        Ok(_) | Err(_) => {
            let mut material = vec![0u8; IDENTITY_LEN];
            rand::thread_rng().fill_bytes(&mut material);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, &material)?;
            info!("Created a new node identity at {path:?}");
            Ok(Bytes::from(material))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_protocol::NodeId;

    #[test]
    fn identity_is_stable_across_loads() -> eyre::Result<()> {
        let path = std::env::temp_dir().join(format!(
            "weft-identity-{}-{}",
            std::process::id(),
            rand::random::<u32>()
        ));
        let first = load_or_create(&path)?;
        let second = load_or_create(&path)?;
        assert_eq!(first, second);
        assert_eq!(
            NodeId::from_public_key(&first),
            NodeId::from_public_key(&second)
        );
        std::fs::remove_file(&path)?;
        Ok(())
    }
}
