// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The content-addressed block repository.
//!
//! Metadata rows live in memory behind the block-table lock; ciphertext
//! lives in one file per block under the node's storage dir. The store is
//! biased towards its own neighbourhood of the keyspace: when full, a new
//! block is only admitted if strictly farther blocks can be pruned to make
//! room, so over time each node converges on holding the data closest to
//! its own id.
//!
//! Accounting rule: `used_bytes` (the `DATASTORE_SIZE` of the node state)
//! is only ever adjusted while holding the table lock, in the same critical
//! section as the row changes it accounts for.

use crate::{
    crypto,
    error::{Error, Result},
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    sync::Mutex,
    time::SystemTime,
};
use weft_protocol::{DataId, DataKey, Distance, NodeId};

/// Largest single block the store (and therefore the overlay) accepts.
pub const MAX_DATA_BLOCK_SIZE: usize = 1024 * 1024;

/// Metadata for one stored block.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockRecord {
    pub id: u64,
    pub data_id: DataId,
    pub original_size: u64,
    pub insert_timestamp: SystemTime,
}

/// Configuration for a [`BlockStore`].
#[derive(Debug, Clone)]
pub struct BlockStoreConfig {
    /// Directory holding `{id}.blk` files and the metadata snapshot.
    pub storage_dir: PathBuf,
    /// Total plaintext bytes the store will hold.
    pub max_bytes: u64,
}

/// Outcome of a store attempt, reported back over the wire as
/// `DataStored{stored}`.
#[derive(Debug, PartialEq, Eq)]
pub enum StoreOutcome {
    /// Committed; carries the ids of any blocks pruned to make room.
    Stored { pruned: Vec<DataId> },
    /// A row for this `data_id` already exists.
    AlreadyHave,
    /// The store is full and the block is too far to displace anything.
    Refused,
}

impl StoreOutcome {
    pub fn was_stored(&self) -> bool {
        matches!(self, StoreOutcome::Stored { .. })
    }
}

#[derive(Default, Serialize, Deserialize)]
struct Tables {
    next_id: u64,
    rows: BTreeMap<u64, BlockRecord>,
    used_bytes: u64,
    #[serde(skip)]
    by_data_id: HashMap<DataId, u64>,
    #[serde(skip)]
    dirty: bool,
}

/// A block store rooted at one node's keyspace position.
pub struct BlockStore {
    local_id: NodeId,
    config: BlockStoreConfig,
    inner: Mutex<Tables>,
}

impl BlockStore {
    pub fn with_config(local_id: NodeId, config: BlockStoreConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.storage_dir).map_err(|source| {
            Error::FailedToCreateStorageDir {
                path: config.storage_dir.clone(),
                source,
            }
        })?;
        Ok(Self {
            local_id,
            config,
            inner: Mutex::new(Tables::default()),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn block_path(&self, id: u64) -> PathBuf {
        self.config.storage_dir.join(format!("{id}.blk"))
    }

    fn snapshot_path(&self) -> PathBuf {
        self.config.storage_dir.join("blocks.json")
    }

    /// Distance of a block to this node, always recomputed from the two
    /// ids, never cached.
    fn distance_of(&self, data_id: &DataId) -> Distance {
        self.local_id.distance(data_id.as_node_id())
    }

    pub fn block_count(&self) -> usize {
        self.lock().rows.len()
    }

    /// The `DATASTORE_SIZE` node state value.
    pub fn used_bytes(&self) -> u64 {
        self.lock().used_bytes
    }

    pub fn has_block(&self, data_id: &DataId) -> bool {
        self.lock().by_data_id.contains_key(data_id)
    }

    /// Admission check: do we want this block at all, and would storing it
    /// require pruning? Never admits a block farther than everything held.
    pub fn check_do_want_data(&self, data_id: &DataId) -> (bool, bool) {
        let tables = self.lock();
        if tables.used_bytes < self.config.max_bytes {
            return (true, false);
        }

        let distance = self.distance_of(data_id);
        let mut freeable: u64 = 0;
        for row in tables.rows.values() {
            if self.distance_of(&row.data_id) > distance {
                freeable += row.original_size;
                if freeable >= MAX_DATA_BLOCK_SIZE as u64 {
                    return (true, true);
                }
            }
        }
        (false, true)
    }

    /// Store a block, pruning farther blocks when `need_pruning` was
    /// signalled at admission. The row commit and size accounting happen
    /// under the table lock; the ciphertext write happens after, with a
    /// compensating rollback if it fails.
    pub async fn store_block(
        &self,
        claimed_id: &DataId,
        data: Bytes,
        need_pruning: bool,
    ) -> Result<StoreOutcome> {
        if data.len() > MAX_DATA_BLOCK_SIZE {
            return Err(Error::BlockTooLarge {
                size: data.len(),
                max: MAX_DATA_BLOCK_SIZE,
            });
        }

        let data_key = DataKey::from_plaintext(&data);
        let data_id = data_key.data_id();
        if data_id != *claimed_id {
            warn!("Peer sent a data_id that didn't match the data!");
        }

        let distance = self.distance_of(&data_id);
        let original_size = data.len() as u64;

        // Commit phase, entirely under the table lock.
        let (block_id, pruned) = {
            let mut tables = self.lock();

            if tables.by_data_id.contains_key(&data_id) {
                debug!("Not storing data that we already have ({data_id:?})");
                return Ok(StoreOutcome::AlreadyHave);
            }

            let mut pruned: Vec<(u64, DataId)> = Vec::new();
            let mut freed: u64 = 0;
            if need_pruning {
                let mut farther: Vec<(Distance, u64, u64)> = tables
                    .rows
                    .values()
                    .map(|row| {
                        (self.distance_of(&row.data_id), row.id, row.original_size)
                    })
                    .filter(|(d, _, _)| *d > distance)
                    .collect();
                farther.sort_by(|a, b| b.0.cmp(&a.0));

                for (_, id, size) in farther {
                    freed += size;
                    if let Some(row) = tables.rows.get(&id) {
                        pruned.push((id, row.data_id));
                    }
                    if freed >= original_size {
                        break;
                    }
                }
                if freed < original_size {
                    // Another upload must have beaten this one to the room
                    // we said we could free.
                    info!("Not storing block we said we would; cannot free enough space");
                    return Ok(StoreOutcome::Refused);
                }
                for (id, _) in &pruned {
                    if let Some(row) = tables.rows.remove(id) {
                        let _ = tables.by_data_id.remove(&row.data_id);
                    }
                }
                info!("Pruning {} blocks to make room", pruned.len());
            }

            tables.next_id += 1;
            let block_id = tables.next_id;
            let _ = tables.rows.insert(
                block_id,
                BlockRecord {
                    id: block_id,
                    data_id,
                    original_size,
                    insert_timestamp: SystemTime::now(),
                },
            );
            let _ = tables.by_data_id.insert(data_id, block_id);

            let size_diff = original_size as i64 - if need_pruning { freed as i64 } else { 0 };
            tables.used_bytes = tables.used_bytes.saturating_add_signed(size_diff);
            tables.dirty = true;

            (block_id, pruned)
        };

        // Files of pruned rows go after the commit, exactly like the
        // original's post-commit unlink.
        for (id, _) in &pruned {
            let path = self.block_path(*id);
            if let Err(err) = tokio::fs::remove_file(&path).await {
                error!("Error while removing pruned block file {path:?}: {err:?}");
            }
        }

        // Encrypt off the event loop and write the ciphertext.
        let encrypt_input = data.clone();
        let write_result: Result<()> = async {
            let ciphertext = tokio::task::spawn_blocking(move || {
                crypto::encrypt_data_block(&encrypt_input, &data_key)
            })
            .await
            .map_err(|_| Error::DataVerificationFailed)??;
            tokio::fs::write(self.block_path(block_id), &ciphertext).await?;
            Ok(())
        }
        .await;

        match write_result {
            Ok(()) => {
                info!(
                    "Stored data for data_id=[{}] as [{block_id}.blk]",
                    data_id.to_hex()
                );
                Ok(StoreOutcome::Stored {
                    pruned: pruned.into_iter().map(|(_, data_id)| data_id).collect(),
                })
            }
            Err(err) => {
                warn!("There was an error attempting to store the data on disk: {err:?}");
                // Compensate: the row and its accounting roll back under
                // the same lock they were committed under.
                {
                    let mut tables = self.lock();
                    if let Some(row) = tables.rows.remove(&block_id) {
                        let _ = tables.by_data_id.remove(&row.data_id);
                        tables.used_bytes =
                            tables.used_bytes.saturating_sub(row.original_size);
                        tables.dirty = true;
                    }
                }
                let _ = tokio::fs::remove_file(self.block_path(block_id)).await;
                Ok(StoreOutcome::Refused)
            }
        }
    }

    /// Read a block's ciphertext and the plaintext size to truncate to
    /// after decryption. `Ok(None)` when we do not hold the block.
    pub async fn retrieve(&self, data_id: &DataId) -> Result<Option<(Bytes, u64)>> {
        let record = {
            let tables = self.lock();
            let id = match tables.by_data_id.get(data_id) {
                Some(id) => *id,
                None => return Ok(None),
            };
            tables.rows.get(&id).cloned()
        };
        let Some(record) = record else {
            return Ok(None);
        };

        match tokio::fs::read(self.block_path(record.id)).await {
            Ok(ciphertext) => Ok(Some((Bytes::from(ciphertext), record.original_size))),
            Err(err) => {
                error!(
                    "Error while reading block file [{}.blk]: {err:?}",
                    record.id
                );
                Err(err.into())
            }
        }
    }

    /// Load the metadata snapshot of a previous run.
    pub async fn load(&self) -> Result<usize> {
        let raw = match tokio::fs::read(self.snapshot_path()).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };
        let mut tables: Tables = serde_json::from_slice(&raw)?;
        tables.by_data_id = tables
            .rows
            .iter()
            .map(|(id, row)| (row.data_id, *id))
            .collect();
        let count = tables.rows.len();
        *self.lock() = tables;
        Ok(count)
    }

    /// Persist the metadata snapshot if anything changed.
    pub async fn flush(&self) -> Result<()> {
        let serialized = {
            let mut tables = self.lock();
            if !tables.dirty {
                return Ok(());
            }
            tables.dirty = false;
            serde_json::to_vec(&*tables)?
        };
        let path = self.snapshot_path();
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &serialized).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    pub fn storage_dir(&self) -> &Path {
        &self.config.storage_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_protocol::NODE_ID_BYTES;

    fn temp_store(max_bytes: u64) -> BlockStore {
        let dir = std::env::temp_dir().join(format!(
            "weft-block-store-{}-{}",
            std::process::id(),
            rand::random::<u32>()
        ));
        BlockStore::with_config(
            NodeId::from_bytes([0u8; NODE_ID_BYTES]),
            BlockStoreConfig {
                storage_dir: dir,
                max_bytes,
            },
        )
        .expect("store dir should be creatable")
    }

    #[tokio::test]
    async fn store_then_retrieve_round_trips() -> eyre::Result<()> {
        let store = temp_store(1024 * 1024);
        let data = Bytes::from_static(b"hello");
        let key = DataKey::from_plaintext(&data);
        let id = key.data_id();

        let outcome = store.store_block(&id, data.clone(), false).await?;
        assert!(outcome.was_stored());
        assert!(store.has_block(&id));
        assert_eq!(store.used_bytes(), data.len() as u64);

        let (ciphertext, original_size) = store
            .retrieve(&id)
            .await?
            .ok_or_else(|| eyre::eyre!("block should be present"))?;
        assert_eq!(original_size, data.len() as u64);
        let plaintext = crypto::decrypt_and_verify(&ciphertext, original_size as usize, &key)
            .ok_or_else(|| eyre::eyre!("hash check should pass"))?;
        assert_eq!(plaintext, data);
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_store_is_refused_without_accounting_drift() -> eyre::Result<()> {
        let store = temp_store(1024 * 1024);
        let data = Bytes::from_static(b"only once");
        let id = DataKey::from_plaintext(&data).data_id();

        assert!(store.store_block(&id, data.clone(), false).await?.was_stored());
        let before = store.used_bytes();
        assert_eq!(
            store.store_block(&id, data, false).await?,
            StoreOutcome::AlreadyHave
        );
        assert_eq!(store.used_bytes(), before);
        Ok(())
    }

    #[tokio::test]
    async fn datastore_size_matches_the_sum_of_rows() -> eyre::Result<()> {
        let store = temp_store(1024 * 1024);
        let mut expected = 0u64;
        for i in 0..10u8 {
            let data = Bytes::from(vec![i; 100 + i as usize]);
            expected += data.len() as u64;
            let id = DataKey::from_plaintext(&data).data_id();
            assert!(store.store_block(&id, data, false).await?.was_stored());
        }
        assert_eq!(store.used_bytes(), expected);
        assert_eq!(store.block_count(), 10);
        Ok(())
    }

    // Fill the store, then offer a block closer than some of what is held;
    // the farthest blocks summing to at least the newcomer's size must go,
    // and the accounting delta must be new_size - freed.
    #[tokio::test]
    async fn pruning_evicts_farthest_first() -> eyre::Result<()> {
        let store = temp_store(1);

        // Blocks must be large enough that the far half can free a whole
        // MAX_DATA_BLOCK_SIZE, otherwise admission rightly refuses.
        let block_len = 128 * 1024;
        let mut blocks: Vec<(Distance, DataId, Bytes)> = (0u32..24)
            .map(|i| {
                let mut data = format!("block number {i} ").into_bytes();
                data.resize(block_len, (i % 251) as u8);
                let data = Bytes::from(data);
                let id = DataKey::from_plaintext(&data).data_id();
                (store.distance_of(&id), id, data)
            })
            .collect();
        blocks.sort_by(|a, b| a.0.cmp(&b.0));

        // Store the far half; the store is over its 1-byte budget at once.
        for (_, id, data) in &blocks[12..] {
            assert!(store.store_block(id, data.clone(), false).await?.was_stored());
        }
        let used_before = store.used_bytes();

        // A block closer than everything held must displace the farthest.
        let (_, closest_id, closest_data) = &blocks[0];
        let (will_store, need_pruning) = store.check_do_want_data(closest_id);
        assert!(will_store);
        assert!(need_pruning);

        let farthest_id = blocks[23].1;
        let outcome = store
            .store_block(closest_id, closest_data.clone(), need_pruning)
            .await?;
        match outcome {
            StoreOutcome::Stored { pruned } => {
                assert!(pruned.contains(&farthest_id), "farthest block should go first");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(store.has_block(closest_id));
        assert!(!store.has_block(&farthest_id));

        // The books still balance: used_bytes equals the sum of rows.
        let sum: u64 = {
            let mut total = 0;
            for (_, id, data) in &blocks {
                if store.has_block(id) {
                    total += data.len() as u64;
                }
            }
            total
        };
        assert_eq!(store.used_bytes(), sum);
        assert!(store.used_bytes() <= used_before + closest_data.len() as u64);
        Ok(())
    }

    // A block farther than everything held is never admitted once full.
    #[tokio::test]
    async fn farthest_block_is_refused_when_full() -> eyre::Result<()> {
        let store = temp_store(1);

        let mut blocks: Vec<(Distance, DataId, Bytes)> = (0u32..16)
            .map(|i| {
                let data = Bytes::from(format!("candidate {i}").into_bytes());
                let id = DataKey::from_plaintext(&data).data_id();
                (store.distance_of(&id), id, data)
            })
            .collect();
        blocks.sort_by(|a, b| a.0.cmp(&b.0));

        for (_, id, data) in &blocks[..15] {
            assert!(store.store_block(id, data.clone(), false).await?.was_stored());
        }

        let (_, farthest_id, _) = &blocks[15];
        let (will_store, need_pruning) = store.check_do_want_data(farthest_id);
        assert!(!will_store, "nothing farther is held, so nothing can be freed");
        assert!(need_pruning);
        Ok(())
    }

    #[tokio::test]
    async fn snapshot_survives_a_restart() -> eyre::Result<()> {
        let store = temp_store(1024 * 1024);
        let data = Bytes::from_static(b"durable");
        let id = DataKey::from_plaintext(&data).data_id();
        assert!(store.store_block(&id, data.clone(), false).await?.was_stored());
        store.flush().await?;

        let reloaded = BlockStore::with_config(
            NodeId::from_bytes([0u8; NODE_ID_BYTES]),
            BlockStoreConfig {
                storage_dir: store.storage_dir().to_path_buf(),
                max_bytes: 1024 * 1024,
            },
        )?;
        assert_eq!(reloaded.load().await?, 1);
        assert!(reloaded.has_block(&id));
        assert_eq!(reloaded.used_bytes(), data.len() as u64);
        Ok(())
    }
}
