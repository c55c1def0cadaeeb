// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The XOR-ordered prefix trie.
//!
//! Entries are keyed by `XOR(target, entry_id)`; iterating the keys in
//! big-endian byte order visits entries closest-first to the target, which
//! is the only traversal the engine ever needs. A [`Slot::Sentinel`] marks
//! the local node's own position in the ordering so that walks can stop at
//! "nothing closer than ourselves" without special cases.

use std::collections::BTreeMap;
use weft_protocol::{Distance, NodeId};

/// An occupant of the trie: a real entry, or the local node's position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Slot<T> {
    Sentinel,
    Entry(T),
}

impl<T> Slot<T> {
    pub fn entry(&self) -> Option<&T> {
        match self {
            Slot::Sentinel => None,
            Slot::Entry(value) => Some(value),
        }
    }
}

/// Ordered container over one target's view of the keyspace.
#[derive(Debug, Clone)]
pub struct XorTrie<T> {
    target: NodeId,
    slots: BTreeMap<Distance, Slot<T>>,
}

impl<T> XorTrie<T> {
    pub fn new(target: NodeId) -> Self {
        Self {
            target,
            slots: BTreeMap::new(),
        }
    }

    pub fn target(&self) -> &NodeId {
        &self.target
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Insert `value` at its XOR position, replacing any previous occupant.
    pub fn insert(&mut self, id: &NodeId, value: T) -> Option<Slot<T>> {
        self.slots
            .insert(self.target.distance(id), Slot::Entry(value))
    }

    /// Insert only if the position is vacant; the first report about a peer
    /// wins, later duplicates are dropped.
    pub fn insert_if_vacant(&mut self, id: &NodeId, value: T) -> bool {
        let key = self.target.distance(id);
        if self.slots.contains_key(&key) {
            return false;
        }
        let _ = self.slots.insert(key, Slot::Entry(value));
        true
    }

    /// Mark `id` (normally the local node) as a sentinel position.
    pub fn insert_sentinel(&mut self, id: &NodeId) {
        let _ = self.slots.insert(self.target.distance(id), Slot::Sentinel);
    }

    pub fn remove(&mut self, id: &NodeId) -> Option<Slot<T>> {
        self.slots.remove(&self.target.distance(id))
    }

    pub fn get(&self, id: &NodeId) -> Option<&Slot<T>> {
        self.slots.get(&self.target.distance(id))
    }

    /// All slots, closest to the target first.
    pub fn iter_closest(&self) -> impl Iterator<Item = (&Distance, &Slot<T>)> {
        self.slots.iter()
    }

    pub fn iter_closest_mut(&mut self) -> impl Iterator<Item = (&Distance, &mut Slot<T>)> {
        self.slots.iter_mut()
    }

    /// Entries strictly closer to the target than `id`, closest first.
    pub fn iter_closer_than(&self, id: &NodeId) -> impl Iterator<Item = (&Distance, &Slot<T>)> {
        let bound = self.target.distance(id);
        self.slots.range(..bound)
    }

    /// Entries stopping at the sentinel: the "no one closer than ourselves"
    /// walk. Yields at most `limit` real entries.
    pub fn closest_before_sentinel(&self, limit: usize) -> Vec<&T> {
        let mut out = Vec::with_capacity(limit);
        for (_, slot) in self.slots.iter() {
            match slot {
                Slot::Sentinel => break,
                Slot::Entry(value) => {
                    out.push(value);
                    if out.len() == limit {
                        break;
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_protocol::NODE_ID_BYTES;

    fn id(byte: u8) -> NodeId {
        let mut bytes = [0u8; NODE_ID_BYTES];
        bytes[NODE_ID_BYTES - 1] = byte;
        NodeId::from_bytes(bytes)
    }

    #[test]
    fn iteration_is_closest_first_for_the_target() {
        let target = id(0b0000_0000);
        let mut trie = XorTrie::new(target);
        for value in [0b1000_0000u8, 0b0000_0001, 0b0001_0000] {
            trie.insert(&id(value), value);
        }

        let order: Vec<u8> = trie
            .iter_closest()
            .filter_map(|(_, slot)| slot.entry().copied())
            .collect();
        assert_eq!(order, vec![0b0000_0001, 0b0001_0000, 0b1000_0000]);
    }

    #[test]
    fn sentinel_cuts_off_walks_at_self() {
        let target = id(0);
        let local = id(0b0000_0100);
        let mut trie = XorTrie::new(target);
        trie.insert_sentinel(&local);
        trie.insert(&id(0b0000_0001), 1u8);
        trie.insert(&id(0b0000_0010), 2u8);
        trie.insert(&id(0b1000_0000), 128u8);

        // Only the two entries closer than the local node are returned.
        assert_eq!(trie.closest_before_sentinel(10), vec![&1u8, &2u8]);
        // The limit still applies.
        assert_eq!(trie.closest_before_sentinel(1), vec![&1u8]);
    }

    #[test]
    fn insert_if_vacant_keeps_the_first_report() {
        let mut trie = XorTrie::new(id(0));
        assert!(trie.insert_if_vacant(&id(3), "first"));
        assert!(!trie.insert_if_vacant(&id(3), "second"));
        assert_eq!(trie.get(&id(3)).and_then(Slot::entry), Some(&"first"));
    }

    #[test]
    fn closest_first_holds_for_arbitrary_entries() {
        fn prop(seeds: Vec<u64>, target_seed: u64) -> bool {
            let target = NodeId::from_content(&target_seed.to_be_bytes());
            let mut trie = XorTrie::new(target);
            for seed in &seeds {
                let id = NodeId::from_content(&seed.to_be_bytes());
                let _ = trie.insert(&id, *seed);
            }
            let distances: Vec<_> = trie.iter_closest().map(|(d, _)| *d).collect();
            distances.windows(2).all(|pair| pair[0] < pair[1])
        }
        quickcheck::quickcheck(prop as fn(Vec<u64>, u64) -> bool);
    }

    #[test]
    fn iter_closer_than_excludes_the_bound() {
        let mut trie = XorTrie::new(id(0));
        trie.insert(&id(1), 1u8);
        trie.insert(&id(4), 4u8);
        trie.insert(&id(9), 9u8);

        let closer: Vec<u8> = trie
            .iter_closer_than(&id(4))
            .filter_map(|(_, slot)| slot.entry().copied())
            .collect();
        assert_eq!(closer, vec![1]);
    }
}
