//! Mirrored record index and its digest.
//!
//! The engine keeps `id → hlc` for every record of the session. The digest
//! is a BLAKE3 Merkle root over the entries sorted by id. Two replicas with
//! equal digests hold the same record versions, so a sync request carrying a
//! matching digest needs no records in reply.
//!
//! Leaves are `H(0x00 || id || 0x1f || hlc)`, interior nodes
//! `H(0x01 || left || right)`. An unpaired node at the end of a level is
//! carried up unchanged.

use std::collections::BTreeMap;

use pact_proto::Hlc;

const LEAF: u8 = 0x00;
const NODE: u8 = 0x01;

#[derive(Debug, Default, Clone)]
pub struct SyncIndex {
    entries: BTreeMap<String, Hlc>,
}

impl SyncIndex {
    pub fn from_entries(entries: impl IntoIterator<Item = (String, Hlc)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<Hlc> {
        self.entries.get(id).copied()
    }

    /// Record `hlc` for `id` unless a superseding version is already held.
    pub fn upsert(&mut self, id: &str, hlc: Hlc) {
        match self.entries.get_mut(id) {
            Some(current) if !hlc.supersedes(current) => {}
            Some(current) => *current = hlc,
            None => {
                self.entries.insert(id.to_string(), hlc);
            }
        }
    }

    pub fn remove(&mut self, id: &str) {
        self.entries.remove(id);
    }

    /// Hex Merkle root. The empty index hashes to all zeros.
    pub fn digest(&self) -> String {
        let mut level: Vec<[u8; 32]> = self
            .entries
            .iter()
            .map(|(id, hlc)| {
                let mut h = blake3::Hasher::new();
                h.update(&[LEAF]);
                h.update(id.as_bytes());
                h.update(&[0x1f]);
                h.update(hlc.to_string().as_bytes());
                *h.finalize().as_bytes()
            })
            .collect();

        if level.is_empty() {
            return hex::encode([0u8; 32]);
        }
        while level.len() > 1 {
            level = level
                .chunks(2)
                .map(|pair| match pair {
                    [left, right] => {
                        let mut h = blake3::Hasher::new();
                        h.update(&[NODE]);
                        h.update(left);
                        h.update(right);
                        *h.finalize().as_bytes()
                    }
                    _ => pair[0],
                })
                .collect();
        }
        hex::encode(level[0])
    }
}
