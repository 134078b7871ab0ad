//! Version vectors for comparing weaves across replicas.
//!
//! A [`WeaveVersion`] records the latest timestamp seen from each site plus a
//! BLAKE3 hash over the weave's atom ids and causes in weave order. Two
//! replicas holding the same atoms produce the same hash, so comparing
//! versions is a cheap convergence check.
//!
//! Hash format: `blake3:<lowercase hex>`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::atom::{Atom, AtomId};

/// Per-site latest timestamps plus a content hash of the weave.
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
pub struct WeaveVersion {
    /// Latest timestamp observed per site id.
    pub sites: BTreeMap<u32, u64>,
    /// Hash over the weave order.
    pub hash: String,
}

impl WeaveVersion {
    pub(crate) fn of<O>(atoms: &[Atom<O>]) -> Self {
        let mut sites: BTreeMap<u32, u64> = BTreeMap::new();
        let mut hasher = blake3::Hasher::new();

        for atom in atoms {
            let latest = sites.entry(atom.id.site).or_insert(0);
            *latest = (*latest).max(atom.id.timestamp);

            hash_id(&mut hasher, &atom.id);
            match &atom.cause {
                Some(cause) => {
                    hasher.update(&[1]);
                    hash_id(&mut hasher, cause);
                }
                None => {
                    hasher.update(&[0]);
                }
            }
        }

        Self {
            sites,
            hash: format!("blake3:{}", hasher.finalize().to_hex()),
        }
    }

    /// Latest timestamp seen from `site`, if any atom from it is present.
    #[must_use]
    pub fn latest(&self, site: u32) -> Option<u64> {
        self.sites.get(&site).copied()
    }
}

impl PartialEq for WeaveVersion {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

fn hash_id(hasher: &mut blake3::Hasher, id: &AtomId) {
    hasher.update(&id.site.to_le_bytes());
    hasher.update(&id.timestamp.to_le_bytes());
    hasher.update(&id.priority.to_le_bytes());
}
