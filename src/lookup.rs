//! Binding-level CID→connection lookup.
//!
//! Three shapes, chosen by load: SINGLE for a client binding with one
//! connection, HASH for a few connections, PARTITIONED for server
//! bindings, sharded by the partition byte embedded in local CIDs so a
//! lookup usually stays on the shard owned by one worker.
//!
//! Tables hash attacker-controlled CID bytes, so they are keyed with
//! SipHash under random per-binding keys.

use crate::cid::Cid;
use crate::types::CID_PARTITION_INDEX;
use siphasher::sip::SipHasher13;
use std::collections::HashMap;
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::RwLock;
use tracing::debug;

/// Entry count at which SINGLE grows into HASH.
const SINGLE_LIMIT: usize = 8;

/// Adding a CID that already routes elsewhere.
#[derive(Debug, PartialEq, Eq)]
pub struct Collision;

#[derive(Clone, Copy)]
struct SipKeys {
    k0: u64,
    k1: u64,
}

impl SipKeys {
    fn random() -> Self {
        SipKeys { k0: rand::random(), k1: rand::random() }
    }
}

impl BuildHasher for SipKeys {
    type Hasher = SipHasher13;

    fn build_hasher(&self) -> SipHasher13 {
        SipHasher13::new_with_keys(self.k0, self.k1)
    }
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct Key(Vec<u8>);

type Table<T> = HashMap<Key, T, SipKeys>;

enum Shape<T> {
    /// Flat list; one or two connections' worth of CIDs.
    Single(Vec<(Cid, T)>),
    Hash(Table<T>),
    /// One table per worker partition.
    Partitioned(Vec<RwLock<Table<T>>>),
}

/// Maps CID bytes to a routing value `T` (worker + connection id).
pub struct CidLookup<T: Clone + PartialEq> {
    keys: SipKeys,
    shape: RwLock<Shape<T>>,
}

impl<T: Clone + PartialEq> CidLookup<T> {
    pub fn new() -> Self {
        CidLookup { keys: SipKeys::random(), shape: RwLock::new(Shape::Single(Vec::new())) }
    }

    fn table(&self) -> Table<T> {
        HashMap::with_hasher(self.keys)
    }

    pub fn lookup(&self, cid: &Cid) -> Option<T> {
        let shape = self.shape.read().unwrap();
        match &*shape {
            Shape::Single(list) => {
                list.iter().find(|(c, _)| c == cid).map(|(_, v)| v.clone())
            }
            Shape::Hash(table) => table.get(&Key(cid.as_slice().to_vec())).cloned(),
            Shape::Partitioned(shards) => {
                let shard = &shards[shard_index(cid, shards.len())];
                shard.read().unwrap().get(&Key(cid.as_slice().to_vec())).cloned()
            }
        }
    }

    /// Register a source CID. Fails when the CID already routes to a
    /// different connection; the caller retries with a fresh random CID.
    pub fn add(&self, cid: &Cid, value: T) -> Result<(), Collision> {
        let mut shape = self.shape.write().unwrap();
        match &mut *shape {
            Shape::Single(list) => {
                if let Some((_, existing)) = list.iter().find(|(c, _)| c == cid) {
                    return if *existing == value { Ok(()) } else { Err(Collision) };
                }
                list.push((*cid, value));
                if list.len() > SINGLE_LIMIT {
                    debug!("cid lookup: single → hash");
                    let mut table = self.table();
                    for (c, v) in list.drain(..) {
                        table.insert(Key(c.as_slice().to_vec()), v);
                    }
                    *shape = Shape::Hash(table);
                }
                Ok(())
            }
            Shape::Hash(table) => insert_checked(table, cid, value),
            Shape::Partitioned(shards) => {
                let shard = &shards[shard_index(cid, shards.len())];
                insert_checked(&mut shard.write().unwrap(), cid, value)
            }
        }
    }

    pub fn remove(&self, cid: &Cid) {
        let mut shape = self.shape.write().unwrap();
        match &mut *shape {
            Shape::Single(list) => list.retain(|(c, _)| c != cid),
            Shape::Hash(table) => {
                table.remove(&Key(cid.as_slice().to_vec()));
            }
            Shape::Partitioned(shards) => {
                let shard = &shards[shard_index(cid, shards.len())];
                shard.write().unwrap().remove(&Key(cid.as_slice().to_vec()));
            }
        }
    }

    /// A listener landed on the binding: shard the table per worker so
    /// server load spreads without cross-worker contention.
    pub fn promote_partitioned(&self, partitions: usize) {
        let mut shape = self.shape.write().unwrap();
        if matches!(&*shape, Shape::Partitioned(_)) {
            return;
        }
        debug!(partitions, "cid lookup: → partitioned hash");
        let mut shards: Vec<Table<T>> = (0..partitions.max(1)).map(|_| self.table()).collect();
        let count = shards.len();
        match &mut *shape {
            Shape::Single(list) => {
                for (c, v) in list.drain(..) {
                    shards[shard_index(&c, count)].insert(Key(c.as_slice().to_vec()), v);
                }
            }
            Shape::Hash(table) => {
                for (k, v) in table.drain() {
                    let cid = Cid::from_slice(&k.0);
                    shards[shard_index(&cid, count)].insert(k, v);
                }
            }
            Shape::Partitioned(_) => unreachable!(),
        }
        *shape = Shape::Partitioned(shards.into_iter().map(RwLock::new).collect());
    }

    pub fn len(&self) -> usize {
        let shape = self.shape.read().unwrap();
        match &*shape {
            Shape::Single(list) => list.len(),
            Shape::Hash(table) => table.len(),
            Shape::Partitioned(shards) => {
                shards.iter().map(|s| s.read().unwrap().len()).sum()
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone + PartialEq> Default for CidLookup<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn insert_checked<T: Clone + PartialEq>(
    table: &mut Table<T>,
    cid: &Cid,
    value: T,
) -> Result<(), Collision> {
    match table.get(&Key(cid.as_slice().to_vec())) {
        Some(existing) if *existing != value => Err(Collision),
        Some(_) => Ok(()),
        None => {
            table.insert(Key(cid.as_slice().to_vec()), value);
            Ok(())
        }
    }
}

fn shard_index(cid: &Cid, count: usize) -> usize {
    let byte = if cid.len() > CID_PARTITION_INDEX {
        cid.as_slice()[CID_PARTITION_INDEX]
    } else {
        0
    };
    byte as usize % count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_shape_roundtrip() {
        let lookup: CidLookup<u32> = CidLookup::new();
        let cid = Cid::random_local(0);
        lookup.add(&cid, 7).unwrap();
        assert_eq!(lookup.lookup(&cid), Some(7));
        lookup.remove(&cid);
        assert_eq!(lookup.lookup(&cid), None);
    }

    #[test]
    fn collision_detected() {
        let lookup: CidLookup<u32> = CidLookup::new();
        let cid = Cid::random_local(0);
        lookup.add(&cid, 1).unwrap();
        // Same value re-registered: fine (idempotent).
        assert!(lookup.add(&cid, 1).is_ok());
        assert_eq!(lookup.add(&cid, 2), Err(Collision));
    }

    #[test]
    fn promotes_to_hash_under_load() {
        let lookup: CidLookup<u32> = CidLookup::new();
        let cids: Vec<Cid> = (0..SINGLE_LIMIT as u32 + 4).map(|_| Cid::random_local(0)).collect();
        for (i, cid) in cids.iter().enumerate() {
            lookup.add(cid, i as u32).unwrap();
        }
        for (i, cid) in cids.iter().enumerate() {
            assert_eq!(lookup.lookup(cid), Some(i as u32));
        }
    }

    #[test]
    fn partitioned_preserves_entries() {
        let lookup: CidLookup<u32> = CidLookup::new();
        let cids: Vec<Cid> = (0..12).map(|i| Cid::random_local(i as u8)).collect();
        for (i, cid) in cids.iter().enumerate() {
            lookup.add(cid, i as u32).unwrap();
        }
        lookup.promote_partitioned(4);
        for (i, cid) in cids.iter().enumerate() {
            assert_eq!(lookup.lookup(cid), Some(i as u32));
        }
        // Still mutable afterwards.
        let extra = Cid::random_local(9);
        lookup.add(&extra, 99).unwrap();
        assert_eq!(lookup.lookup(&extra), Some(99));
        assert_eq!(lookup.len(), 13);
    }
}
