use std::mem::size_of;

use crate::objects::object::ObjRef;
use crate::value::Value;

const MAP_MAX_LOAD: f64 = 0.75;
const MAP_MIN_CAPACITY: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MapEntry {
    Empty,
    Tombstone,
    Occupied { key: ObjRef, hash: u32, value: Value },
}

/// Open-addressed string-keyed map with linear probing and tombstone deletion.
///
/// Keys are string handles. Probing compares handle identity first and only
/// falls back to content comparison (through the caller's `key_eq`) when the
/// stored hash matches. `version` changes whenever entries may have moved
/// (rehash) or disappeared (removal), so an index captured before that point
/// must be revalidated.
pub struct ObjectMap {
    entries: Vec<MapEntry>,
    count: usize,
    tombstones: usize,
    version: u32,
}

impl ObjectMap {
    pub const ENTRY_SIZE: usize = size_of::<MapEntry>();

    pub fn new() -> ObjectMap {
        ObjectMap {
            entries: Vec::new(),
            count: 0,
            tombstones: 0,
            version: 0,
        }
    }

    pub fn with_capacity(count: usize) -> ObjectMap {
        let mut map = ObjectMap::new();
        let capacity = Self::capacity_for_count(count);
        if capacity > 0 {
            map.entries = vec![MapEntry::Empty; capacity];
        }
        map
    }

    fn capacity_for_count(count: usize) -> usize {
        if count == 0 {
            return 0;
        }
        let mut capacity = MAP_MIN_CAPACITY;
        while ((capacity as f64) * MAP_MAX_LOAD) < count as f64 {
            capacity *= 2;
        }
        capacity
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn version(&self) -> u32 {
        self.version
    }

    /// True when one more insertion would exceed the load factor.
    pub fn needs_grow(&self) -> bool {
        (self.count + self.tombstones + 1) as f64 > self.capacity() as f64 * MAP_MAX_LOAD
    }

    /// Rehash into a larger table. Tombstones are dropped.
    pub fn grow(&mut self) {
        let capacity = if self.capacity() < MAP_MIN_CAPACITY {
            MAP_MIN_CAPACITY
        } else {
            self.capacity() * 2
        };
        let old = std::mem::replace(&mut self.entries, vec![MapEntry::Empty; capacity]);
        self.count = 0;
        self.tombstones = 0;
        self.version = self.version.wrapping_add(1);
        let mask = capacity - 1;
        for entry in old {
            if let MapEntry::Occupied { key, hash, value } = entry {
                let mut index = hash as usize & mask;
                while self.entries[index] != MapEntry::Empty {
                    index = (index + 1) & mask;
                }
                self.entries[index] = MapEntry::Occupied { key, hash, value };
                self.count += 1;
            }
        }
    }

    /// Probe for `key`. Returns the index of the matching entry, or the slot an
    /// insertion should use (first tombstone seen, else the terminating empty slot).
    pub fn probe(&self, key: ObjRef, hash: u32, key_eq: impl Fn(ObjRef) -> bool) -> Option<(usize, bool)> {
        if self.entries.is_empty() {
            return None;
        }
        let mask = self.capacity() - 1;
        let mut index = hash as usize & mask;
        let mut tombstone = None;
        loop {
            match self.entries[index] {
                MapEntry::Empty => return Some((tombstone.unwrap_or(index), false)),
                MapEntry::Tombstone => {
                    if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
                MapEntry::Occupied { key: candidate, hash: candidate_hash, .. } => {
                    if candidate == key || (candidate_hash == hash && key_eq(candidate)) {
                        return Some((index, true));
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }

    /// Lookup by content only, for callers that hold text rather than a key handle.
    pub fn probe_by_content(&self, hash: u32, key_eq: impl Fn(ObjRef) -> bool) -> Option<usize> {
        if self.entries.is_empty() {
            return None;
        }
        let mask = self.capacity() - 1;
        let mut index = hash as usize & mask;
        loop {
            match self.entries[index] {
                MapEntry::Empty => return None,
                MapEntry::Tombstone => {}
                MapEntry::Occupied { key, hash: candidate_hash, .. } => {
                    if candidate_hash == hash && key_eq(key) {
                        return Some(index);
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }

    pub fn find(&self, key: ObjRef, hash: u32, key_eq: impl Fn(ObjRef) -> bool) -> Option<usize> {
        match self.probe(key, hash, key_eq) {
            Some((index, true)) => Some(index),
            _ => None,
        }
    }

    /// Store at a slot previously returned by `probe`. Returns true if the key is new.
    pub fn write(&mut self, index: usize, key: ObjRef, hash: u32, value: Value) -> bool {
        let is_new = match self.entries[index] {
            MapEntry::Occupied { .. } => false,
            MapEntry::Tombstone => {
                self.tombstones -= 1;
                true
            }
            MapEntry::Empty => true,
        };
        if is_new {
            self.count += 1;
        }
        self.entries[index] = MapEntry::Occupied { key, hash, value };
        is_new
    }

    /// Overwrite the value at an occupied index. Returns false if the slot is not occupied.
    pub fn set_value_at(&mut self, index: usize, value: Value) -> bool {
        match self.entries.get_mut(index) {
            Some(MapEntry::Occupied { value: slot, .. }) => {
                *slot = value;
                true
            }
            _ => false,
        }
    }

    pub fn remove_at(&mut self, index: usize) -> bool {
        match self.entries.get(index) {
            Some(MapEntry::Occupied { .. }) => {
                self.entries[index] = MapEntry::Tombstone;
                self.count -= 1;
                self.tombstones += 1;
                self.version = self.version.wrapping_add(1);
                true
            }
            _ => false,
        }
    }

    pub fn entry(&self, index: usize) -> Option<(ObjRef, Value)> {
        match self.entries.get(index) {
            Some(MapEntry::Occupied { key, value, .. }) => Some((*key, *value)),
            _ => None,
        }
    }

    pub fn key_at(&self, index: usize) -> Option<ObjRef> {
        self.entry(index).map(|(key, _)| key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, Value)> + '_ {
        self.entries.iter().filter_map(|entry| match entry {
            MapEntry::Occupied { key, value, .. } => Some((*key, *value)),
            _ => None,
        })
    }
}

impl Default for ObjectMap {
    fn default() -> Self {
        Self::new()
    }
}
