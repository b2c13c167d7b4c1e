// File: src/table.rs
//
// Open-addressed hash table keyed by interned string handles, used for
// globals, the string intern set, class method tables, and instance
// field tables. Grounded directly on the linear-probing design the
// original C sources use (`table.h`): tombstone deletion, load factor
// 0.75, power-of-two capacity starting at 8.
//
// Unlike the C original, each entry carries its own copy of the key's
// hash. The original recomputes it by dereferencing the key object on
// every rehash; keeping a copy here avoids threading a heap reference
// through the table (which would fight the borrow checker every time a
// table lives inside the same arena it hashes against) while preserving
// identical probe behavior.

use crate::value::{ObjHandle, Value};

const MAX_LOAD_FACTOR: f64 = 0.75;
const INITIAL_CAPACITY: usize = 8;

#[derive(Debug, Clone)]
struct Entry {
    /// `None` means either never occupied, or a tombstone (see `value`).
    key: Option<ObjHandle>,
    hash: u32,
    /// Tombstones are encoded as `key = None, value = Bool(true)`; a
    /// truly empty slot is `key = None, value = Nil`.
    value: Value,
}

impl Entry {
    fn empty() -> Self {
        Entry { key: None, hash: 0, value: Value::Nil }
    }

    fn is_tombstone(&self) -> bool {
        self.key.is_none() && matches!(self.value, Value::Bool(true))
    }

    fn is_empty_slot(&self) -> bool {
        self.key.is_none() && !self.is_tombstone()
    }
}

/// A hash table. Keys are compared by handle identity: because strings
/// are interned, this is equivalent to comparing their contents.
#[derive(Debug, Clone, Default)]
pub struct Table {
    entries: Vec<Entry>,
    /// Live entries plus tombstones, used for the load-factor check.
    count: usize,
}

impl Table {
    pub fn new() -> Self {
        Table { entries: Vec::new(), count: 0 }
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.key.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn capacity(&self) -> usize {
        self.entries.len()
    }

    fn find_entry_index(entries: &[Entry], capacity: usize, key: ObjHandle, hash: u32) -> usize {
        let mut index = (hash as usize) & (capacity - 1);
        let mut first_tombstone: Option<usize> = None;
        loop {
            let entry = &entries[index];
            if entry.is_empty_slot() {
                return first_tombstone.unwrap_or(index);
            } else if entry.is_tombstone() {
                if first_tombstone.is_none() {
                    first_tombstone = Some(index);
                }
            } else if entry.key == Some(key) {
                return index;
            }
            index = (index + 1) & (capacity - 1);
        }
    }

    fn grow(&mut self) {
        let new_capacity = if self.entries.is_empty() {
            INITIAL_CAPACITY
        } else {
            self.entries.len() * 2
        };
        let mut new_entries = vec![Entry::empty(); new_capacity];
        let mut new_count = 0;
        for entry in self.entries.drain(..) {
            if let Some(key) = entry.key {
                let index = Self::find_entry_index(&new_entries, new_capacity, key, entry.hash);
                new_entries[index] = Entry { key: Some(key), hash: entry.hash, value: entry.value };
                new_count += 1;
            }
        }
        self.entries = new_entries;
        self.count = new_count;
    }

    /// Inserts or overwrites. Returns `true` if this created a brand-new
    /// key (used by `SET_GLOBAL` to detect assignment to an undefined
    /// global).
    pub fn set(&mut self, key: ObjHandle, hash: u32, value: Value) -> bool {
        if self.entries.is_empty() || (self.count + 1) as f64 > self.capacity() as f64 * MAX_LOAD_FACTOR {
            self.grow();
        }
        let capacity = self.capacity();
        let index = Self::find_entry_index(&self.entries, capacity, key, hash);
        let is_new = self.entries[index].key.is_none();
        if is_new && !self.entries[index].is_tombstone() {
            self.count += 1;
        }
        self.entries[index] = Entry { key: Some(key), hash, value };
        is_new
    }

    pub fn get(&self, key: ObjHandle, hash: u32) -> Option<Value> {
        if self.entries.is_empty() {
            return None;
        }
        let capacity = self.capacity();
        let index = Self::find_entry_index(&self.entries, capacity, key, hash);
        self.entries[index].key.map(|_| self.entries[index].value)
    }

    pub fn delete(&mut self, key: ObjHandle, hash: u32) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let capacity = self.capacity();
        let index = Self::find_entry_index(&self.entries, capacity, key, hash);
        if self.entries[index].key.is_none() {
            return false;
        }
        self.entries[index] = Entry { key: None, hash: 0, value: Value::Bool(true) };
        true
    }

    /// Looks up an interned string by raw bytes, ahead of allocating a
    /// new `ObjString`. `resolve` fetches a candidate's bytes by handle
    /// so equal-hash collisions are resolved by full byte comparison.
    pub fn find_string(&self, bytes: &[u8], hash: u32, resolve: impl Fn(ObjHandle) -> Vec<u8>) -> Option<ObjHandle> {
        if self.entries.is_empty() {
            return None;
        }
        let capacity = self.capacity();
        let mut index = (hash as usize) & (capacity - 1);
        loop {
            let entry = &self.entries[index];
            if entry.is_empty_slot() {
                return None;
            } else if let Some(key) = entry.key {
                if entry.hash == hash {
                    let candidate_bytes = resolve(key);
                    if candidate_bytes.len() == bytes.len() && candidate_bytes == bytes {
                        return Some(key);
                    }
                }
            }
            index = (index + 1) & (capacity - 1);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjHandle, Value)> + '_ {
        self.entries.iter().filter_map(|e| e.key.map(|k| (k, e.value)))
    }

    /// Removes every entry whose key is not in `is_marked` — used before
    /// sweep to break the intern table's reference to soon-to-be-freed
    /// white strings.
    pub fn remove_white(&mut self, is_marked: impl Fn(ObjHandle) -> bool) {
        for entry in self.entries.iter_mut() {
            if let Some(key) = entry.key {
                if !is_marked(key) {
                    *entry = Entry { key: None, hash: 0, value: Value::Bool(true) };
                }
            }
        }
    }

    /// Copies every entry from `other` into `self`, used by `OP_INHERIT`
    /// to flatten a superclass's method table into a subclass's.
    pub fn copy_from(&mut self, other: &Table) {
        let entries: Vec<(ObjHandle, u32, Value)> =
            other.entries.iter().filter_map(|e| e.key.map(|k| (k, e.hash, e.value))).collect();
        for (key, hash, value) in entries {
            self.set(key, hash, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(n: ObjHandle) -> u32 {
        n as u32
    }

    #[test]
    fn set_get_delete_round_trip() {
        let mut t = Table::new();
        assert!(t.set(1, h(1), Value::Number(1.0)));
        assert!(!t.set(1, h(1), Value::Number(2.0)));
        assert_eq!(t.get(1, h(1)), Some(Value::Number(2.0)));
        assert!(t.delete(1, h(1)));
        assert_eq!(t.get(1, h(1)), None);
    }

    #[test]
    fn tombstones_do_not_break_probing() {
        let mut t = Table::new();
        for i in 0..8u32 {
            t.set(i as ObjHandle, h(i as ObjHandle), Value::Number(i as f64));
        }
        t.delete(3, h(3));
        // Key 4 should still be reachable even though slot 3 was
        // tombstoned during the probe sequence.
        assert_eq!(t.get(4, h(4)), Some(Value::Number(4.0)));
    }

    #[test]
    fn grows_past_load_factor() {
        let mut t = Table::new();
        for i in 0..100u32 {
            t.set(i as ObjHandle, h(i as ObjHandle), Value::Number(i as f64));
        }
        assert_eq!(t.len(), 100);
        for i in 0..100u32 {
            assert_eq!(t.get(i as ObjHandle, h(i as ObjHandle)), Some(Value::Number(i as f64)));
        }
    }
}
