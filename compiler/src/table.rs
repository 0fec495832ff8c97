//! Open-addressed hash table with linear probing. Used for globals, class
//! method tables, instance fields, and (via `find_string`) the heap's
//! string-interning set.

use crate::chunk::value::Value;
use crate::heap::{GcRef, Heap};

const MAX_LOAD: f64 = 0.75;
const INITIAL_CAPACITY: usize = 8;

#[derive(Clone, Copy)]
struct Entry {
    /// `None` + `value == Nil` is a truly empty slot; `None` + `value ==
    /// Bool(true)` is a tombstone left by `delete`, which linear-probe
    /// lookups must keep walking past.
    key: Option<GcRef>,
    value: Value,
}

impl Entry {
    fn empty() -> Self {
        Entry {
            key: None,
            value: Value::Nil,
        }
    }

    fn is_tombstone(&self) -> bool {
        self.key.is_none() && matches!(self.value, Value::Bool(true))
    }
}

pub struct Table {
    entries: Vec<Entry>,
    /// Count of live entries and tombstones. Grow is driven by this, not
    /// just live entries, so a delete-heavy workload still rehashes instead
    /// of filling up with tombstones forever.
    count: usize,
    /// Count of live entries only, excluding tombstones. This is what
    /// `is_empty` reports; a table full of tombstones and no live entries
    /// is logically empty even though `count` is nonzero.
    live: usize,
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}

impl Table {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            count: 0,
            live: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    fn capacity(&self) -> usize {
        self.entries.len()
    }

    fn find_entry_index(entries: &[Entry], capacity: usize, key: GcRef, hash: u32) -> usize {
        let mut index = hash as usize & (capacity - 1);
        let mut first_tombstone: Option<usize> = None;
        loop {
            let entry = &entries[index];
            match entry.key {
                Some(k) if k.ptr_eq(key) => return index,
                None if entry.is_tombstone() => {
                    if first_tombstone.is_none() {
                        first_tombstone = Some(index);
                    }
                }
                None => return first_tombstone.unwrap_or(index),
                Some(_) => {}
            }
            index = (index + 1) & (capacity - 1);
        }
    }

    fn key_hash(key: GcRef) -> u32 {
        key.as_string()
            .expect("table keys are always interned strings")
            .hash
    }

    fn grow(&mut self, capacity: usize) {
        let mut new_entries = vec![Entry::empty(); capacity];
        let mut live = 0;
        for entry in &self.entries {
            if let Some(key) = entry.key {
                let index = Self::find_entry_index(&new_entries, capacity, key, Self::key_hash(key));
                new_entries[index] = *entry;
                live += 1;
            }
        }
        self.entries = new_entries;
        self.count = live;
        self.live = live;
    }

    fn ensure_capacity(&mut self) {
        if self.capacity() == 0 {
            self.grow(INITIAL_CAPACITY);
        } else if (self.count + 1) as f64 > self.capacity() as f64 * MAX_LOAD {
            self.grow(self.capacity() * 2);
        }
    }

    /// Inserts or overwrites `key`. Returns `true` if this created a new
    /// entry, mirroring clox's `tableSet`.
    pub fn set(&mut self, key: GcRef, value: Value) -> bool {
        self.ensure_capacity();
        let capacity = self.capacity();
        let index = Self::find_entry_index(&self.entries, capacity, key, Self::key_hash(key));
        let entry = &mut self.entries[index];
        let is_new = entry.key.is_none();
        if is_new && !entry.is_tombstone() {
            self.count += 1;
        }
        if is_new {
            self.live += 1;
        }
        entry.key = Some(key);
        entry.value = value;
        is_new
    }

    pub fn get(&self, key: GcRef) -> Option<Value> {
        if self.capacity() == 0 {
            return None;
        }
        let index = Self::find_entry_index(&self.entries, self.capacity(), key, Self::key_hash(key));
        let entry = &self.entries[index];
        entry.key.map(|_| entry.value)
    }

    /// Removes `key`, leaving a tombstone so later probes for a
    /// since-evicted colliding key keep walking past this slot.
    pub fn delete(&mut self, key: GcRef) -> bool {
        if self.capacity() == 0 {
            return false;
        }
        let index = Self::find_entry_index(&self.entries, self.capacity(), key, Self::key_hash(key));
        let entry = &mut self.entries[index];
        if entry.key.is_none() {
            return false;
        }
        entry.key = None;
        entry.value = Value::Bool(true);
        self.live -= 1;
        true
    }

    /// Copies every entry of `other` into `self`, overwriting on collision.
    /// Used by `OP_INHERIT` to seed a subclass's method table with its
    /// superclass's methods.
    pub fn add_all(&mut self, other: &Table) {
        for entry in &other.entries {
            if let Some(key) = entry.key {
                self.set(key, entry.value);
            }
        }
    }

    /// Structural lookup by content, used only for string interning. The
    /// whole point is to find a canonical `GcRef` before one exists for this
    /// exact set of bytes, so it can't compare by key identity like `get`
    /// does.
    pub fn find_string(&self, s: &str, hash: u32) -> Option<GcRef> {
        if self.capacity() == 0 {
            return None;
        }
        let capacity = self.capacity();
        let mut index = hash as usize & (capacity - 1);
        loop {
            let entry = &self.entries[index];
            match entry.key {
                None if !entry.is_tombstone() => return None,
                Some(key) => {
                    let candidate = key.as_string().expect("intern table keys are strings");
                    if candidate.hash == hash && &*candidate.chars == s {
                        drop(candidate);
                        return Some(key);
                    }
                }
                None => {}
            }
            index = (index + 1) & (capacity - 1);
        }
    }

    /// Marks every live key and value as a GC root (used for the globals
    /// table, and for a class's method table / an instance's field table
    /// while tracing an already-gray object).
    pub fn mark(&self, heap: &mut Heap) {
        for entry in &self.entries {
            if let Some(key) = entry.key {
                heap.mark_object(key);
                heap.mark_value(entry.value);
            }
        }
    }

    /// Clears every entry whose key wasn't reached by the current trace.
    /// This is the intern table's weak-reference clear: a string with no
    /// other referent is dropped here instead of being kept alive forever.
    pub fn remove_unmarked(&mut self) {
        for entry in &mut self.entries {
            if let Some(key) = entry.key {
                if !key.is_marked() {
                    entry.key = None;
                    entry.value = Value::Bool(true);
                    self.live -= 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;

    #[test]
    fn set_then_get_round_trips() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        let key = heap.intern_string("x");
        assert!(table.set(key, Value::Number(1.0)));
        assert!(!table.set(key, Value::Number(2.0)));
        match table.get(key) {
            Some(Value::Number(n)) => assert_eq!(n, 2.0),
            _ => panic!("expected a number"),
        }
    }

    #[test]
    fn delete_then_reinsert_does_not_lose_a_colliding_neighbor() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        let a = heap.intern_string("a");
        let b = heap.intern_string("b");
        table.set(a, Value::Number(1.0));
        table.set(b, Value::Number(2.0));
        table.delete(a);
        assert!(table.get(b).is_some());
        assert!(table.get(a).is_none());
    }

    #[test]
    fn deleting_the_only_entry_reports_empty() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        let key = heap.intern_string("only");
        table.set(key, Value::Number(1.0));
        assert!(!table.is_empty());
        table.delete(key);
        assert!(table.is_empty());
    }

    #[test]
    fn grows_past_the_load_factor() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        for i in 0..100 {
            let key = heap.intern_string(&format!("k{i}"));
            table.set(key, Value::Number(i as f64));
        }
        for i in 0..100 {
            let key = heap.intern_string(&format!("k{i}"));
            match table.get(key) {
                Some(Value::Number(n)) => assert_eq!(n, i as f64),
                _ => panic!("missing k{i}"),
            }
        }
    }
}
