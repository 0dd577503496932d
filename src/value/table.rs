//! Table value: an array part for dense positive-integer keys plus an
//! insertion-ordered hash part, matching Lua's own hybrid representation.

use ahash::AHashMap;

use super::LuaValue;

/// Normalizes a key the way Lua's `luaH_get`/`luaH_set` do: a float with
/// an exact integer value is folded into the integer so `t[1]` and
/// `t[1.0]` address the same slot, and so `LuaValue` can implement
/// `Hash`/`Eq` consistently when used as a hash-part key.
fn normalize_key(key: LuaValue) -> LuaValue {
    if let LuaValue::Float(f) = key {
        if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
            return LuaValue::Int(f as i64);
        }
    }
    key
}

/// A table's hash part stores `(key, value)` pairs in insertion order in
/// a `Vec`, with a side index mapping key to slot. This keeps `next()`
/// iteration stable across `pairs()` without pulling in an `indexmap`
/// dependency, at the cost of a tombstone slot (`None`) on removal.
#[derive(Debug, Clone, Default)]
pub struct LuaTable {
    /// `array[i]` holds the value for integer key `i + 1`.
    array: Vec<LuaValue>,
    hash_slots: Vec<Option<(LuaValue, LuaValue)>>,
    hash_index: AHashMap<LuaValue, usize>,
    pub metatable: Option<super::TableRef>,
}

impl LuaTable {
    pub fn new() -> Self {
        LuaTable::default()
    }

    pub fn with_capacity(narray: usize, nhash: usize) -> Self {
        LuaTable {
            array: Vec::with_capacity(narray),
            hash_slots: Vec::with_capacity(nhash),
            hash_index: AHashMap::with_capacity(nhash),
            metatable: None,
        }
    }

    pub fn get(&self, key: &LuaValue) -> LuaValue {
        if let LuaValue::Int(i) = key {
            if *i >= 1 && (*i as usize) <= self.array.len() {
                return self.array[*i as usize - 1].clone();
            }
        }
        let key = normalize_key(key.clone());
        match self.hash_index.get(&key) {
            Some(&slot) => self.hash_slots[slot]
                .as_ref()
                .map(|(_, v)| v.clone())
                .unwrap_or(LuaValue::Nil),
            None => LuaValue::Nil,
        }
    }

    pub fn get_str(&self, key: &str) -> LuaValue {
        self.get(&LuaValue::from_str(key))
    }

    /// `key = nil` removes the entry (Lua treats `t[k] = nil` as a delete,
    /// aside from the `__newindex` case handled at the VM level).
    pub fn set(&mut self, key: LuaValue, value: LuaValue) {
        if let LuaValue::Int(i) = key {
            if i >= 1 && (i as usize) <= self.array.len() {
                self.array[i as usize - 1] = value;
                return;
            }
            if i as usize == self.array.len() + 1 && i >= 1 && !matches!(value, LuaValue::Nil) {
                self.array.push(value);
                self.migrate_from_hash();
                return;
            }
        }
        let key = normalize_key(key);
        if matches!(value, LuaValue::Nil) {
            if let Some(slot) = self.hash_index.remove(&key) {
                self.hash_slots[slot] = None;
            }
            return;
        }
        if let Some(&slot) = self.hash_index.get(&key) {
            self.hash_slots[slot] = Some((key, value));
        } else {
            let slot = self.hash_slots.len();
            self.hash_slots.push(Some((key.clone(), value)));
            self.hash_index.insert(key, slot);
        }
    }

    pub fn set_str(&mut self, key: &str, value: LuaValue) {
        self.set(LuaValue::from_str(key), value);
    }

    /// After appending to the array part, pull any now-contiguous
    /// integer keys out of the hash part, mirroring `luaH_resize`'s
    /// migration so the array part stays as dense as possible.
    fn migrate_from_hash(&mut self) {
        loop {
            let next_key = LuaValue::Int(self.array.len() as i64 + 1);
            match self.hash_index.remove(&next_key) {
                Some(slot) => {
                    let (_, v) = self.hash_slots[slot].take().unwrap();
                    self.array.push(v);
                }
                None => break,
            }
        }
    }

    /// A "border": `n` such that `t[n] ~= nil` and `t[n+1] == nil` (or
    /// `0` if `t[1] == nil`). Lua's `#` only guarantees *a* border when
    /// the table has holes; this follows `luaH_getn`'s algorithm exactly.
    pub fn length(&self) -> i64 {
        let mut j = self.array.len();
        while j > 0 && matches!(self.array[j - 1], LuaValue::Nil) {
            j -= 1;
        }
        if j == self.array.len() {
            // Array part is fully dense (or empty); the border may extend
            // into the hash part. Binary/doubling search as in `unbound_search`.
            if self
                .hash_index
                .contains_key(&LuaValue::Int(j as i64 + 1))
            {
                let mut i = j as i64;
                let mut k = i + 1;
                while self.raw_has_int(k) {
                    i = k;
                    if k > i64::MAX / 2 {
                        // Degenerate case: fall back to linear search.
                        let mut n = i;
                        while self.raw_has_int(n + 1) {
                            n += 1;
                        }
                        return n;
                    }
                    k *= 2;
                }
                while k - i > 1 {
                    let m = (i + k) / 2;
                    if self.raw_has_int(m) {
                        i = m;
                    } else {
                        k = m;
                    }
                }
                return i;
            }
        }
        j as i64
    }

    fn raw_has_int(&self, i: i64) -> bool {
        !matches!(self.get(&LuaValue::Int(i)), LuaValue::Nil)
    }

    /// Implements `next(t, key)`: returns the key/value pair following
    /// `key` in this table's iteration order (array part first, in
    /// index order, then the hash part in insertion order), or `None`
    /// once iteration is exhausted.
    pub fn next_entry(&self, key: &LuaValue) -> Result<Option<(LuaValue, LuaValue)>, ()> {
        let start_hash_slot = match key {
            LuaValue::Nil => {
                return Ok(self.first_entry());
            }
            LuaValue::Int(i) if *i >= 1 && (*i as usize) <= self.array.len() => {
                let mut idx = *i as usize; // next array slot (0-based = idx)
                while idx < self.array.len() {
                    if !matches!(self.array[idx], LuaValue::Nil) {
                        return Ok(Some((
                            LuaValue::Int(idx as i64 + 1),
                            self.array[idx].clone(),
                        )));
                    }
                    idx += 1;
                }
                0
            }
            other => {
                let key = normalize_key(other.clone());
                match self.hash_index.get(&key) {
                    Some(&slot) => slot + 1,
                    None => return Err(()),
                }
            }
        };
        for slot in self.hash_slots[start_hash_slot..].iter() {
            if let Some((k, v)) = slot {
                return Ok(Some((k.clone(), v.clone())));
            }
        }
        Ok(None)
    }

    fn first_entry(&self) -> Option<(LuaValue, LuaValue)> {
        for (idx, v) in self.array.iter().enumerate() {
            if !matches!(v, LuaValue::Nil) {
                return Some((LuaValue::Int(idx as i64 + 1), v.clone()));
            }
        }
        for slot in &self.hash_slots {
            if let Some((k, v)) = slot {
                return Some((k.clone(), v.clone()));
            }
        }
        None
    }
}
