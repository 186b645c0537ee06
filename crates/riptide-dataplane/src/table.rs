//! Two-choice hash table
//!
//! Fixed-capacity associative map for the per-core fast path. Every entry
//! lives inline in one of two buckets chosen by its hash; a full primary
//! bucket overflows into the secondary, and a full pair is resolved by
//! bounded cuckoo displacement.
//!
//! # Design
//!
//! - Power-of-two bucket count, 3 inline slots per bucket
//! - Per-bucket busy/secondary bitmasks and a compact bloom word that
//!   records which entries overflowed out of the bucket, so the secondary
//!   probe is skipped on the overwhelmingly common path
//! - Cuckoo relocation bounded to depth 3; exhaustion is a clean failure,
//!   not a retry condition
//! - Owned by exactly one core thread, so every mutator takes `&mut self`
//!   and there is no interior locking

use std::hash::{BuildHasher, BuildHasherDefault, Hash, Hasher};

/// Inline slots per bucket
pub const SLOTS_PER_BUCKET: usize = 3;

/// Maximum cuckoo relocation depth
pub const CUCKOO_DEPTH: usize = 3;

const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

/// FNV-1a hasher, the default for all fast-path keys
#[derive(Debug, Clone)]
pub struct FnvHasher(u64);

impl Default for FnvHasher {
    fn default() -> Self {
        Self(FNV_OFFSET)
    }
}

impl Hasher for FnvHasher {
    #[inline(always)]
    fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 ^= b as u64;
            self.0 = self.0.wrapping_mul(FNV_PRIME);
        }
    }

    #[inline(always)]
    fn finish(&self) -> u64 {
        self.0
    }
}

/// Default build-hasher for [`FlowMap`]
pub type FnvBuildHasher = BuildHasherDefault<FnvHasher>;

struct Entry<K, V> {
    key: K,
    value: V,
}

#[repr(align(64))]
struct Bucket<K, V> {
    /// Bit i set: slot i holds an entry
    busy: u8,
    /// Bit i set: slot i's entry resides here via its secondary index
    secondary: u8,
    /// Entries whose primary index is this bucket but live elsewhere
    displaced: u16,
    /// Bloom word over the tags of displaced entries
    bloom: u32,
    slots: [Option<Entry<K, V>>; SLOTS_PER_BUCKET],
}

impl<K, V> Bucket<K, V> {
    fn empty() -> Self {
        Self {
            busy: 0,
            secondary: 0,
            displaced: 0,
            bloom: 0,
            slots: [None, None, None],
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Probe {
    primary: usize,
    secondary: usize,
    tag: u32,
}

#[inline(always)]
fn bloom_bits(tag: u32) -> u32 {
    (1 << (tag & 31)) | (1 << ((tag >> 5) & 31))
}

/// Two-choice hash table with inline entries and bounded cuckoo relocation.
///
/// Not a general-purpose map: capacity is fixed at construction, entries
/// never spill to the heap, and a failed placement is reported to the
/// caller instead of growing the table.
pub struct FlowMap<K, V, S = FnvBuildHasher> {
    buckets: Box<[Bucket<K, V>]>,
    mask: usize,
    len: usize,
    hasher: S,
}

impl<K: Eq + Hash, V> FlowMap<K, V, FnvBuildHasher> {
    /// Create a table able to hold roughly `capacity` entries
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_hasher(capacity, FnvBuildHasher::default())
    }
}

impl<K: Eq + Hash, V, S: BuildHasher> FlowMap<K, V, S> {
    /// Create a table with an explicit hasher (tests inject pathological ones)
    pub fn with_capacity_and_hasher(capacity: usize, hasher: S) -> Self {
        let want = capacity.div_ceil(SLOTS_PER_BUCKET).max(2);
        let nbuckets = want.next_power_of_two();
        let buckets = (0..nbuckets).map(|_| Bucket::empty()).collect();
        Self {
            buckets,
            mask: nbuckets - 1,
            len: 0,
            hasher,
        }
    }

    /// Entries currently stored
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when no entries are stored
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Total slot capacity
    pub fn capacity(&self) -> usize {
        self.buckets.len() * SLOTS_PER_BUCKET
    }

    #[inline(always)]
    fn probe(&self, key: &K) -> Probe {
        let h = self.hasher.hash_one(key);
        let tag = (h >> 32) as u32;
        let primary = (h as usize) & self.mask;
        let spread = (tag.wrapping_mul(0x9e37_79b9) >> 16) as usize;
        // Mask is odd (power-of-two bucket count), so the xor distance is
        // never zero and the pair is always two distinct buckets.
        let secondary = primary ^ ((spread & self.mask) | 1);
        Probe {
            primary,
            secondary,
            tag,
        }
    }

    #[inline(always)]
    fn find_in_bucket(&self, bucket: usize, key: &K) -> Option<usize> {
        let b = &self.buckets[bucket];
        for slot in 0..SLOTS_PER_BUCKET {
            if b.busy & (1 << slot) != 0 {
                if let Some(e) = b.slots[slot].as_ref() {
                    if e.key == *key {
                        return Some(slot);
                    }
                }
            }
        }
        None
    }

    #[inline(always)]
    fn free_slot_in(&self, bucket: usize) -> Option<usize> {
        let busy = self.buckets[bucket].busy;
        (0..SLOTS_PER_BUCKET).find(|&slot| busy & (1 << slot) == 0)
    }

    #[inline(always)]
    fn bloom_maybe(&self, bucket: usize, tag: u32) -> bool {
        let bits = bloom_bits(tag);
        self.buckets[bucket].bloom & bits == bits
    }

    /// Look up a key
    #[inline]
    pub fn find(&self, key: &K) -> Option<&V> {
        let p = self.probe(key);
        if let Some(slot) = self.find_in_bucket(p.primary, key) {
            return self.buckets[p.primary].slots[slot].as_ref().map(|e| &e.value);
        }
        if self.bloom_maybe(p.primary, p.tag) {
            if let Some(slot) = self.find_in_bucket(p.secondary, key) {
                return self.buckets[p.secondary].slots[slot].as_ref().map(|e| &e.value);
            }
        }
        None
    }

    /// Look up a key, mutably
    #[inline]
    pub fn find_mut(&mut self, key: &K) -> Option<&mut V> {
        let p = self.probe(key);
        if let Some(slot) = self.find_in_bucket(p.primary, key) {
            return self.buckets[p.primary].slots[slot].as_mut().map(|e| &mut e.value);
        }
        if self.bloom_maybe(p.primary, p.tag) {
            if let Some(slot) = self.find_in_bucket(p.secondary, key) {
                return self.buckets[p.secondary].slots[slot].as_mut().map(|e| &mut e.value);
            }
        }
        None
    }

    /// Insert `value` under `key` unless the key is already present.
    ///
    /// Returns the stored entry either way: an existing entry is returned
    /// unchanged (the supplied value is dropped). `None` means the key could
    /// not be placed within the displacement bound.
    pub fn emplace(&mut self, key: K, value: V) -> Option<&mut V> {
        let p = self.probe(&key);
        if let Some(slot) = self.find_in_bucket(p.primary, &key) {
            return self.buckets[p.primary].slots[slot].as_mut().map(|e| &mut e.value);
        }
        if self.bloom_maybe(p.primary, p.tag) {
            if let Some(slot) = self.find_in_bucket(p.secondary, &key) {
                return self.buckets[p.secondary].slots[slot].as_mut().map(|e| &mut e.value);
            }
        }
        self.insert_fresh(p, key, value)
    }

    /// Insert a key the caller guarantees is absent (skips the existence
    /// probe). Used where uniqueness is already implied by control flow,
    /// e.g. a connection's reply-direction index entry.
    pub fn emplace_unique(&mut self, key: K, value: V) -> Option<&mut V> {
        let p = self.probe(&key);
        debug_assert!(self.find_in_bucket(p.primary, &key).is_none());
        debug_assert!(self.find_in_bucket(p.secondary, &key).is_none());
        self.insert_fresh(p, key, value)
    }

    fn insert_fresh(&mut self, p: Probe, key: K, value: V) -> Option<&mut V> {
        let (bucket, slot) = self.place(&p)?;
        {
            let b = &mut self.buckets[bucket];
            b.slots[slot] = Some(Entry { key, value });
            b.busy |= 1 << slot;
            if bucket == p.secondary {
                b.secondary |= 1 << slot;
            } else {
                b.secondary &= !(1 << slot);
            }
        }
        if bucket == p.secondary {
            let home = &mut self.buckets[p.primary];
            home.bloom |= bloom_bits(p.tag);
            home.displaced += 1;
        }
        self.len += 1;
        self.buckets[bucket].slots[slot].as_mut().map(|e| &mut e.value)
    }

    /// Pick (or make) a free slot for a fresh key
    fn place(&mut self, p: &Probe) -> Option<(usize, usize)> {
        if let Some(slot) = self.free_slot_in(p.primary) {
            return Some((p.primary, slot));
        }
        if let Some(slot) = self.free_slot_in(p.secondary) {
            return Some((p.secondary, slot));
        }
        if let Some(slot) = self.make_room(p.primary, CUCKOO_DEPTH) {
            return Some((p.primary, slot));
        }
        if let Some(slot) = self.make_room(p.secondary, CUCKOO_DEPTH) {
            return Some((p.secondary, slot));
        }
        None
    }

    /// Alternate bucket of the entry currently at (bucket, slot)
    fn alt_of(&self, bucket: usize, slot: usize) -> Option<usize> {
        let e = self.buckets[bucket].slots[slot].as_ref()?;
        let p = self.probe(&e.key);
        if bucket == p.primary {
            Some(p.secondary)
        } else {
            Some(p.primary)
        }
    }

    /// Free one slot in `bucket` by relocating a resident to its alternate
    /// bucket, recursing up to `depth` relocations.
    fn make_room(&mut self, bucket: usize, depth: usize) -> Option<usize> {
        if depth == 0 {
            return None;
        }
        for slot in 0..SLOTS_PER_BUCKET {
            let Some(alt) = self.alt_of(bucket, slot) else {
                continue;
            };
            if alt != bucket && self.free_slot_in(alt).is_some() {
                self.relocate(bucket, slot);
                return Some(slot);
            }
        }
        for slot in 0..SLOTS_PER_BUCKET {
            let Some(alt) = self.alt_of(bucket, slot) else {
                continue;
            };
            if alt == bucket {
                continue;
            }
            if self.make_room(alt, depth - 1).is_some() {
                // The recursion may have rearranged this bucket too.
                if let Some(free) = self.free_slot_in(bucket) {
                    return Some(free);
                }
                if self.alt_of(bucket, slot) == Some(alt) {
                    self.relocate(bucket, slot);
                    return Some(slot);
                }
            }
        }
        None
    }

    /// Move the entry at (from, slot) into its alternate bucket, keeping the
    /// bloom words and displacement counters consistent. The alternate must
    /// have a free slot.
    fn relocate(&mut self, from: usize, slot: usize) {
        let Some(entry) = self.buckets[from].slots[slot].take() else {
            return;
        };
        let was_secondary = self.buckets[from].secondary & (1 << slot) != 0;
        self.buckets[from].busy &= !(1 << slot);
        self.buckets[from].secondary &= !(1 << slot);

        let p = self.probe(&entry.key);
        let dest = if was_secondary { p.primary } else { p.secondary };
        let Some(free) = self.free_slot_in(dest) else {
            // No room after all: put the entry back untouched.
            let b = &mut self.buckets[from];
            b.slots[slot] = Some(entry);
            b.busy |= 1 << slot;
            if was_secondary {
                b.secondary |= 1 << slot;
            }
            return;
        };

        if was_secondary {
            // Moved home: dest is the entry's primary bucket, which also
            // loses one displaced entry.
            let d = &mut self.buckets[dest];
            d.slots[free] = Some(entry);
            d.busy |= 1 << free;
            d.secondary &= !(1 << free);
            d.displaced -= 1;
            if d.displaced == 0 {
                d.bloom = 0;
            }
        } else {
            {
                let d = &mut self.buckets[dest];
                d.slots[free] = Some(entry);
                d.busy |= 1 << free;
                d.secondary |= 1 << free;
            }
            let home = &mut self.buckets[p.primary];
            home.bloom |= bloom_bits(p.tag);
            home.displaced += 1;
        }
    }

    /// Remove a key, returning its value
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let p = self.probe(key);
        if let Some(slot) = self.find_in_bucket(p.primary, key) {
            let b = &mut self.buckets[p.primary];
            let entry = b.slots[slot].take()?;
            b.busy &= !(1 << slot);
            b.secondary &= !(1 << slot);
            self.len -= 1;
            return Some(entry.value);
        }
        if self.bloom_maybe(p.primary, p.tag) {
            if let Some(slot) = self.find_in_bucket(p.secondary, key) {
                let entry = {
                    let b = &mut self.buckets[p.secondary];
                    let entry = b.slots[slot].take()?;
                    b.busy &= !(1 << slot);
                    b.secondary &= !(1 << slot);
                    entry
                };
                let home = &mut self.buckets[p.primary];
                home.displaced -= 1;
                if home.displaced == 0 {
                    home.bloom = 0;
                }
                self.len -= 1;
                return Some(entry.value);
            }
        }
        None
    }

    /// Iterate entries, bucket-major then slot-minor. Order is otherwise
    /// unspecified.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.buckets.iter().flat_map(|b| {
            b.slots
                .iter()
                .filter_map(|s| s.as_ref().map(|e| (&e.key, &e.value)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hasher that maps every key to the same value
    #[derive(Default, Clone)]
    struct ConstHasher(u64);

    impl Hasher for ConstHasher {
        fn write(&mut self, _bytes: &[u8]) {}
        fn finish(&self) -> u64 {
            0xdead_beef_cafe_f00d
        }
    }

    type ConstBuild = BuildHasherDefault<ConstHasher>;

    #[test]
    fn test_emplace_find_remove_roundtrip() {
        let mut map: FlowMap<u64, u32> = FlowMap::with_capacity(1024);
        for k in 0..500u64 {
            assert!(map.emplace(k, k as u32 * 2).is_some(), "emplace {k}");
        }
        assert_eq!(map.len(), 500);
        for k in 0..500u64 {
            assert_eq!(map.find(&k), Some(&(k as u32 * 2)));
        }
        for k in 0..250u64 {
            assert_eq!(map.remove(&k), Some(k as u32 * 2));
        }
        assert_eq!(map.len(), 250);
        for k in 0..250u64 {
            assert_eq!(map.find(&k), None);
        }
        for k in 250..500u64 {
            assert_eq!(map.find(&k), Some(&(k as u32 * 2)));
        }
    }

    #[test]
    fn test_emplace_keeps_existing() {
        let mut map: FlowMap<u32, u32> = FlowMap::with_capacity(64);
        map.emplace(7, 100);
        let v = map.emplace(7, 999).unwrap();
        assert_eq!(*v, 100);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_find_mut() {
        let mut map: FlowMap<u32, u32> = FlowMap::with_capacity(64);
        map.emplace(1, 10);
        *map.find_mut(&1).unwrap() = 42;
        assert_eq!(map.find(&1), Some(&42));
        assert!(map.find_mut(&2).is_none());
    }

    #[test]
    fn test_collision_bound_one_bucket_pair() {
        // A constant hash maps every key onto the same bucket pair: the
        // primary fills, then the secondary, then placement must fail
        // cleanly with all prior entries intact.
        let mut map: FlowMap<u32, u32, ConstBuild> =
            FlowMap::with_capacity_and_hasher(1024, ConstBuild::default());
        for k in 0..(2 * SLOTS_PER_BUCKET as u32) {
            assert!(map.emplace(k, k).is_some(), "insertion {k} should fit");
        }
        assert!(map.emplace(999, 999).is_none());
        assert_eq!(map.len(), 2 * SLOTS_PER_BUCKET);
        for k in 0..(2 * SLOTS_PER_BUCKET as u32) {
            assert_eq!(map.find(&k), Some(&k));
        }
        assert_eq!(map.find(&999), None);
    }

    #[test]
    fn test_collision_bound_recovers_after_remove() {
        let mut map: FlowMap<u32, u32, ConstBuild> =
            FlowMap::with_capacity_and_hasher(1024, ConstBuild::default());
        for k in 0..6u32 {
            map.emplace(k, k);
        }
        assert!(map.emplace(6, 6).is_none());
        map.remove(&3);
        assert!(map.emplace(6, 6).is_some());
        assert_eq!(map.find(&6), Some(&6));
    }

    #[test]
    fn test_cuckoo_displacement_under_pressure() {
        // Tiny table: 4 buckets, 12 slots. Filling most of it forces
        // secondary placement and displacement chains.
        let mut map: FlowMap<u64, u64> = FlowMap::with_capacity(8);
        let mut stored = Vec::new();
        for k in 0..1000u64 {
            if map.emplace(k, k * 3).is_some() {
                stored.push(k);
            }
            if stored.len() == 10 {
                break;
            }
        }
        assert!(stored.len() >= 8, "expected most of the table usable");
        for &k in &stored {
            assert_eq!(map.find(&k), Some(&(k * 3)), "key {k} lost");
        }
    }

    #[test]
    fn test_remove_maintains_secondary_bookkeeping() {
        let mut map: FlowMap<u32, u32, ConstBuild> =
            FlowMap::with_capacity_and_hasher(256, ConstBuild::default());
        for k in 0..6u32 {
            map.emplace(k, k);
        }
        // Drain everything, including the displaced half.
        for k in 0..6u32 {
            assert_eq!(map.remove(&k), Some(k));
        }
        assert!(map.is_empty());
        // A fresh fill must succeed again up to the same bound.
        for k in 10..16u32 {
            assert!(map.emplace(k, k).is_some());
        }
        assert!(map.emplace(99, 99).is_none());
    }

    #[test]
    fn test_iteration_visits_all_entries() {
        let mut map: FlowMap<u32, u32> = FlowMap::with_capacity(256);
        for k in 0..100u32 {
            map.emplace(k, k + 1);
        }
        let mut seen: Vec<u32> = map.iter().map(|(k, _)| *k).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..100u32).collect::<Vec<_>>());
    }

    #[test]
    fn test_emplace_unique() {
        let mut map: FlowMap<u32, u32> = FlowMap::with_capacity(64);
        assert!(map.emplace_unique(5, 50).is_some());
        assert_eq!(map.find(&5), Some(&50));
        assert_eq!(map.len(), 1);
    }
}
