//! Camera-subset keys and the open-addressed bucket index

use std::fmt;

/// Fixed-width bitset of camera indices; bit `i` set means camera `i` covers
/// the triangle. Ordered by numeric value.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct CameraSet(u64);

impl CameraSet {
    pub const EMPTY: CameraSet = CameraSet(0);

    pub fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u64 {
        self.0
    }

    pub fn insert(&mut self, camera: usize) {
        debug_assert!(camera < 64);
        self.0 |= 1 << camera;
    }

    pub fn contains(self, camera: usize) -> bool {
        camera < 64 && self.0 & (1 << camera) != 0
    }

    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Camera indices in ascending order
    pub fn iter(self) -> impl Iterator<Item = usize> {
        let mut bits = self.0;
        std::iter::from_fn(move || {
            if bits == 0 {
                return None;
            }
            let i = bits.trailing_zeros() as usize;
            bits &= bits - 1;
            Some(i)
        })
    }
}

impl FromIterator<usize> for CameraSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut set = CameraSet::EMPTY;
        for camera in iter {
            set.insert(camera);
        }
        set
    }
}

impl fmt::Debug for CameraSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Stable 64-bit mix of a key
fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

/// Open-addressed map from camera subset to bucket index.
///
/// Linear probing over a power-of-two table, grown at 70% load.
pub struct BucketIndex {
    slots: Vec<Option<(CameraSet, u32)>>,
    len: usize,
}

impl Default for BucketIndex {
    fn default() -> Self {
        Self::with_capacity(16)
    }
}

impl BucketIndex {
    pub fn with_capacity(capacity: usize) -> Self {
        let size = (capacity.max(4) * 10 / 7 + 1).next_power_of_two();
        Self {
            slots: vec![None; size],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn slot_of(&self, key: CameraSet) -> usize {
        let mask = self.slots.len() - 1;
        let mut slot = splitmix64(key.bits()) as usize & mask;
        loop {
            match self.slots[slot] {
                Some((k, _)) if k != key => slot = (slot + 1) & mask,
                _ => return slot,
            }
        }
    }

    pub fn get(&self, key: CameraSet) -> Option<u32> {
        self.slots[self.slot_of(key)].map(|(_, bucket)| bucket)
    }

    /// Bucket for `key`, allocating one with `create` when absent
    pub fn get_or_insert_with(&mut self, key: CameraSet, create: impl FnOnce() -> u32) -> u32 {
        let slot = self.slot_of(key);
        if let Some((_, bucket)) = self.slots[slot] {
            return bucket;
        }
        let bucket = create();
        self.slots[slot] = Some((key, bucket));
        self.len += 1;
        if self.len * 10 > self.slots.len() * 7 {
            self.grow();
        }
        bucket
    }

    fn grow(&mut self) {
        let len = self.slots.len() * 2;
        let old = std::mem::replace(&mut self.slots, vec![None; len]);
        for (key, bucket) in old.into_iter().flatten() {
            let slot = self.slot_of(key);
            self.slots[slot] = Some((key, bucket));
        }
    }
}
