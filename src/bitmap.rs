//! Fixed-size bit vector for free/used tracking.
//!
//! Used for the write-buffer stripe bitmap and the user segment bitmap.
//! All operations take an internal lock, so find-and-set is linearizable
//! across allocator threads.

use parking_lot::Mutex;
use tracing::warn;

const BITS_PER_WORD: u32 = 64;

struct Inner {
    words: Vec<u64>,
    num_bits_set: u32,
}

/// A fixed-size bitmap with a tracked population count.
pub struct BitMap {
    num_bits: u32,
    inner: Mutex<Inner>,
}

impl BitMap {
    /// Create a bitmap with `num_bits` cleared bits.
    pub fn new(num_bits: u32) -> Self {
        Self {
            num_bits,
            inner: Mutex::new(Inner {
                words: vec![0; Self::words_for(num_bits)],
                num_bits_set: 0,
            }),
        }
    }

    /// Number of u64 words needed to hold `num_bits`.
    pub fn words_for(num_bits: u32) -> usize {
        num_bits.div_ceil(BITS_PER_WORD) as usize
    }

    /// Size of the packed representation in bytes.
    pub fn byte_len(&self) -> usize {
        Self::words_for(self.num_bits) * 8
    }

    #[inline]
    pub fn num_bits(&self) -> u32 {
        self.num_bits
    }

    /// Check if `index` is inside the bitmap.
    #[inline]
    pub fn is_valid_bit(&self, index: u32) -> bool {
        index < self.num_bits
    }

    pub fn is_set(&self, index: u32) -> bool {
        if !self.is_valid_bit(index) {
            return false;
        }
        let inner = self.inner.lock();
        test(&inner.words, index)
    }

    /// Set a bit. Returns `true` if it was previously clear.
    pub fn set_bit(&self, index: u32) -> bool {
        assert!(self.is_valid_bit(index), "bit {index} out of range");
        let mut inner = self.inner.lock();
        if test(&inner.words, index) {
            return false;
        }
        set(&mut inner.words, index);
        inner.num_bits_set += 1;
        true
    }

    /// Clear a bit. Returns `true` if it was previously set.
    pub fn clear_bit(&self, index: u32) -> bool {
        assert!(self.is_valid_bit(index), "bit {index} out of range");
        let mut inner = self.inner.lock();
        if !test(&inner.words, index) {
            return false;
        }
        clear(&mut inner.words, index);
        inner.num_bits_set = match inner.num_bits_set.checked_sub(1) {
            Some(count) => count,
            None => {
                let count = popcount(&inner.words);
                warn!(index, count, "bitmap population was behind its bits, recounted");
                count
            }
        };
        true
    }

    /// Find the first clear bit at or after `start`.
    pub fn find_first_zero(&self, start: u32) -> Option<u32> {
        let inner = self.inner.lock();
        self.scan(&inner.words, start, false)
    }

    /// Find the first set bit at or after `start`.
    pub fn find_first_set(&self, start: u32) -> Option<u32> {
        let inner = self.inner.lock();
        self.scan(&inner.words, start, true)
    }

    /// Atomically find the first clear bit at or after `start` and set it.
    ///
    /// Returns `None` when no clear bit remains in `[start, num_bits)`.
    pub fn set_first_zero(&self, start: u32) -> Option<u32> {
        let mut inner = self.inner.lock();
        let index = self.scan(&inner.words, start, false)?;
        set(&mut inner.words, index);
        inner.num_bits_set += 1;
        Some(index)
    }

    /// Number of set bits.
    pub fn num_bits_set(&self) -> u32 {
        self.inner.lock().num_bits_set
    }

    /// Overwrite the population count without rescanning.
    ///
    /// The caller vouches for `count`. A count that runs below the set
    /// bits is repaired by the next [`clear_bit`](Self::clear_bit) that
    /// would take it under zero.
    pub fn set_num_bits_set(&self, count: u32) {
        self.inner.lock().num_bits_set = count;
    }

    /// Clear every bit.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.words.iter_mut().for_each(|w| *w = 0);
        inner.num_bits_set = 0;
    }

    /// Write the packed words as little-endian bytes into `buf`.
    pub fn write_to(&self, buf: &mut [u8]) {
        let inner = self.inner.lock();
        for (i, word) in inner.words.iter().enumerate() {
            buf[i * 8..i * 8 + 8].copy_from_slice(&word.to_le_bytes());
        }
    }

    /// Replace the words from little-endian bytes.
    ///
    /// The population count is left untouched; callers restore it with
    /// [`set_num_bits_set`](Self::set_num_bits_set) or
    /// [`recount`](Self::recount).
    pub fn read_from(&self, buf: &[u8]) {
        let mut inner = self.inner.lock();
        for (i, word) in inner.words.iter_mut().enumerate() {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&buf[i * 8..i * 8 + 8]);
            *word = u64::from_le_bytes(bytes);
        }
        let tail = self.num_bits % BITS_PER_WORD;
        if tail != 0 {
            if let Some(last) = inner.words.last_mut() {
                *last &= (1u64 << tail) - 1;
            }
        }
    }

    /// Recompute the population count from the words.
    pub fn recount(&self) -> u32 {
        let mut inner = self.inner.lock();
        let count = popcount(&inner.words);
        inner.num_bits_set = count;
        count
    }

    fn scan(&self, words: &[u64], start: u32, want_set: bool) -> Option<u32> {
        if start >= self.num_bits {
            return None;
        }
        let mut word_idx = (start / BITS_PER_WORD) as usize;
        let mut mask = !0u64 << (start % BITS_PER_WORD);
        while word_idx < words.len() {
            let candidates = if want_set {
                words[word_idx]
            } else {
                !words[word_idx]
            } & mask;
            if candidates != 0 {
                let index = word_idx as u32 * BITS_PER_WORD + candidates.trailing_zeros();
                return (index < self.num_bits).then_some(index);
            }
            word_idx += 1;
            mask = !0;
        }
        None
    }
}

#[inline]
fn test(words: &[u64], index: u32) -> bool {
    words[(index / BITS_PER_WORD) as usize] & (1 << (index % BITS_PER_WORD)) != 0
}

#[inline]
fn set(words: &mut [u64], index: u32) {
    words[(index / BITS_PER_WORD) as usize] |= 1 << (index % BITS_PER_WORD);
}

#[inline]
fn clear(words: &mut [u64], index: u32) {
    words[(index / BITS_PER_WORD) as usize] &= !(1 << (index % BITS_PER_WORD));
}

fn popcount(words: &[u64]) -> u32 {
    words.iter().map(|w| w.count_ones()).sum()
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_set_and_clear() {
        let bitmap = BitMap::new(10);
        assert!(bitmap.set_bit(3));
        assert!(!bitmap.set_bit(3));
        assert!(bitmap.is_set(3));
        assert_eq!(bitmap.num_bits_set(), 1);
        assert!(bitmap.clear_bit(3));
        assert!(!bitmap.clear_bit(3));
        assert_eq!(bitmap.num_bits_set(), 0);
        assert!(!bitmap.is_set(42));
    }

    #[test]
    fn test_set_first_zero_until_full() {
        let bitmap = BitMap::new(70);
        for expected in 0..70 {
            assert_eq!(bitmap.set_first_zero(0), Some(expected));
        }
        assert_eq!(bitmap.set_first_zero(0), None);
        assert_eq!(bitmap.num_bits_set(), 70);

        bitmap.clear_bit(65);
        assert_eq!(bitmap.find_first_zero(0), Some(65));
        assert_eq!(bitmap.find_first_zero(66), None);
    }

    #[test]
    fn test_find_first_set_across_words() {
        let bitmap = BitMap::new(200);
        bitmap.set_bit(5);
        bitmap.set_bit(130);
        assert_eq!(bitmap.find_first_set(0), Some(5));
        assert_eq!(bitmap.find_first_set(6), Some(130));
        assert_eq!(bitmap.find_first_set(131), None);
        assert_eq!(bitmap.find_first_set(500), None);
    }

    #[test]
    fn test_bytes_keep_trusted_count() {
        let bitmap = BitMap::new(12);
        bitmap.set_bit(1);
        bitmap.set_bit(11);
        let mut buf = vec![0u8; bitmap.byte_len()];
        bitmap.write_to(&mut buf);

        let restored = BitMap::new(12);
        restored.read_from(&buf);
        assert!(restored.is_set(1));
        assert!(restored.is_set(11));
        // count is not rescanned on load
        assert_eq!(restored.num_bits_set(), 0);
        restored.set_num_bits_set(2);
        assert_eq!(restored.num_bits_set(), 2);
        assert_eq!(restored.recount(), 2);
    }

    #[test]
    fn test_clear_below_trusted_count_recounts() {
        let bitmap = BitMap::new(16);
        bitmap.set_bit(2);
        bitmap.set_bit(7);
        bitmap.set_num_bits_set(0);

        assert!(bitmap.clear_bit(2));
        assert_eq!(bitmap.num_bits_set(), 1);
        assert!(bitmap.clear_bit(7));
        assert_eq!(bitmap.num_bits_set(), 0);
    }

    #[test]
    fn test_concurrent_set_first_zero() {
        let bitmap = Arc::new(BitMap::new(256));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let bitmap = bitmap.clone();
                std::thread::spawn(move || {
                    let mut got = Vec::new();
                    while let Some(i) = bitmap.set_first_zero(0) {
                        got.push(i);
                    }
                    got
                })
            })
            .collect();

        let mut all: Vec<u32> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        assert_eq!(all, (0..256).collect::<Vec<_>>());
        assert_eq!(bitmap.num_bits_set(), 256);
    }
}
