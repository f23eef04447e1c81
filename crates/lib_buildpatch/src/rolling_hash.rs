//! Fixed window cyclic polynomial rolling hash.
//!
//! The hash value of a window only depends on the bytes in it, so equal
//! windows anywhere in any build hash to the same value. The lookup table
//! and the window size used for chunk matching are therefore part of the
//! storage format and must not change between runs.

/// Polynomial used to derive the byte lookup table.
pub const HASH_POLYNOMIAL: u64 = 0xC96C_5795_D787_0F42;

const fn build_hash_table() -> [u64; 256] {
    let mut table = [0u64; 256];
    let mut byte = 0;
    while byte < 256 {
        let mut val = byte as u64;
        let mut i = 0;
        while i < 8 {
            if val & 1 == 1 {
                val = (val >> 1) ^ HASH_POLYNOMIAL;
            } else {
                val >>= 1;
            }
            i += 1;
        }
        table[byte] = val;
        byte += 1;
    }
    table
}

/// Per byte contribution to the hash state.
pub static HASH_TABLE: [u64; 256] = build_hash_table();

/// A rolling hash over a window of `window_size` bytes.
///
/// The window is first filled with `consume_byte`/`consume_bytes`, then
/// moved one byte at a time with `roll_forward`. Calling the operations
/// out of order is a logic error and panics.
#[derive(Clone, Debug)]
pub struct RollingHash {
    window_size: usize,
    state: u64,
    window: Vec<u8>,
    //Index of the oldest byte in the circular window buffer.
    start: usize,
    num_consumed: usize,
}

impl RollingHash {
    pub fn new(window_size: usize) -> Self {
        assert!(window_size > 0, "rolling hash window size must be non zero");
        Self {
            window_size,
            state: 0,
            window: vec![0u8; window_size],
            start: 0,
            num_consumed: 0,
        }
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Number of free slots left before the window is full.
    pub fn num_data_needed(&self) -> usize {
        self.window_size - self.num_consumed
    }

    pub fn is_full(&self) -> bool {
        self.num_consumed == self.window_size
    }

    /// Adds one byte to a window that is not yet full.
    pub fn consume_byte(&mut self, byte: u8) {
        assert!(
            !self.is_full(),
            "consume_byte called on a full rolling hash window"
        );
        self.state = self.state.rotate_left(1) ^ HASH_TABLE[byte as usize];
        self.window[self.num_consumed] = byte;
        self.num_consumed += 1;
    }

    pub fn consume_bytes(&mut self, bytes: &[u8]) {
        assert!(
            bytes.len() <= self.num_data_needed(),
            "consume_bytes would overflow the rolling hash window"
        );
        for &byte in bytes {
            self.consume_byte(byte);
        }
    }

    /// Slides the window one byte forward, dropping the oldest byte.
    pub fn roll_forward(&mut self, byte: u8) {
        assert!(
            self.is_full(),
            "roll_forward requires a full rolling hash window"
        );
        let old = self.window[self.start];
        let old_contribution =
            HASH_TABLE[old as usize].rotate_left((self.window_size % 64) as u32);
        self.state =
            self.state.rotate_left(1) ^ old_contribution ^ HASH_TABLE[byte as usize];
        self.window[self.start] = byte;
        self.start = (self.start + 1) % self.window_size;
    }

    pub fn get_window_hash(&self) -> u64 {
        assert!(
            self.is_full(),
            "get_window_hash requires a full rolling hash window"
        );
        self.state
    }

    /// Copies the current window, oldest byte first, into a new vector.
    pub fn get_window_data(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.num_consumed);
        if self.is_full() {
            out.extend_from_slice(&self.window[self.start..]);
            out.extend_from_slice(&self.window[..self.start]);
        } else {
            out.extend_from_slice(&self.window[..self.num_consumed]);
        }
        out
    }

    pub fn clear(&mut self) {
        self.state = 0;
        self.start = 0;
        self.num_consumed = 0;
    }

    /// Hashes a whole slice in one go.
    ///
    /// Matches the value `get_window_hash` reports for a window holding
    /// exactly these bytes.
    pub fn get_hash_for_data_set(data: &[u8]) -> u64 {
        data.iter().fold(0u64, |state, &byte| {
            state.rotate_left(1) ^ HASH_TABLE[byte as usize]
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_data(len: usize) -> Vec<u8> {
        //Simple LCG so the test data is not periodic.
        let mut seed: u32 = 0x1234_5678;
        (0..len)
            .map(|_| {
                seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                (seed >> 24) as u8
            })
            .collect()
    }

    #[test]
    fn test_table_first_entries() {
        assert_eq!(HASH_TABLE[0], 0);
        assert_ne!(HASH_TABLE[1], HASH_TABLE[2]);
    }

    #[test]
    fn test_incremental_matches_static() {
        for window in [1usize, 7, 64, 65, 130] {
            let data = sample_data(window * 5);
            let mut hasher = RollingHash::new(window);
            hasher.consume_bytes(&data[..window]);
            assert_eq!(
                hasher.get_window_hash(),
                RollingHash::get_hash_for_data_set(&data[..window])
            );

            for pos in 1..=(data.len() - window) {
                hasher.roll_forward(data[pos + window - 1]);
                assert_eq!(
                    hasher.get_window_hash(),
                    RollingHash::get_hash_for_data_set(&data[pos..pos + window]),
                    "window {window} position {pos}"
                );
                assert_eq!(hasher.get_window_data(), &data[pos..pos + window]);
            }
        }
    }

    #[test]
    fn test_same_window_same_hash() {
        let data = sample_data(200);
        let mut left = RollingHash::new(50);
        left.consume_bytes(&data[100..150]);
        let mut right = RollingHash::new(50);
        right.consume_bytes(&data[..50]);
        for &byte in &data[50..150] {
            right.roll_forward(byte);
        }
        assert_eq!(left.get_window_hash(), right.get_window_hash());
    }

    #[test]
    fn test_clear_resets_window() {
        let mut hasher = RollingHash::new(4);
        hasher.consume_bytes(&[1, 2, 3, 4]);
        hasher.clear();
        assert!(!hasher.is_full());
        assert_eq!(hasher.num_data_needed(), 4);
        hasher.consume_bytes(&[5, 6, 7, 8]);
        assert_eq!(
            hasher.get_window_hash(),
            RollingHash::get_hash_for_data_set(&[5, 6, 7, 8])
        );
    }

    #[test]
    #[should_panic]
    fn test_consume_on_full_window_panics() {
        let mut hasher = RollingHash::new(2);
        hasher.consume_bytes(&[1, 2]);
        hasher.consume_byte(3);
    }

    #[test]
    #[should_panic]
    fn test_roll_before_full_panics() {
        let mut hasher = RollingHash::new(4);
        hasher.consume_byte(1);
        hasher.roll_forward(2);
    }
}
