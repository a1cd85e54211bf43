//! The respawn-code bitset: a fixed 128-bit array of which target exit
//! codes should trigger a respawn.

/// 128 bits, one per possible exit status in `0..128`, packed as four
/// 32-bit words. Codes outside `0..128` are never respawnable by
/// construction: there is no bit to set for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RespawnBits([u32; 4]);

const WORD_BITS: i32 = 32;

impl RespawnBits {
    /// The default mask applied when `--respawn` is given and no
    /// `--respawn-code` overrides it: every non-zero code in `0..128`
    /// respawns, a clean exit (code 0) does not.
    pub const DEFAULT: Self = Self([0xFFFF_FFFE, u32::MAX, u32::MAX, u32::MAX]);

    /// No codes set; used as the starting point once the first explicit
    /// `--respawn-code` clears the default mask.
    pub const NONE: Self = Self([0, 0, 0, 0]);

    /// Sets every bit 0..128 (the `--respawn-code -1` "all codes" case).
    pub fn set_all(&mut self) {
        self.0 = [u32::MAX; 4];
    }

    /// Sets bit `code`. `code` must be in `0..128`; out-of-range values are
    /// rejected by the option parser before this is ever called.
    pub fn set(&mut self, code: i32) {
        if !(0..128).contains(&code) {
            return;
        }

        let word = (code / WORD_BITS) as usize;
        let bit = code % WORD_BITS;

        self.0[word] |= 1 << bit;
    }

    /// Whether exit code `code` should trigger a respawn under this mask.
    #[must_use]
    pub fn contains(&self, code: i32) -> bool {
        if !(0..128).contains(&code) {
            return false;
        }

        let word = (code / WORD_BITS) as usize;
        let bit = code % WORD_BITS;

        (self.0[word] >> bit) & 1 != 0
    }
}

impl Default for RespawnBits {
    fn default() -> Self {
        Self::NONE
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::RespawnBits;

    #[test]
    fn default_mask_respawns_every_nonzero_code_in_range() {
        let bits = RespawnBits::DEFAULT;

        assert_eq!(bits.contains(0), false);

        for code in 1..128 {
            assert_eq!(bits.contains(code), true, "code {code} should respawn");
        }
    }

    #[test]
    fn codes_outside_0_to_127_never_respawn() {
        let mut bits = RespawnBits::DEFAULT;
        bits.set_all();

        assert_eq!(bits.contains(-1), false);
        assert_eq!(bits.contains(128), false);
        assert_eq!(bits.contains(254), false);
        assert_eq!(bits.contains(1000), false);
    }

    #[test]
    fn set_all_covers_the_full_range_including_zero() {
        let mut bits = RespawnBits::NONE;
        bits.set_all();

        for code in 0..128 {
            assert_eq!(bits.contains(code), true);
        }
    }

    #[test]
    fn explicit_set_only_affects_the_targeted_bit() {
        let mut bits = RespawnBits::NONE;
        bits.set(42);

        assert_eq!(bits.contains(42), true);
        assert_eq!(bits.contains(7), false);
        assert_eq!(bits.contains(41), false);
        assert_eq!(bits.contains(43), false);
    }

    #[test]
    fn set_spans_all_four_words() {
        let mut bits = RespawnBits::NONE;
        bits.set(0);
        bits.set(31);
        bits.set(32);
        bits.set(63);
        bits.set(64);
        bits.set(95);
        bits.set(96);
        bits.set(127);

        for code in [0, 31, 32, 63, 64, 95, 96, 127] {
            assert_eq!(bits.contains(code), true, "code {code}");
        }
        assert_eq!(bits.contains(1), false);
        assert_eq!(bits.contains(30), false);
    }

    #[test]
    fn set_out_of_range_is_a_no_op() {
        let mut bits = RespawnBits::NONE;
        bits.set(-1);
        bits.set(128);

        assert_eq!(bits, RespawnBits::NONE);
    }
}
