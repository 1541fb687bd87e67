//! Deterministic payload patterns.
//!
//! A payload is a stream of little-endian 32-bit words derived from the
//! pattern, the run seed and a per-buffer key (the buffer sequence or probe
//! id). The same inputs always regenerate the same bytes, so the receiver
//! verifies without any side channel.

use crate::internal::constants::MAX_VERBOSE_MISMATCHES;

/// Word used by [`Pattern::Fixed`]
pub const FIXED_WORD: u32 = 0xDEAD_BEEF;

/// LCG multiplier for [`Pattern::Random`]
const LCG_MULTIPLIER: u32 = 69069;

/// Spreads consecutive keys across the LCG state space
const KEY_MIX: u32 = 0x9E37_79B9;

/// Payload pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Pattern {
    /// `(key << 16) | word_index`
    #[default]
    Sequential,
    /// 32-bit LCG seeded from the run seed and the key
    Random,
    /// Constant `0xDEADBEEF`
    Fixed,
    /// A single set bit walking through each word
    Walking,
    /// Words alternating between all-zeros and all-ones
    Alternating,
}

impl Pattern {
    /// Short lowercase name
    pub const fn as_str(&self) -> &'static str {
        match self {
            Pattern::Sequential => "sequential",
            Pattern::Random => "random",
            Pattern::Fixed => "fixed",
            Pattern::Walking => "walking",
            Pattern::Alternating => "alternating",
        }
    }
}

impl core::fmt::Display for Pattern {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Endless word stream for one buffer
struct Words {
    pattern: Pattern,
    key: u32,
    state: u32,
    index: u32,
}

impl Iterator for Words {
    type Item = u32;

    #[inline]
    fn next(&mut self) -> Option<u32> {
        let i = self.index;
        self.index = self.index.wrapping_add(1);
        Some(match self.pattern {
            Pattern::Sequential => (self.key << 16) | (i & 0xFFFF),
            Pattern::Random => {
                self.state = self.state.wrapping_mul(LCG_MULTIPLIER).wrapping_add(1);
                self.state
            }
            Pattern::Fixed => FIXED_WORD,
            Pattern::Walking => 1u32 << (i % 32),
            Pattern::Alternating => {
                if i & 1 == 0 {
                    0
                } else {
                    u32::MAX
                }
            }
        })
    }
}

/// One mismatched word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mismatch {
    /// Word index within the buffer
    pub index: usize,
    /// Expected word
    pub expected: u32,
    /// Received word
    pub actual: u32,
}

/// Result of verifying one buffer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Verification {
    /// Mismatched words
    pub mismatches: usize,
    /// First mismatches, at most [`MAX_VERBOSE_MISMATCHES`]
    pub first: Vec<Mismatch>,
}

impl Verification {
    /// Check if the buffer matched
    #[inline]
    pub fn is_ok(&self) -> bool {
        self.mismatches == 0
    }

    /// Log the recorded mismatches at debug level
    pub fn log(&self, key: u64) {
        for m in &self.first {
            log::debug!(
                "buffer {key}: word {} expected 0x{:08x}, got 0x{:08x}",
                m.index,
                m.expected,
                m.actual
            );
        }
        if self.mismatches > self.first.len() {
            log::debug!(
                "buffer {key}: {} further mismatches not shown",
                self.mismatches - self.first.len()
            );
        }
    }
}

/// Pattern generator and verifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatternGenerator {
    pattern: Pattern,
    seed: u32,
}

impl PatternGenerator {
    /// Create a generator
    pub const fn new(pattern: Pattern, seed: u32) -> Self {
        Self { pattern, seed }
    }

    /// Pattern in use
    pub const fn pattern(&self) -> Pattern {
        self.pattern
    }

    fn words(&self, key: u64) -> Words {
        let key = key as u32;
        Words {
            pattern: self.pattern,
            key,
            state: self.seed ^ key.wrapping_mul(KEY_MIX),
            index: 0,
        }
    }

    /// Fill `buf` with the payload for `key`. A trailing partial word gets
    /// the low bytes of the next word.
    pub fn fill(&self, key: u64, buf: &mut [u8]) {
        for (chunk, word) in buf.chunks_mut(4).zip(self.words(key)) {
            let bytes = word.to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }

    /// Compare `buf` against the payload for `key`
    pub fn verify(&self, key: u64, buf: &[u8]) -> Verification {
        let mut result = Verification::default();
        for (index, (chunk, word)) in buf.chunks(4).zip(self.words(key)).enumerate() {
            let bytes = word.to_le_bytes();
            if chunk != &bytes[..chunk.len()] {
                result.mismatches += 1;
                if result.first.len() < MAX_VERBOSE_MISMATCHES {
                    let mut actual = [0u8; 4];
                    actual[..chunk.len()].copy_from_slice(chunk);
                    result.first.push(Mismatch {
                        index,
                        expected: word,
                        actual: u32::from_le_bytes(actual),
                    });
                }
            }
        }
        result
    }
}

/// 64-bit FNV-1a digest
pub fn digest(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes
        .iter()
        .fold(OFFSET, |hash, b| (hash ^ u64::from(*b)).wrapping_mul(PRIME))
}

// =============================================================================
// Tests
// =============================================================================
