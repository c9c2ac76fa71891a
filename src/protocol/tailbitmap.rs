//! Tail bitmap: a compact growable set of non-negative integers with a
//! densely-filled prefix.
//!
//! The set represented is `{i | i < offset} ∪ {i | bit (i - offset) set in
//! words}`. The stored `offset` is always a multiple of 64; constructing
//! with a non-aligned offset rounds it down and seeds the first word with
//! the remainder bits, so the represented set is unchanged.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Compact (offset, words) set of non-negative i64 integers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TailBitmap {
    /// Dense prefix: everything below this is a member. Multiple of 64.
    offset: i64,

    /// Sparse suffix words; bit `b` of `words[w]` tracks membership of
    /// `offset + 64*w + b`.
    words: Vec<u64>,
}

impl TailBitmap {
    /// Creates a bitmap whose members are exactly `{i | i < offset}`.
    pub fn new(offset: i64) -> Self {
        debug_assert!(offset >= 0);
        let aligned = offset & !63;
        let words = if offset > aligned {
            vec![(1u64 << (offset - aligned)) - 1]
        } else {
            vec![]
        };
        TailBitmap {
            offset: aligned,
            words,
        }
    }

    /// Creates a bitmap from a dense prefix bound plus individual members.
    pub fn from(offset: i64, ones: Vec<i64>) -> Self {
        let mut bitmap = Self::new(offset);
        for idx in ones {
            bitmap.set(idx);
        }
        bitmap
    }

    /// Marks `idx` as a member. Indexes below the dense prefix are already
    /// members and are left untouched.
    pub fn set(&mut self, idx: i64) {
        if idx < self.offset {
            return;
        }
        let word = ((idx - self.offset) / 64) as usize;
        while self.words.len() <= word {
            self.words.push(0);
        }
        self.words[word] |= 1u64 << ((idx - self.offset) % 64);
    }

    /// Tests membership of `idx`.
    pub fn get(&self, idx: i64) -> bool {
        if idx < self.offset {
            return true;
        }
        let word = ((idx - self.offset) / 64) as usize;
        if word >= self.words.len() {
            return false;
        }
        self.words[word] & (1u64 << ((idx - self.offset) % 64)) != 0
    }

    /// The dense prefix bound (a multiple of 64).
    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// One past the highest member, or `offset` if the suffix is all-zero.
    pub fn len(&self) -> i64 {
        for (w, &word) in self.words.iter().enumerate().rev() {
            if word != 0 {
                return self.offset
                    + 64 * w as i64
                    + (64 - i64::from(word.leading_zeros()));
            }
        }
        self.offset
    }

    /// True iff the set has no members at all.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Merges all members of `other` into `self`. If `other` has a higher
    /// offset, `self`'s offset is raised first, dropping words subsumed by
    /// the new dense prefix.
    pub fn union(&mut self, other: &TailBitmap) {
        if other.offset > self.offset {
            let shift = ((other.offset - self.offset) / 64) as usize;
            if shift >= self.words.len() {
                self.words.clear();
            } else {
                self.words.drain(..shift);
            }
            self.offset = other.offset;
        }

        // word boundaries align since both offsets are multiples of 64
        let skip = ((self.offset - other.offset) / 64) as usize;
        for (w, &word) in other.words.iter().enumerate().skip(skip) {
            let idx = w - skip;
            while self.words.len() <= idx {
                self.words.push(0);
            }
            self.words[idx] |= word;
        }
    }

    /// Compact rendering: `"<offset>"` if the suffix is empty, otherwise
    /// `"<offset>:<w0>:<w1>:…"` with words in lowercase hex.
    pub fn short_str(&self) -> String {
        let mut s = format!("{}", self.offset);
        for word in &self.words {
            s.push_str(&format!(":{:x}", word));
        }
        s
    }
}

// Display the compact form in log lines.
impl fmt::Display for TailBitmap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.short_str())
    }
}
