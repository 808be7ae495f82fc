//! Similarity scoring for candidate matching.
//!
//! This module contains:
//! - Gestalt (Ratcliff/Obershelp) similarity ratio
//! - Longest common contiguous run
//! - The per-field floors and aggregate score used by the fuzzy tier

use rustc_hash::FxHashMap;

use crate::normalize::NormalizedFields;

// ============================================================================
// Score Thresholds
// ============================================================================

/// Aggregate ratio a candidate must exceed to be accepted without asking
pub const MIN_RATIO_ALL: f64 = 0.9;

/// Every field pair must exceed this ratio for a candidate to be kept
pub const MIN_RATIO_EACH: f64 = 0.7;

/// Required longest common run per field, capped by the shorter field length
pub const MIN_OVERLAP: usize = 5;

// ============================================================================
// Gestalt Matcher
// ============================================================================

/// A contiguous run `a[a_start..a_start+len] == b[b_start..b_start+len]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Run {
    pub a_start: usize,
    pub b_start: usize,
    pub len: usize,
}

struct Matcher {
    a: Vec<char>,
    b: Vec<char>,
    /// Positions of each char in `b`, ascending
    b2j: FxHashMap<char, Vec<usize>>,
}

impl Matcher {
    fn new(a: &str, b: &str) -> Self {
        let a: Vec<char> = a.chars().collect();
        let b: Vec<char> = b.chars().collect();
        let mut b2j: FxHashMap<char, Vec<usize>> = FxHashMap::default();
        for (j, &c) in b.iter().enumerate() {
            b2j.entry(c).or_default().push(j);
        }
        Self { a, b, b2j }
    }

    /// Longest run inside `a[alo..ahi]` x `b[blo..bhi]`.
    /// Ties go to the earliest start in `a`, then the earliest in `b`.
    fn longest_run(&self, alo: usize, ahi: usize, blo: usize, bhi: usize) -> Run {
        let mut best = Run {
            a_start: alo,
            b_start: blo,
            len: 0,
        };
        // j2len[j] = length of the run ending at a[i-1], b[j]
        let mut j2len: FxHashMap<usize, usize> = FxHashMap::default();
        for i in alo..ahi {
            let mut next: FxHashMap<usize, usize> = FxHashMap::default();
            if let Some(positions) = self.b2j.get(&self.a[i]) {
                for &j in positions {
                    if j < blo {
                        continue;
                    }
                    if j >= bhi {
                        break;
                    }
                    let prev = if j > 0 { j2len.get(&(j - 1)).copied() } else { None };
                    let k = prev.unwrap_or(0) + 1;
                    next.insert(j, k);
                    if k > best.len {
                        best = Run {
                            a_start: i + 1 - k,
                            b_start: j + 1 - k,
                            len: k,
                        };
                    }
                }
            }
            j2len = next;
        }
        best
    }

    /// Total matched length `M`: longest run, then recurse on both remainders.
    fn matched_len(&self) -> usize {
        let mut total = 0;
        let mut pending = vec![(0, self.a.len(), 0, self.b.len())];
        while let Some((alo, ahi, blo, bhi)) = pending.pop() {
            let run = self.longest_run(alo, ahi, blo, bhi);
            if run.len == 0 {
                continue;
            }
            total += run.len;
            if alo < run.a_start && blo < run.b_start {
                pending.push((alo, run.a_start, blo, run.b_start));
            }
            let (a_end, b_end) = (run.a_start + run.len, run.b_start + run.len);
            if a_end < ahi && b_end < bhi {
                pending.push((a_end, ahi, b_end, bhi));
            }
        }
        total
    }
}

// ============================================================================
// Public Scoring Functions
// ============================================================================

/// Gestalt similarity `2M / (len(a) + len(b))` in [0, 1].
/// Two empty strings are identical (1.0).
///
/// The algorithm itself depends on argument order, so inputs are put in a
/// canonical order first; this keeps `ratio(a, b) == ratio(b, a)`.
pub fn ratio(a: &str, b: &str) -> f64 {
    let (a, b) = if a <= b { (a, b) } else { (b, a) };
    let matcher = Matcher::new(a, b);
    let total = matcher.a.len() + matcher.b.len();
    if total == 0 {
        return 1.0;
    }
    2.0 * matcher.matched_len() as f64 / total as f64
}

/// Length of the single longest common contiguous run.
pub fn longest_common_run(a: &str, b: &str) -> usize {
    let matcher = Matcher::new(a, b);
    matcher
        .longest_run(0, matcher.a.len(), 0, matcher.b.len())
        .len
}

// ============================================================================
// Candidate Floors
// ============================================================================

/// Smallest per-field ratio across title, artist and album.
pub fn min_field_ratio(local: &NormalizedFields, remote: &NormalizedFields) -> f64 {
    local
        .pairs(remote)
        .iter()
        .map(|(a, b)| ratio(a, b))
        .fold(f64::INFINITY, f64::min)
}

/// Every field pair shares a run of at least `min(len_a, len_b, min_overlap)` chars.
/// Guards against high ratios produced by very short fields.
pub fn enough_overlap(
    local: &NormalizedFields,
    remote: &NormalizedFields,
    min_overlap: usize,
) -> bool {
    local.pairs(remote).iter().all(|(a, b)| {
        let floor = a.chars().count().min(b.chars().count()).min(min_overlap);
        longest_common_run(a, b) >= floor
    })
}

/// Ratio over the concatenated `title + artist + album` of both sides.
pub fn aggregate_ratio(local: &NormalizedFields, remote: &NormalizedFields) -> f64 {
    ratio(&local.joined(), &remote.joined())
}

// ============================================================================
// Tests
// ============================================================================
