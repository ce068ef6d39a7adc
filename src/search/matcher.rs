//! Text matching for the search engine: a SIMD-accelerated case-folding
//! substring scan with a byte-exact scalar reference, a glob matcher for
//! `*`/`?` patterns, and the dispatch rules between them.
//!
//! ASCII case folding is the bit-5 toggle on `A..=Z`. Needles shorter than
//! four code units or containing non-ASCII take the scalar path; above
//! U+0080 folding is done per char, not per byte.

/// Needle length below which the vector path is never worth the setup.
pub const SIMD_MIN_NEEDLE: usize = 4;

/// True when `haystack` contains `needle`, folding case unless
/// `case_sensitive`. The public entry point used by the search engine.
pub fn contains(haystack: &str, needle: &str, case_sensitive: bool) -> bool {
    if needle.is_empty() {
        return true;
    }
    if needle.len() < SIMD_MIN_NEEDLE || !needle.is_ascii() {
        return if case_sensitive {
            haystack.contains(needle)
        } else {
            unicode_fold_contains(haystack, needle)
        };
    }
    simd_contains(haystack.as_bytes(), needle.as_bytes(), !case_sensitive)
}

#[inline]
fn fold_byte(b: u8) -> u8 {
    if b.is_ascii_uppercase() {
        b | 0x20
    } else {
        b
    }
}

/// Scalar reference implementation. The vector path below must agree with
/// this on every input; the equivalence suite enforces it.
pub fn scalar_contains(haystack: &[u8], needle: &[u8], fold: bool) -> bool {
    if needle.is_empty() {
        return true;
    }
    if haystack.len() < needle.len() {
        return false;
    }
    let n = needle.len();
    'outer: for start in 0..=haystack.len() - n {
        for (h, nb) in haystack[start..start + n].iter().zip(needle) {
            let (mut a, mut b) = (*h, *nb);
            if fold {
                a = fold_byte(a);
                b = fold_byte(b);
            }
            if a != b {
                continue 'outer;
            }
        }
        return true;
    }
    false
}

/// Case folding for text containing code points above U+0080: fold both
/// sides per char and search the folded haystack.
fn unicode_fold_contains(haystack: &str, needle: &str) -> bool {
    let folded_needle = needle.to_lowercase();
    haystack.to_lowercase().contains(&folded_needle)
}

#[cfg(target_arch = "x86_64")]
pub fn simd_contains(haystack: &[u8], needle: &[u8], fold: bool) -> bool {
    // SSE2 is baseline on x86_64; no runtime detection needed.
    unsafe { sse2::contains(haystack, needle, fold) }
}

#[cfg(not(target_arch = "x86_64"))]
pub fn simd_contains(haystack: &[u8], needle: &[u8], fold: bool) -> bool {
    scalar_contains(haystack, needle, fold)
}

#[cfg(target_arch = "x86_64")]
mod sse2 {
    use super::{fold_byte, scalar_contains};
    use std::arch::x86_64::*;

    #[inline]
    unsafe fn fold16(v: __m128i) -> __m128i {
        // Fold A..=Z by OR-ing bit 5 where the byte is an upper-case letter.
        // Signed compares are safe: ASCII letters stay below 0x80.
        let above = _mm_cmpgt_epi8(v, _mm_set1_epi8(b'A' as i8 - 1));
        let below = _mm_cmplt_epi8(v, _mm_set1_epi8(b'Z' as i8 + 1));
        let is_upper = _mm_and_si128(above, below);
        _mm_or_si128(v, _mm_and_si128(is_upper, _mm_set1_epi8(0x20)))
    }

    /// First/last-byte candidate filter over 16-byte lanes, then a folded
    /// byte-compare to confirm. Same shape as the memchr crate's generic
    /// substring kernel, specialized for the fold.
    #[target_feature(enable = "sse2")]
    pub unsafe fn contains(haystack: &[u8], needle: &[u8], fold: bool) -> bool {
        let k = needle.len();
        if k == 0 {
            return true;
        }
        if haystack.len() < k {
            return false;
        }

        let first = if fold { fold_byte(needle[0]) } else { needle[0] };
        let last = if fold {
            fold_byte(needle[k - 1])
        } else {
            needle[k - 1]
        };
        let first16 = _mm_set1_epi8(first as i8);
        let last16 = _mm_set1_epi8(last as i8);

        let candidates = haystack.len() - k + 1;
        let mut i = 0usize;
        while i + 16 <= candidates {
            let mut head = _mm_loadu_si128(haystack.as_ptr().add(i) as *const __m128i);
            let mut tail =
                _mm_loadu_si128(haystack.as_ptr().add(i + k - 1) as *const __m128i);
            if fold {
                head = fold16(head);
                tail = fold16(tail);
            }
            let eq = _mm_and_si128(
                _mm_cmpeq_epi8(head, first16),
                _mm_cmpeq_epi8(tail, last16),
            );
            let mut mask = _mm_movemask_epi8(eq) as u32;
            while mask != 0 {
                let j = mask.trailing_zeros() as usize;
                if verify(&haystack[i + j..i + j + k], needle, fold) {
                    return true;
                }
                mask &= mask - 1;
            }
            i += 16;
        }

        // Tail candidates that do not fill a lane.
        if i < candidates {
            return scalar_contains(&haystack[i..], needle, fold);
        }
        false
    }

    #[inline]
    fn verify(window: &[u8], needle: &[u8], fold: bool) -> bool {
        window.iter().zip(needle).all(|(h, n)| {
            if fold {
                fold_byte(*h) == fold_byte(*n)
            } else {
                h == n
            }
        })
    }
}

/// True when the query text needs the glob matcher.
pub fn has_wildcards(text: &str) -> bool {
    text.contains('*') || text.contains('?')
}

enum GlobSegment {
    Literal(String),
    AnyRun,
    One,
}

/// Anchored glob pattern: `*` matches any run including empty, `?` exactly
/// one code unit, everything else literally. Case folding happens at
/// construction so matching stays allocation-free for ASCII input.
pub struct GlobPattern {
    segments: Vec<GlobSegment>,
    case_sensitive: bool,
}

impl GlobPattern {
    pub fn new(pattern: &str, case_sensitive: bool) -> Self {
        let mut segments = Vec::new();
        let mut literal = String::new();
        for ch in pattern.chars() {
            match ch {
                '*' => {
                    if !literal.is_empty() {
                        segments.push(GlobSegment::Literal(std::mem::take(&mut literal)));
                    }
                    if !matches!(segments.last(), Some(GlobSegment::AnyRun)) {
                        segments.push(GlobSegment::AnyRun);
                    }
                }
                '?' => {
                    if !literal.is_empty() {
                        segments.push(GlobSegment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(GlobSegment::One);
                }
                _ => {
                    if case_sensitive {
                        literal.push(ch);
                    } else {
                        literal.extend(ch.to_lowercase());
                    }
                }
            }
        }
        if !literal.is_empty() {
            segments.push(GlobSegment::Literal(literal));
        }
        GlobPattern {
            segments,
            case_sensitive,
        }
    }

    pub fn matches(&self, value: &str) -> bool {
        if self.case_sensitive {
            glob_match(&self.segments, value)
        } else if value.is_ascii() {
            // ASCII lowering is byte-wise; stack-free via a small buffer
            // would still copy, so reuse the allocation path only when the
            // value actually holds upper-case letters.
            if value.bytes().any(|b| b.is_ascii_uppercase()) {
                glob_match(&self.segments, &value.to_lowercase())
            } else {
                glob_match(&self.segments, value)
            }
        } else {
            glob_match(&self.segments, &value.to_lowercase())
        }
    }
}

fn glob_match(segments: &[GlobSegment], value: &str) -> bool {
    match segments.split_first() {
        None => value.is_empty(),
        Some((GlobSegment::Literal(lit), rest)) => match value.strip_prefix(lit.as_str()) {
            Some(remaining) => glob_match(rest, remaining),
            None => false,
        },
        Some((GlobSegment::One, rest)) => {
            let mut chars = value.chars();
            match chars.next() {
                Some(_) => glob_match(rest, chars.as_str()),
                None => false,
            }
        }
        Some((GlobSegment::AnyRun, rest)) => {
            if rest.is_empty() {
                return true;
            }
            let mut remaining = value;
            loop {
                if glob_match(rest, remaining) {
                    return true;
                }
                let mut chars = remaining.chars();
                if chars.next().is_none() {
                    return false;
                }
                remaining = chars.as_str();
            }
        }
    }
}
