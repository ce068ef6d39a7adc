//! The vector substring path must be byte-exact with the scalar
//! reference on every input: randomized trials plus the curated case-fold
//! corner set.

use fastfind::search::matcher::{contains, scalar_contains, simd_contains};

struct XorShift(u64);

impl XorShift {
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }
}

#[test]
fn randomized_equivalence_100k() {
    let mut rng = XorShift(0x9e37_79b9_7f4a_7c15);
    // Alphabet deliberately dense around the fold boundary bytes.
    let alphabet: &[u8] = b"aAbBmMzZ@[`{]}09 ._-~\x7f";

    for trial in 0..100_000u32 {
        let hay_len = (rng.next() % 48) as usize;
        let hay: Vec<u8> = (0..hay_len)
            .map(|_| alphabet[(rng.next() % alphabet.len() as u64) as usize])
            .collect();

        let needle_len = 1 + (rng.next() % 10) as usize;
        let needle: Vec<u8> = if rng.next() % 4 == 0 && hay_len >= needle_len {
            let at = (rng.next() as usize) % (hay_len - needle_len + 1);
            hay[at..at + needle_len].to_vec()
        } else {
            (0..needle_len)
                .map(|_| alphabet[(rng.next() % alphabet.len() as u64) as usize])
                .collect()
        };

        for fold in [false, true] {
            let simd = simd_contains(&hay, &needle, fold);
            let scalar = scalar_contains(&hay, &needle, fold);
            assert_eq!(
                simd, scalar,
                "trial {trial}: fold={fold} hay={hay:?} needle={needle:?}"
            );
        }
    }
}

#[test]
fn fold_boundary_bytes_do_not_fold() {
    // '@' (0x40) and '[' (0x5B) bracket A-Z; '`' (0x60) and '{' (0x7B)
    // bracket a-z. None of them participates in the bit-5 toggle.
    assert!(!scalar_contains(b"@@@@@@@@", b"````", true));
    assert!(!simd_contains(b"@@@@@@@@", b"````", true));
    assert!(!scalar_contains(b"[[[[[[[[", b"{{{{", true));
    assert!(!simd_contains(b"[[[[[[[[", b"{{{{", true));
    assert!(simd_contains(b"AAAABBBB", b"aabb", true));
    assert!(!simd_contains(b"AAAABBBB", b"aabb", false));
}

#[test]
fn curated_unicode_case_folds() {
    // Above U+0080 the matcher takes the scalar char-fold path; these are
    // the classic trouble pairs.
    let cases: &[(&str, &str, bool)] = &[
        // Latin-1 supplements
        ("Straße.pdf", "straße", true),
        ("ÜBUNG.txt", "übung", true),
        ("École.doc", "école", true),
        // Cyrillic and Greek
        ("ДОКУМЕНТ.txt", "документ", true),
        ("ΣΥΛΛΟΓΗ.zip", "συλλογη", true),
        // CJK has no case; exact match only
        ("사진모음.zip", "사진모음", true),
        ("写真.jpg", "写真", true),
        // Mismatches stay mismatches
        ("Straße.pdf", "strasse", false),
        ("ДОКУМЕНТ.txt", "документы", false),
    ];
    for &(haystack, needle, expected) in cases {
        assert_eq!(
            contains(haystack, needle, false),
            expected,
            "haystack {haystack:?} needle {needle:?}"
        );
    }
}

#[test]
fn sigma_folding_follows_lowercase_semantics() {
    // A word-final capital sigma lowercases to ς, so a needle typed with
    // the final form matches and one typed with the medial form does not.
    assert!(contains("ΟΔΟΣ.txt", "οδος", false));
    assert!(!contains("ΟΔΟΣ.txt", "οδοσ", false));
    assert!(contains("ΣΥΛΛΟΓΗ", "συλλ", false));
}

#[test]
fn needle_at_buffer_edges() {
    // Positions that land the candidate exactly at the 16-byte lane edge
    // and in the tail remainder.
    for pad in 0..40 {
        let mut hay = "x".repeat(pad);
        hay.push_str("NeedleHere");
        for fold in [false, true] {
            let needle: &[u8] = if fold { b"needlehere" } else { b"NeedleHere" };
            assert!(
                simd_contains(hay.as_bytes(), needle, fold),
                "pad {pad} fold {fold}"
            );
            assert_eq!(
                simd_contains(hay.as_bytes(), needle, fold),
                scalar_contains(hay.as_bytes(), needle, fold)
            );
        }
    }
}

#[test]
fn short_needles_route_to_scalar() {
    // Below four code units the dispatcher never enters the vector path;
    // behavior is still the same contract.
    assert!(contains("a.CS", "cs", false));
    assert!(contains("AbC", "abc", false));
    assert!(!contains("AbC", "abc", true));
}
