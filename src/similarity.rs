//! Signature math for dedupe: character trigrams, minhash sketches,
//! perceptual-hash Hamming distance, and embedding cosine similarity.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeSet;
use std::hash::Hasher;

pub const MINHASH_LANES: usize = 64;

/// Lowercase, strip punctuation, collapse whitespace. Keeps Cyrillic intact.
pub fn normalize_text(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_space = true;
    for ch in s.chars() {
        if ch.is_alphanumeric() {
            for lower in ch.to_lowercase() {
                out.push(lower);
            }
            last_space = false;
        } else if !last_space {
            out.push(' ');
            last_space = true;
        }
    }
    while out.ends_with(' ') {
        out.pop();
    }
    out
}

/// Character trigrams of the normalized text. Internal spaces become `_` so
/// tokens survive whitespace-joined storage.
pub fn trigrams(s: &str) -> BTreeSet<String> {
    let norm = normalize_text(s);
    let chars: Vec<char> = norm.chars().collect();
    let mut set = BTreeSet::new();
    if chars.len() < 3 {
        if !norm.is_empty() {
            set.insert(norm.replace(' ', "_"));
        }
        return set;
    }
    for window in chars.windows(3) {
        let token: String = window
            .iter()
            .map(|&c| if c == ' ' { '_' } else { c })
            .collect();
        set.insert(token);
    }
    set
}

pub fn trigram_string(set: &BTreeSet<String>) -> String {
    set.iter().cloned().collect::<Vec<_>>().join(" ")
}

pub fn trigram_set_from_string(s: &str) -> BTreeSet<String> {
    s.split_whitespace().map(|t| t.to_string()).collect()
}

pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let inter = a.intersection(b).count();
    let union = a.len() + b.len() - inter;
    if union == 0 {
        return 0.0;
    }
    inter as f64 / union as f64
}

fn seeded_hash(seed: u64, data: &[u8]) -> u64 {
    let mut h = DefaultHasher::new();
    h.write_u64(seed);
    h.write(data);
    h.finish()
}

/// 64-lane minhash over word 3-shingles of the description.
pub fn minhash(text: &str) -> Option<Vec<u8>> {
    let norm = normalize_text(text);
    let words: Vec<&str> = norm.split(' ').filter(|w| !w.is_empty()).collect();
    if words.len() < 3 {
        return None;
    }
    let shingles: Vec<String> = words.windows(3).map(|w| w.join(" ")).collect();

    let mut lanes = [u64::MAX; MINHASH_LANES];
    for shingle in &shingles {
        for (i, lane) in lanes.iter_mut().enumerate() {
            let h = seeded_hash(i as u64, shingle.as_bytes());
            if h < *lane {
                *lane = h;
            }
        }
    }
    let mut out = Vec::with_capacity(MINHASH_LANES * 8);
    for lane in lanes {
        out.extend_from_slice(&lane.to_le_bytes());
    }
    Some(out)
}

/// Fraction of matching minhash lanes; an estimate of shingle Jaccard.
pub fn minhash_similarity(a: &[u8], b: &[u8]) -> f64 {
    if a.len() != b.len() || a.is_empty() || a.len() % 8 != 0 {
        return 0.0;
    }
    let lanes = a.len() / 8;
    let mut equal = 0usize;
    for i in 0..lanes {
        if a[i * 8..(i + 1) * 8] == b[i * 8..(i + 1) * 8] {
            equal += 1;
        }
    }
    equal as f64 / lanes as f64
}

pub fn hamming64(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

pub fn embedding_to_bytes(v: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(v.len() * 4);
    for x in v {
        out.extend_from_slice(&x.to_le_bytes());
    }
    out
}

pub fn bytes_to_embedding(b: &[u8]) -> Vec<f32> {
    b.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

pub fn cosine(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut na = 0.0f64;
    let mut nb = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += (*x as f64) * (*y as f64);
        na += (*x as f64) * (*x as f64);
        nb += (*y as f64) * (*y as f64);
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_noise() {
        assert_eq!(normalize_text("  BMW   X5, 3.0d!  "), "bmw x5 3 0d");
        assert_eq!(normalize_text("Продавам АУДИ"), "продавам ауди");
    }

    #[test]
    fn identical_titles_have_full_similarity() {
        let a = trigrams("BMW X5 3.0d xDrive");
        let b = trigrams("bmw x5 3.0d xdrive");
        assert!((jaccard(&a, &b) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn different_titles_score_low() {
        let a = trigrams("BMW X5 3.0d");
        let b = trigrams("Opel Corsa 1.2");
        assert!(jaccard(&a, &b) < 0.2);
    }

    #[test]
    fn trigram_string_round_trips() {
        let set = trigrams("vw golf 5");
        let s = trigram_string(&set);
        assert_eq!(trigram_set_from_string(&s), set);
    }

    #[test]
    fn minhash_close_for_near_duplicate_text() {
        let a = minhash("Продавам BMW X5 3.0 дизел, обслужен, нови гуми, перфектно състояние")
            .unwrap();
        let b = minhash("Продавам BMW X5 3.0 дизел, обслужен, нови гуми, отлично състояние")
            .unwrap();
        let c = minhash("Opel Corsa на части, двигател за ремонт, спешно").unwrap();
        assert!(minhash_similarity(&a, &b) > minhash_similarity(&a, &c));
        assert!((minhash_similarity(&a, &a) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn hamming_and_cosine_basics() {
        assert_eq!(hamming64(0b1010, 0b1010), 0);
        assert_eq!(hamming64(u64::MAX, 0), 64);
        let v = vec![0.5f32, 0.5, 0.0];
        let w = vec![0.5f32, 0.5, 0.0];
        assert!((cosine(&v, &w) - 1.0).abs() < 1e-9);
        let bytes = embedding_to_bytes(&v);
        assert_eq!(bytes_to_embedding(&bytes), v);
    }
}
