//! Identity and distance: the deterministic part of mirror selection.
//!
//! This module contains the building blocks used to decide which mirrors
//! should hold a given core:
//!
//! - **Identity**: [`Key`], the 32-byte identifier shared by cores, autobases
//!   and mirror peers, plus the [`Keyed`] trait for anything carrying one.
//! - **Distance Metrics**: [`xor_distance`] and [`distance_cmp`] for
//!   Kademlia-style proximity.
//! - **Selection**: [`closest`] and [`closest_one`], which pick the nearest
//!   candidates to a target without sorting the whole candidate list.

use std::cmp::Ordering;

// ============================================================================
// Type Aliases
// ============================================================================

/// A 256-bit identifier for cores, autobases and mirror peers.
///
/// Cores and autobases are identified by their public key, mirrors by the
/// public key they listen on. All three live in the same XOR space so a core
/// can be mapped onto the mirrors closest to it.
pub type Key = [u8; 32];

/// Anything that can be placed in XOR space.
pub trait Keyed {
    /// The identifier used for distance computations.
    fn key(&self) -> &Key;
}

impl Keyed for Key {
    fn key(&self) -> &Key {
        self
    }
}

/// Short hex rendering used in log fields.
pub(crate) fn short_hex(key: &Key) -> String {
    hex::encode(&key[..8])
}

// ============================================================================
// Distance Metrics
// ============================================================================

/// Compute the XOR distance between two identifiers.
///
/// # Properties
/// - `xor_distance(a, a) == [0; 32]` (reflexive)
/// - `xor_distance(a, b) == xor_distance(b, a)` (symmetric)
/// - The result is used with [`distance_cmp`] to order candidates by proximity.
pub fn xor_distance(a: &Key, b: &Key) -> [u8; 32] {
    let mut out = [0u8; 32];
    for i in 0..32 {
        out[i] = a[i] ^ b[i];
    }
    out
}

/// Compare two XOR distances lexicographically.
///
/// Returns `Ordering::Less` if `a` represents a smaller distance,
/// `Ordering::Greater` if larger, or `Ordering::Equal` if identical.
pub fn distance_cmp(a: &[u8; 32], b: &[u8; 32]) -> Ordering {
    for i in 0..32 {
        if a[i] < b[i] {
            return Ordering::Less;
        } else if a[i] > b[i] {
            return Ordering::Greater;
        }
    }
    Ordering::Equal
}

// ============================================================================
// Closest-Set Selection
// ============================================================================

/// Return the candidate closest to `target`, or `None` for an empty list.
///
/// Single linear scan; on equal distance the earliest candidate wins.
pub fn closest_one<'a, C: Keyed>(target: &Key, candidates: &'a [C]) -> Option<&'a C> {
    let mut best: Option<(&'a C, [u8; 32])> = None;
    for candidate in candidates {
        let dist = xor_distance(candidate.key(), target);
        match &best {
            Some((_, current)) if distance_cmp(&dist, current) != Ordering::Less => {}
            _ => best = Some((candidate, dist)),
        }
    }
    best.map(|(candidate, _)| candidate)
}

/// Return up to `n` candidates ordered by ascending XOR distance to `target`.
///
/// `n` is clamped to the candidate count. For `n == 1` this is
/// [`closest_one`]; otherwise a partial selection sort runs `n` passes over
/// the remaining candidates, which beats a full sort for the small `n`
/// (1-3) used when picking mirrors. Equal distances keep the original
/// candidate order.
pub fn closest<'a, C: Keyed>(target: &Key, candidates: &'a [C], n: usize) -> Vec<&'a C> {
    let n = n.min(candidates.len());
    if n == 0 {
        return Vec::new();
    }
    if n == 1 {
        return closest_one(target, candidates).into_iter().collect();
    }

    // (original index, distance) pairs, sorted in place for the first n slots.
    let mut ranked: Vec<(usize, [u8; 32])> = candidates
        .iter()
        .enumerate()
        .map(|(idx, c)| (idx, xor_distance(c.key(), target)))
        .collect();

    for i in 0..n {
        let mut min = i;
        for j in (i + 1)..ranked.len() {
            let ord = distance_cmp(&ranked[j].1, &ranked[min].1)
                .then_with(|| ranked[j].0.cmp(&ranked[min].0));
            if ord == Ordering::Less {
                min = j;
            }
        }
        ranked.swap(i, min);
    }

    ranked[..n].iter().map(|(idx, _)| &candidates[*idx]).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(first: u8) -> Key {
        let mut k = [0u8; 32];
        k[0] = first;
        k
    }

    #[test]
    fn xor_distance_produces_expected_value() {
        let mut a = [0u8; 32];
        a[0] = 0b1010_1010;
        let mut b = [0u8; 32];
        b[0] = 0b0101_0101;

        let dist = xor_distance(&a, &b);
        assert_eq!(dist[0], 0b1111_1111);
        assert!(dist.iter().skip(1).all(|byte| *byte == 0));
        assert_eq!(xor_distance(&a, &b), xor_distance(&b, &a));
        assert_eq!(xor_distance(&a, &a), [0u8; 32]);
    }

    #[test]
    fn distance_cmp_orders_lexicographically() {
        let mut smaller = [0u8; 32];
        smaller[1] = 1;
        let mut larger = [0u8; 32];
        larger[1] = 2;

        assert_eq!(distance_cmp(&smaller, &larger), Ordering::Less);
        assert_eq!(distance_cmp(&larger, &smaller), Ordering::Greater);
        assert_eq!(distance_cmp(&smaller, &smaller), Ordering::Equal);
    }

    #[test]
    fn closest_one_prefers_earliest_on_ties() {
        let candidates = [key(0x20), key(0x10), key(0x10)];
        let target = key(0x11);
        let picked = closest_one(&target, &candidates).expect("non-empty");
        assert!(std::ptr::eq(picked, &candidates[1]));
    }

    #[test]
    fn closest_orders_by_distance() {
        let candidates = [key(0x10), key(0x20), key(0x08)];
        let target = key(0x18);
        let ids: Vec<u8> = closest(&target, &candidates, 3)
            .into_iter()
            .map(|k| k[0])
            .collect();
        assert_eq!(ids, vec![0x10, 0x08, 0x20]);
    }

    #[test]
    fn closest_clamps_and_handles_empty() {
        let empty: [Key; 0] = [];
        assert!(closest(&key(1), &empty, 3).is_empty());
        assert!(closest_one(&key(1), &empty).is_none());

        let candidates = [key(0x01), key(0x02)];
        assert_eq!(closest(&key(0), &candidates, 10).len(), 2);
        assert!(closest(&key(0), &candidates, 0).is_empty());
    }

    #[test]
    fn closest_matches_full_sort() {
        // Deterministic pseudo-random keys.
        let mut seed = 0x9e37_79b9u32;
        let mut candidates = Vec::new();
        for _ in 0..40 {
            let mut k = [0u8; 32];
            for byte in k.iter_mut() {
                seed ^= seed << 13;
                seed ^= seed >> 17;
                seed ^= seed << 5;
                *byte = seed as u8;
            }
            candidates.push(k);
        }
        let target = candidates[7];

        let mut sorted = candidates.clone();
        sorted.sort_by(|a, b| distance_cmp(&xor_distance(a, &target), &xor_distance(b, &target)));

        for n in 1..6 {
            let picked: Vec<Key> = closest(&target, &candidates, n).into_iter().copied().collect();
            assert_eq!(picked, sorted[..n].to_vec(), "n = {n}");
        }
    }
}
