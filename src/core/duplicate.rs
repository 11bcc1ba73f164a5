// Near-duplicate detection over perceptual fingerprints.
//
// Greedy single-linkage: walk images in input order, open a group for every
// unclaimed image and pull in each later unclaimed image whose fingerprint is
// within the similarity threshold.
//
// A single greedy pass is not idempotent under chaining: with A~B and B~C but
// not A~C, keeping B drops A while C survives in a group of its own, and a
// second pass over the survivors then removes C. `remove_duplicates` therefore
// repeats the pass over its own output until nothing is removed. Do not cut it
// back to one pass; `test_chaining_is_resolved_by_repeat_pass` and
// `test_group_invariants_and_idempotence` depend on the fixpoint.

use crate::core::models::DuplicateGroup;
use serde::{Deserialize, Serialize};

/// Fixed-length perceptual hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    bytes: Vec<u8>,
}

impl Fingerprint {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn from_u64(value: u64) -> Self {
        Self::new(value.to_be_bytes().to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn bit_len(&self) -> usize {
        self.bytes.len() * 8
    }

    /// Number of differing bits, `None` when the lengths differ.
    pub fn hamming_distance(&self, other: &Fingerprint) -> Option<u32> {
        if self.bytes.len() != other.bytes.len() {
            return None;
        }
        Some(
            self.bytes
                .iter()
                .zip(&other.bytes)
                .map(|(a, b)| (a ^ b).count_ones())
                .sum(),
        )
    }

    /// `1 - hamming / bits`, clamped to `[0, 1]`. Incomparable or empty
    /// fingerprints score 0.
    pub fn similarity(&self, other: &Fingerprint) -> f64 {
        let bits = self.bit_len();
        match self.hamming_distance(other) {
            Some(distance) if bits > 0 => (1.0 - distance as f64 / bits as f64).clamp(0.0, 1.0),
            _ => 0.0,
        }
    }

    pub fn to_hex(&self) -> String {
        self.bytes.iter().map(|b| format!("{b:02x}")).collect()
    }
}

/// One image going into deduplication.
#[derive(Debug, Clone)]
pub struct DedupeEntry<T> {
    pub item: T,
    pub key: String,
    /// Size of the backing file; the largest member represents its group.
    pub byte_size: u64,
    /// `None` when hashing failed; such images are never grouped.
    pub fingerprint: Option<Fingerprint>,
}

#[derive(Debug, Clone)]
pub struct DedupeOutcome<T> {
    pub unique: Vec<T>,
    pub removed: Vec<T>,
    pub groups: Vec<DuplicateGroup>,
    pub passes: usize,
}

pub struct DuplicateDetector {
    pub threshold: f64,
}

impl DuplicateDetector {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    /// Index groups (each with at least two members) from one greedy pass.
    pub fn find_groups<T>(&self, entries: &[DedupeEntry<T>]) -> Vec<Vec<usize>> {
        let mut claimed = vec![false; entries.len()];
        let mut groups = Vec::new();

        for i in 0..entries.len() {
            if claimed[i] {
                continue;
            }
            claimed[i] = true;
            let Some(anchor) = entries[i].fingerprint.as_ref() else {
                continue;
            };

            let mut group = vec![i];
            for j in (i + 1)..entries.len() {
                if claimed[j] {
                    continue;
                }
                let Some(other) = entries[j].fingerprint.as_ref() else {
                    continue;
                };
                if anchor.similarity(other) >= self.threshold {
                    group.push(j);
                    claimed[j] = true;
                }
            }

            if group.len() > 1 {
                groups.push(group);
            }
        }
        groups
    }

    /// Largest backing file wins; ties go to the first encountered.
    fn representative<T>(entries: &[DedupeEntry<T>], group: &[usize]) -> usize {
        let mut best = group[0];
        for &idx in &group[1..] {
            if entries[idx].byte_size > entries[best].byte_size {
                best = idx;
            }
        }
        best
    }

    /// Collapse near-duplicates to one representative each. `unique` keeps
    /// input order; `removed` lists dropped members in the order they fell out.
    pub fn remove_duplicates<T>(&self, entries: Vec<DedupeEntry<T>>) -> DedupeOutcome<T> {
        let mut current = entries;
        let mut removed = Vec::new();
        let mut groups = Vec::new();
        let mut passes = 0;

        loop {
            passes += 1;
            let pass_groups = self.find_groups(&current);
            if pass_groups.is_empty() {
                break;
            }

            let mut dropped = vec![false; current.len()];
            for group in &pass_groups {
                let keep = Self::representative(&current, group);
                for &idx in group {
                    if idx != keep {
                        dropped[idx] = true;
                    }
                }
                log::debug!(
                    "Duplicate group of {}: keeping {}",
                    group.len(),
                    current[keep].key
                );
                groups.push(DuplicateGroup {
                    members: group.iter().map(|&idx| current[idx].key.clone()).collect(),
                    representative: current[keep].key.clone(),
                });
            }

            let mut kept = Vec::with_capacity(current.len());
            for (entry, drop) in current.into_iter().zip(dropped) {
                if drop {
                    removed.push(entry);
                } else {
                    kept.push(entry);
                }
            }
            current = kept;
        }

        log::info!(
            "Removed {} duplicates in {} group(s); {} remaining",
            removed.len(),
            groups.len(),
            current.len()
        );

        DedupeOutcome {
            unique: current.into_iter().map(|e| e.item).collect(),
            removed: removed.into_iter().map(|e| e.item).collect(),
            groups,
            passes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn entry(key: &str, size: u64, fingerprint: Option<u64>) -> DedupeEntry<String> {
        DedupeEntry {
            item: key.to_string(),
            key: key.to_string(),
            byte_size: size,
            fingerprint: fingerprint.map(Fingerprint::from_u64),
        }
    }

    #[test]
    fn test_hamming_similarity() {
        let a = Fingerprint::from_u64(0);
        let b = Fingerprint::from_u64(0b11);
        assert_eq!(a.hamming_distance(&b), Some(2));
        assert!((a.similarity(&b) - 0.96875).abs() < 1e-12);
        assert_eq!(a.similarity(&a), 1.0);
        assert_eq!(a.similarity(&Fingerprint::from_u64(u64::MAX)), 0.0);

        let short = Fingerprint::new(vec![0u8; 4]);
        assert_eq!(a.hamming_distance(&short), None);
        assert_eq!(a.similarity(&short), 0.0);
        assert_eq!(Fingerprint::new(Vec::new()).similarity(&Fingerprint::new(Vec::new())), 0.0);
        assert_eq!(b.to_hex(), "0000000000000003");
    }

    #[test]
    fn test_scenario_keeps_larger_duplicate() {
        let detector = DuplicateDetector::new(0.95);
        let img2 = 0xFFFF_0000_FFFF_0000u64;
        let entries = vec![
            entry("1", 100, Some(0)),
            entry("2", 100, Some(img2)),
            entry("3", 100, Some(0x00FF_00FF_00FF_00FF)),
            entry("4", 500, Some(img2 ^ 0b11)),
            entry("5", 100, Some(0x0F0F_0F0F_0F0F_0F0F)),
        ];

        let outcome = detector.remove_duplicates(entries);
        assert_eq!(outcome.unique, vec!["1", "3", "4", "5"]);
        assert_eq!(outcome.removed, vec!["2"]);
        assert_eq!(outcome.groups.len(), 1);
        assert_eq!(outcome.groups[0].members, vec!["2", "4"]);
        assert_eq!(outcome.groups[0].representative, "4");
    }

    #[test]
    fn test_tie_keeps_first_encountered() {
        let detector = DuplicateDetector::new(0.95);
        let outcome =
            detector.remove_duplicates(vec![entry("a", 10, Some(7)), entry("b", 10, Some(7))]);
        assert_eq!(outcome.unique, vec!["a"]);
        assert_eq!(outcome.groups[0].representative, "a");
    }

    #[test]
    fn test_empty_input() {
        let detector = DuplicateDetector::new(0.95);
        let outcome = detector.remove_duplicates(Vec::<DedupeEntry<String>>::new());
        assert!(outcome.unique.is_empty());
        assert!(outcome.removed.is_empty());
        assert!(outcome.groups.is_empty());
    }

    #[test]
    fn test_missing_fingerprints_stay_unique() {
        let detector = DuplicateDetector::new(0.95);
        let outcome = detector.remove_duplicates(vec![
            entry("a", 10, None),
            entry("b", 10, Some(0)),
            entry("c", 10, None),
            entry("d", 20, Some(0)),
        ]);
        assert_eq!(outcome.unique, vec!["a", "c", "d"]);
        assert_eq!(outcome.removed, vec!["b"]);
    }

    #[test]
    fn test_chaining_is_resolved_by_repeat_pass() {
        // A~B and B~C, but A is too far from C for the first pass.
        let detector = DuplicateDetector::new(0.95);
        let outcome = detector.remove_duplicates(vec![
            entry("A", 10, Some(0)),
            entry("B", 30, Some(0b11)),
            entry("C", 20, Some(0b1111)),
        ]);
        assert_eq!(outcome.unique, vec!["B"]);
        assert_eq!(outcome.removed, vec!["A", "C"]);
        assert_eq!(outcome.groups.len(), 2);
        assert_eq!(outcome.passes, 3);
    }

    #[test]
    fn test_group_invariants_and_idempotence() {
        let detector = DuplicateDetector::new(0.95);
        let fingerprints: [u64; 10] = [
            0,
            0b1,
            0b111,
            0xFF00,
            0xFF01,
            0xFFFF_FFFF,
            0xFFFF_FFFE,
            0xAAAA_AAAA_AAAA_AAAA,
            0xAAAA_AAAA_AAAA_AAAB,
            0x5555_5555_5555_5555,
        ];
        let entries: Vec<_> = fingerprints
            .iter()
            .enumerate()
            .map(|(i, fp)| entry(&format!("img{i}"), (i as u64 * 37) % 11, Some(*fp)))
            .collect();
        let originals: BTreeSet<String> = entries.iter().map(|e| e.key.clone()).collect();
        let by_key: Vec<(String, u64, u64)> = entries
            .iter()
            .map(|e| (e.key.clone(), e.byte_size, fingerprints[e.key[3..].parse::<usize>().unwrap()]))
            .collect();

        let outcome = detector.remove_duplicates(entries);

        for group in &outcome.groups {
            assert!(group.members.len() >= 2);
            assert!(group.members.contains(&group.representative));
        }

        let unique: BTreeSet<String> = outcome.unique.iter().cloned().collect();
        let removed: BTreeSet<String> = outcome.removed.iter().cloned().collect();
        assert!(unique.is_disjoint(&removed));
        let union: BTreeSet<String> = unique.union(&removed).cloned().collect();
        assert_eq!(union, originals);

        let rerun_entries: Vec<_> = outcome
            .unique
            .iter()
            .map(|key| {
                let (_, size, fp) = by_key.iter().find(|(k, _, _)| k == key).unwrap();
                entry(key, *size, Some(*fp))
            })
            .collect();
        let rerun = detector.remove_duplicates(rerun_entries);
        assert_eq!(rerun.unique, outcome.unique);
        assert!(rerun.removed.is_empty());
        assert_eq!(rerun.passes, 1);
    }
}
