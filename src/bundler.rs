//! Bundle assembly.
//!
//! [`Bundler`] is a pure state machine that groups accepted one-block files
//! into fixed-size ranges `[lower, lower + size)`. It performs no IO; the
//! archiver drives it and owns every side effect.
//!
//! A range is complete once a block at or beyond the upper boundary has been
//! accepted and the back-pointer walk from that block reaches the lowest
//! accepted block. Numbers may skip inside a range (a node fork can jump
//! block numbers while ids stay linked); a broken id link aborts completion.

use std::collections::BTreeMap;

use crate::oneblock::OneBlockFile;

/// Rounds `num` down to the nearest bundle boundary.
pub fn bundle_lower_boundary(num: u64, size: u64) -> u64 {
    num - (num % size)
}

#[derive(Debug)]
pub struct Bundler {
    size: u64,
    current_lower: u64,
    lib_floor: u64,
    /// Ordered by `(num, id)`; same-num forks coexist until commit.
    accepted: BTreeMap<(u64, String), OneBlockFile>,
}

impl Bundler {
    /// `inclusive_lower` must sit on a bundle boundary; use
    /// [`bundle_lower_boundary`] to derive it from the first block number.
    pub fn new(size: u64, inclusive_lower: u64) -> Self {
        debug_assert!(size > 0);
        debug_assert_eq!(inclusive_lower % size, 0);
        Bundler {
            size,
            current_lower: inclusive_lower,
            lib_floor: 0,
            accepted: BTreeMap::new(),
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn current_lower(&self) -> u64 {
        self.current_lower
    }

    pub fn lib_floor(&self) -> u64 {
        self.lib_floor
    }

    pub fn is_empty(&self) -> bool {
        self.accepted.is_empty()
    }

    pub fn accepted_len(&self) -> usize {
        self.accepted.len()
    }

    pub fn contains(&self, num: u64, id: &str) -> bool {
        self.accepted.contains_key(&(num, id.to_owned()))
    }

    /// Inserts `file` into the accepted set. Returns `false` when the same
    /// `(num, id)` was already accepted.
    pub fn add(&mut self, file: OneBlockFile) -> bool {
        let key = (file.num, file.id.clone());
        if self.accepted.contains_key(&key) {
            return false;
        }
        self.accepted.insert(key, file);
        let tip_lib = self.longest_chain_last_block().map(|tip| tip.lib_num);
        if let Some(lib) = tip_lib {
            self.lib_floor = self.lib_floor.max(lib);
        }
        true
    }

    /// Returns the completed range `(lower, files)` when the current bundle
    /// is finished, without mutating state. `files` are the chain blocks
    /// numbered inside `[lower, lower + size)`, ascending.
    pub fn bundle_complete(&self) -> Option<(u64, Vec<OneBlockFile>)> {
        let upper = self.current_lower + self.size;
        let boundary = self
            .accepted
            .range((upper, String::new())..)
            .map(|(_, file)| file)
            .next()?;
        self.connected_prefix(boundary, upper)
            .map(|files| (self.current_lower, files))
    }

    /// Whether accepting `candidate` would complete the current bundle. Used
    /// by the archiver to decide if a live-tip block should still be routed
    /// through the mergeable lane to land an in-progress bundle whole.
    pub fn completes_with(&self, candidate: &OneBlockFile) -> bool {
        if self.bundle_complete().is_some() {
            return true;
        }
        let upper = self.current_lower + self.size;
        if candidate.num < upper {
            return false;
        }
        self.connected_prefix(candidate, upper).is_some()
    }

    /// The last block of the longest id-connected chain in the accepted set.
    pub fn longest_chain_last_block(&self) -> Option<&OneBlockFile> {
        let mut best: Option<(&OneBlockFile, usize)> = None;
        for file in self.accepted.values() {
            let len = self.chain_len(file);
            let better = match best {
                None => true,
                Some((best_file, best_len)) => {
                    len > best_len || (len == best_len && file.num >= best_file.num)
                }
            };
            if better {
                best = Some((file, len));
            }
        }
        best.map(|(file, _)| file)
    }

    /// Advances past the bundle at `lower` and drains every accepted entry
    /// below the new lower boundary, orphan forks included. Returns the
    /// drained files so the caller can remove them from the mergeable lane.
    pub fn commit(&mut self, lower: u64) -> Vec<OneBlockFile> {
        let upper = lower + self.size;
        let retained = self.accepted.split_off(&(upper, String::new()));
        let drained = std::mem::replace(&mut self.accepted, retained);
        self.current_lower = upper;
        drained.into_values().collect()
    }

    /// Walks back-pointers from `boundary` and returns the chain blocks in
    /// `[current_lower, upper)`, ascending, when the walk reaches the lowest
    /// accepted block. A dangling id link means a gap: returns `None`.
    fn connected_prefix(&self, boundary: &OneBlockFile, upper: u64) -> Option<Vec<OneBlockFile>> {
        let lowest_num = self.accepted.keys().next().map(|(num, _)| *num)?;
        if lowest_num >= upper {
            // The whole range is a hole between committed history and the
            // accepted set; emit it empty so the bundle sequence stays
            // contiguous.
            return Some(Vec::new());
        }

        let mut chain = Vec::new();
        let mut previous_id = boundary.previous_id.as_str();
        let mut steps = 0usize;
        loop {
            let Some(parent) = self.find_by_id(previous_id) else {
                return None;
            };
            if parent.num < self.current_lower {
                break;
            }
            if parent.num < upper {
                chain.push(parent.clone());
            }
            if parent.num == lowest_num {
                break;
            }
            previous_id = parent.previous_id.as_str();

            steps += 1;
            if steps > self.accepted.len() {
                return None;
            }
        }

        chain.reverse();
        Some(chain)
    }

    fn find_by_id(&self, id: &str) -> Option<&OneBlockFile> {
        self.accepted.values().find(|file| file.id == id)
    }

    fn chain_len(&self, tip: &OneBlockFile) -> usize {
        let mut len = 1;
        let mut previous_id = tip.previous_id.as_str();
        while let Some(parent) = self.find_by_id(previous_id) {
            len += 1;
            previous_id = parent.previous_id.as_str();
            if len > self.accepted.len() {
                break;
            }
        }
        len
    }
}
