// Copyright (C) 2019  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

//! Raw nonce handling: picking new results out of the chip nonce block and filtering repeats

use crate::bf16::{self, ChipAddress, NONCES_PER_READ};
use crate::renonce::RenonceId;
use crate::work::WorkSnapshot;

use std::collections::VecDeque;
use std::sync::Arc;

/// Nonces remembered for an ordinary chip
pub const RECENT_NONCES: usize = 7;
/// Nonces remembered for the renonce chip
pub const RECENT_RENONCE_NONCES: usize = 40;

/// The chip keeps its results in a ring of slots. A slot holds a new result when it differs from
/// the value read in the previous round; empty slots never count.
pub fn dedupe_round(
    curr: &[u32; NONCES_PER_READ],
    prev: &[u32; NONCES_PER_READ],
) -> Vec<u32> {
    let mut found: Vec<u32> = Vec::with_capacity(NONCES_PER_READ);
    for (nonce, old) in curr.iter().zip(prev.iter()) {
        if nonce == old || bf16::is_sentinel(*nonce) {
            continue;
        }
        if !found.contains(nonce) {
            found.push(*nonce);
        }
    }
    found
}

/// Bounded memory of most recently seen nonces of one chip
#[derive(Debug, Clone)]
pub struct NonceRing {
    nonces: VecDeque<u32>,
    capacity: usize,
}

impl NonceRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            nonces: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn contains(&self, nonce: u32) -> bool {
        self.nonces.contains(&nonce)
    }

    /// Remember `nonce`, returns false when it has been seen recently
    pub fn insert(&mut self, nonce: u32) -> bool {
        if self.contains(nonce) {
            return false;
        }
        if self.nonces.len() >= self.capacity {
            self.nonces.pop_front();
        }
        self.nonces.push_back(nonce);
        true
    }

    /// Change capacity, the oldest entries are forgotten when shrinking
    pub fn resize(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        while self.nonces.len() > self.capacity {
            self.nonces.pop_front();
        }
    }

    pub fn clear(&mut self) {
        self.nonces.clear();
    }
}

/// Renonce tasks a nonce read of the renonce chip may belong to
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RenonceTag {
    pub current: Option<RenonceId>,
    pub previous: Option<RenonceId>,
    /// Record whose task the chip has finished with this read
    pub completed: Option<RenonceId>,
}

/// One nonce read of a chip together with the work it may belong to
#[derive(Debug, Clone)]
pub struct NonceBatch {
    pub chip: ChipAddress,
    pub nonces: [u32; NONCES_PER_READ],
    pub current: Option<Arc<WorkSnapshot>>,
    pub previous: Option<Arc<WorkSnapshot>>,
    pub renonce: Option<RenonceTag>,
}

impl NonceBatch {
    /// Snapshot solved by `nonce`
    pub fn find_work(&self, nonce: u32) -> Option<&Arc<WorkSnapshot>> {
        self.current
            .iter()
            .chain(self.previous.iter())
            .find(|work| work.test_nonce(nonce))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bf16::NONCE_SENTINEL;
    use crate::test_utils::{test_work, TEST_BLOCKS};

    const EMPTY: [u32; NONCES_PER_READ] = [NONCE_SENTINEL; NONCES_PER_READ];

    #[test]
    fn test_dedupe_sentinels() {
        assert!(dedupe_round(&EMPTY, &EMPTY).is_empty());

        let mut curr = EMPTY;
        curr[4] = 0x1234_5678;
        assert_eq!(dedupe_round(&curr, &EMPTY), vec![0x1234_5678]);

        // a slot reverting to the sentinel is only a difference marker
        assert!(dedupe_round(&EMPTY, &curr).is_empty());
        let mut high = EMPTY;
        high[0] = 0xffff_ffff;
        assert!(dedupe_round(&high, &EMPTY).is_empty());
    }

    #[test]
    fn test_dedupe_identical_rounds() {
        let round = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12];
        assert!(dedupe_round(&round, &round).is_empty());

        let prev = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12];
        let curr = [1, 20, 3, 20, 5, 21, 7, 8, 9, 10, 11, 20];
        let first = dedupe_round(&curr, &prev);
        assert_eq!(first, vec![20, 21]);
        assert_eq!(dedupe_round(&curr, &prev), first);
    }

    #[test]
    fn test_nonce_ring() {
        let mut ring = NonceRing::new(3);
        assert!(ring.insert(1));
        assert!(!ring.insert(1));
        assert!(ring.insert(2));
        assert!(ring.insert(3));
        assert!(ring.insert(4));
        assert!(!ring.contains(1), "oldest nonce must be forgotten");
        assert!(ring.contains(4));

        ring.resize(RECENT_RENONCE_NONCES);
        assert_eq!(ring.capacity(), RECENT_RENONCE_NONCES);
        assert!(ring.contains(2));
        ring.resize(1);
        assert!(ring.contains(4));
        assert!(!ring.contains(3));
        ring.clear();
        assert!(ring.insert(4));
    }

    #[test]
    fn test_batch_find_work() {
        let block = &TEST_BLOCKS[0];
        let work = test_work(0, 1);
        let current = Arc::new(WorkSnapshot::new(work.clone(), work.ntime + 1, 0));
        let previous = Arc::new(WorkSnapshot::new(work.clone(), work.ntime, 0));
        let batch = NonceBatch {
            chip: ChipAddress::new(0, 0, 0),
            nonces: EMPTY,
            current: Some(current),
            previous: Some(previous.clone()),
            renonce: None,
        };
        assert_eq!(batch.find_work(block.nonce), Some(&previous));
        assert_eq!(batch.find_work(block.nonce ^ 0x10), None);
    }
}
