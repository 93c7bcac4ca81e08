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

//! Nonce and error counters for estimating hashrate
//!
//! Note: `valid` counters are in difficulty 1 shares, errors are in error event instances

use crate::bf16::ChipAddress;

use std::time::{Duration, Instant};

/// Work represented by a single difficulty 1 share
const SHARE_HASHES: f64 = 4_294_967_296.0;

/// Per-chip counters
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Chip {
    pub valid: u64,
    /// Nonces matching no work
    pub errors: u64,
    pub checksum_errors: u64,
    pub nonce_checksum_errors: u64,
    pub duplicates: u64,
}

/// Renonce tallies
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Renonce {
    pub queued: u64,
    pub matched: u64,
    /// Went through all stages without a match
    pub unmatched: u64,
    /// Shed because of queue length
    pub shed: u64,
    /// Rejected because the queue was full
    pub overflow: u64,
    /// Dropped by flush or role change
    pub discarded: u64,
}

impl Renonce {
    /// Nonces given up as bad
    pub fn bad(&self) -> u64 {
        self.unmatched + self.shed + self.overflow
    }
}

#[derive(Clone, Debug)]
pub struct HashBoard {
    pub board: usize,
    pub chips_per_concentrator: usize,
    pub chip: Vec<Chip>,
    pub valid: u64,
    pub errors: u64,
    pub renonce: Renonce,
    pub rounds: u64,
    pub transport_errors: u64,
    pub started: Instant,
    pub stopped: Option<Instant>,
}

impl HashBoard {
    pub fn new(board: usize, concentrators: usize, chips_per_concentrator: usize) -> Self {
        Self {
            board,
            chips_per_concentrator,
            chip: vec![Chip::default(); concentrators * chips_per_concentrator],
            valid: 0,
            errors: 0,
            renonce: Renonce::default(),
            rounds: 0,
            transport_errors: 0,
            started: Instant::now(),
            stopped: None,
        }
    }

    /// Create a snapshot of the current state of counters.
    /// This will set stopped time to current timestamp so that the hashrate will not decay
    /// from this moment on.
    pub fn snapshot(&self) -> Self {
        let mut snapshot = self.clone();
        snapshot.stopped = Some(Instant::now());
        snapshot
    }

    pub fn duration(&self) -> Duration {
        self.stopped
            .unwrap_or_else(Instant::now)
            .duration_since(self.started)
    }

    /// Estimated hashrate in hashes per second
    pub fn hashrate(&self) -> f64 {
        let secs = self.duration().as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.valid as f64 * SHARE_HASHES / secs
    }

    /// Counters of chip `addr`, `None` for chips of other boards or out of range addresses
    pub fn chip_mut(&mut self, addr: ChipAddress) -> Option<&mut Chip> {
        if addr.board != self.board || addr.chip as usize >= self.chips_per_concentrator {
            return None;
        }
        self.chip
            .get_mut(addr.concentrator * self.chips_per_concentrator + addr.chip as usize)
    }

    pub fn chip(&self, addr: ChipAddress) -> Option<&Chip> {
        if addr.board != self.board || addr.chip as usize >= self.chips_per_concentrator {
            return None;
        }
        self.chip
            .get(addr.concentrator * self.chips_per_concentrator + addr.chip as usize)
    }

    pub fn add_valid(&mut self, addr: ChipAddress) {
        self.valid += 1;
        if let Some(chip) = self.chip_mut(addr) {
            chip.valid += 1;
        }
    }

    pub fn add_error(&mut self, addr: ChipAddress) {
        self.errors += 1;
        if let Some(chip) = self.chip_mut(addr) {
            chip.errors += 1;
        }
    }

    pub fn chip_count(&self) -> usize {
        self.chip.len()
    }
}
