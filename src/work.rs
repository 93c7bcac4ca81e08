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

//! Pool work and its per-chip snapshots
//!
//! Pool work arrives from the surrounding mining layer and is queued per board. Every chip that
//! needs a task takes a snapshot of it: the work reference, the ntime actually sent to the chip
//! and the task blob. Solutions are handed back through [`NonceSink`].

use crate::task::{self, Task};

use bitcoin_hashes::{sha256, sha256d, Hash, HashEngine};
use byteorder::{BigEndian, ByteOrder, LittleEndian};

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

/// Serialized block header size
pub const HEADER_LEN: usize = 80;
/// Part of the header covered by the midstate
const CHUNK1_LEN: usize = 64;

/// Work item received from the pool side
#[derive(Clone, PartialEq)]
pub struct PoolWork {
    pub id: u64,
    /// Version, previous hash and the first 28 bytes of the merkle root
    pub chunk1: [u8; CHUNK1_LEN],
    /// SHA-256 state after the first 64 bytes of the block header
    pub midstate: [u32; 8],
    /// Last four bytes of the merkle root
    pub merkle_tail: u32,
    pub ntime: u32,
    pub nbits: u32,
}

impl PoolWork {
    /// Build work from a serialized block header (the nonce field is ignored)
    pub fn from_header(id: u64, header: &[u8; HEADER_LEN]) -> Self {
        let mut chunk1 = [0u8; CHUNK1_LEN];
        chunk1.copy_from_slice(&header[..CHUNK1_LEN]);

        Self {
            id,
            chunk1,
            midstate: midstate(&chunk1),
            merkle_tail: LittleEndian::read_u32(&header[64..68]),
            ntime: LittleEndian::read_u32(&header[68..72]),
            nbits: LittleEndian::read_u32(&header[72..76]),
        }
    }

    /// Serialized header with given `ntime` and `nonce`
    pub fn header(&self, ntime: u32, nonce: u32) -> [u8; HEADER_LEN] {
        let mut header = [0u8; HEADER_LEN];
        header[..CHUNK1_LEN].copy_from_slice(&self.chunk1);
        LittleEndian::write_u32(&mut header[64..68], self.merkle_tail);
        LittleEndian::write_u32(&mut header[68..72], ntime);
        LittleEndian::write_u32(&mut header[72..76], self.nbits);
        LittleEndian::write_u32(&mut header[76..80], nonce);
        header
    }

    /// Double SHA-256 of the header
    pub fn hash(&self, ntime: u32, nonce: u32) -> sha256d::Hash {
        sha256d::Hash::hash(&self.header(ntime, nonce))
    }

    /// Test whether `nonce` meets the chip target with given `ntime`
    pub fn is_valid_nonce(&self, ntime: u32, nonce: u32) -> bool {
        is_valid_share(&self.hash(ntime, nonce))
    }
}

impl fmt::Debug for PoolWork {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "work#{} ntime={:#x}", self.id, self.ntime)
    }
}

/// SHA-256 state words after the first header chunk
pub fn midstate(chunk1: &[u8; CHUNK1_LEN]) -> [u32; 8] {
    let mut engine = sha256::Hash::engine();
    engine.input(chunk1);
    let bytes = engine.midstate().into_inner();

    let mut state = [0u32; 8];
    BigEndian::read_u32_into(&bytes, &mut state);
    state
}

/// Difficulty 1 check, the highest 32 bits of the hash (read as a little endian number) are zero
pub fn is_valid_share(hash: &sha256d::Hash) -> bool {
    hash.into_inner()[28..].iter().all(|byte| *byte == 0)
}

/// Work as sent to one chip
#[derive(Clone, PartialEq)]
pub struct WorkSnapshot {
    pub work: Arc<PoolWork>,
    /// ntime the task was generated with
    pub ntime: u32,
    pub mask: u32,
    pub task: Task,
}

impl WorkSnapshot {
    pub fn new(work: Arc<PoolWork>, ntime: u32, mask: u32) -> Self {
        let task = task::generate_task(&work.midstate, work.merkle_tail, ntime, work.nbits, mask);
        Self {
            work,
            ntime,
            mask,
            task,
        }
    }

    /// Same work restricted to another nonce region
    pub fn with_mask(&self, mask: u32) -> Self {
        Self::new(self.work.clone(), self.ntime, mask)
    }

    /// Test whether `nonce` solves this snapshot
    pub fn test_nonce(&self, nonce: u32) -> bool {
        self.work.is_valid_nonce(self.ntime, nonce)
    }
}

impl fmt::Debug for WorkSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "work#{} ntime={:#x} mask={:#010x}",
            self.work.id, self.ntime, self.mask
        )
    }
}

/// Receiver of validated solutions
pub trait NonceSink: Send + Sync {
    fn submit(&self, work: &Arc<PoolWork>, nonce: u32, ntime: u32);
}

/// Bounded queue of pool work. Each work item is handed out `roll` times with increasing ntime
/// before it is consumed.
pub struct WorkQueue {
    items: VecDeque<(Arc<PoolWork>, u32)>,
    capacity: usize,
    roll: u32,
    dropped: u64,
}

impl WorkQueue {
    pub fn new(capacity: usize, roll: u32) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            roll: roll.max(1),
            dropped: 0,
        }
    }

    /// Append new work, the oldest item is dropped when the queue is full
    pub fn push(&mut self, work: Arc<PoolWork>) {
        if self.items.len() >= self.capacity {
            self.items.pop_front();
            self.dropped += 1;
        }
        self.items.push_back((work, 0));
    }

    /// Snapshot for the next task, `mask` restricts the nonce range of the chip
    pub fn take(&mut self, mask: u32) -> Option<Arc<WorkSnapshot>> {
        let (work, rolled) = self.items.front_mut()?;
        let snapshot = WorkSnapshot::new(work.clone(), work.ntime.wrapping_add(*rolled), mask);
        *rolled += 1;
        if *rolled >= self.roll {
            self.items.pop_front();
        }
        Some(Arc::new(snapshot))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Work source should refill once the queue drops below half of its capacity
    pub fn needs_work(&self) -> bool {
        self.items.len() < (self.capacity + 1) / 2
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}
