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

//! Renonce: second opinion on uncertain nonces
//!
//! Due to a race in the nonce capture logic a chip sometimes reports a nonce with a damaged upper
//! part. Such nonces are recognizable by their `0xAAA` prefix. The low bits are still usable, so
//! the work is re-sent to a dedicated renonce chip with the nonce range narrowed to those bits.
//! The search alternates between the current and the previous work of the source chip over four
//! stages with a growing number of fixed bits.

use crate::bf16::ChipAddress;
use crate::error;
use crate::task;
use crate::work::WorkSnapshot;

use std::collections::VecDeque;
use std::sync::Arc;

pub type RenonceId = u32;

/// Number of stages before a record is given up
pub const RENONCE_STAGES: u8 = 4;
/// Maximum number of pending records
pub const RENONCE_QUEUE_LEN: usize = 100;
/// Queue length above which records reaching stage 2 are dropped
pub const RENONCE_STAGE2_LIMIT: usize = 80;
/// Queue length above which records reaching stage 3 are dropped
pub const RENONCE_STAGE3_LIMIT: usize = 60;
/// Default number of fixed nonce bits per stage
pub const DEFAULT_STAGE_BITS: [u8; RENONCE_STAGES as usize] = [16, 16, 20, 20];

const UNCERTAIN_MASK: u32 = 0xfff0_0000;
const UNCERTAIN_SIGNATURE: u32 = 0xaaa0_0000;

/// Nonce flagged by the chip as possibly damaged
pub fn is_uncertain(nonce: u32) -> bool {
    nonce & UNCERTAIN_MASK == UNCERTAIN_SIGNATURE
}

#[derive(Debug, Clone)]
pub struct RenonceRecord {
    pub id: RenonceId,
    pub nonce: u32,
    /// Chip that reported the uncertain nonce
    pub src: ChipAddress,
    /// Chip doing the verification
    pub chip: ChipAddress,
    pub current: Option<Arc<WorkSnapshot>>,
    pub previous: Option<Arc<WorkSnapshot>>,
    /// `RENONCE_STAGES` means finished
    pub stage: u8,
    pub sent: bool,
    pub received: bool,
    pub matched: bool,
}

impl RenonceRecord {
    pub fn is_finished(&self) -> bool {
        self.stage >= RENONCE_STAGES
    }

    /// Even stages search the current work, odd stages the previous one
    pub fn stage_work(&self) -> Option<&Arc<WorkSnapshot>> {
        if self.stage % 2 == 0 {
            self.current.as_ref()
        } else {
            self.previous.as_ref()
        }
    }

    /// Work for the renonce chip narrowed to the nonce region of this stage
    pub fn stage_snapshot(
        &self,
        bits: &[u8; RENONCE_STAGES as usize],
    ) -> error::Result<Option<WorkSnapshot>> {
        if self.is_finished() {
            return Ok(None);
        }
        let mask = task::generate_nonce_mask(self.nonce, bits[self.stage as usize])?;
        Ok(self.stage_work().map(|work| work.with_mask(mask)))
    }
}

/// Result of one pass of [`RenonceQueue::advance`]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AdvanceReport {
    pub advanced: usize,
    /// Records that went through all stages unmatched
    pub finished: usize,
    /// Records shed because of queue length
    pub shed: usize,
}

impl AdvanceReport {
    pub fn dropped(&self) -> usize {
        self.finished + self.shed
    }
}

pub struct RenonceQueue {
    records: VecDeque<RenonceRecord>,
    next_id: RenonceId,
    capacity: usize,
}

impl RenonceQueue {
    pub fn new() -> Self {
        Self::with_capacity(RENONCE_QUEUE_LEN)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: VecDeque::new(),
            next_id: 0,
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Queue an uncertain nonce for verification. Returns `None` when the queue is full.
    pub fn push(
        &mut self,
        nonce: u32,
        src: ChipAddress,
        chip: ChipAddress,
        current: Option<Arc<WorkSnapshot>>,
        previous: Option<Arc<WorkSnapshot>>,
    ) -> Option<RenonceId> {
        if self.records.len() >= self.capacity {
            return None;
        }
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.records.push_back(RenonceRecord {
            id,
            nonce,
            src,
            chip,
            current,
            previous,
            stage: 0,
            sent: false,
            received: false,
            matched: false,
        });
        Some(id)
    }

    pub fn get(&self, id: RenonceId) -> Option<&RenonceRecord> {
        self.records.iter().find(|record| record.id == id)
    }

    fn get_mut(&mut self, id: RenonceId) -> Option<&mut RenonceRecord> {
        self.records.iter_mut().find(|record| record.id == id)
    }

    /// Oldest record waiting to be sent to the renonce chip
    pub fn next_unsent(&self) -> Option<&RenonceRecord> {
        self.records
            .iter()
            .find(|record| !record.sent && !record.is_finished() && record.stage_work().is_some())
    }

    pub fn mark_sent(&mut self, id: RenonceId) {
        if let Some(record) = self.get_mut(id) {
            record.sent = true;
        }
    }

    /// Task of record `id` never got to work on the renonce chip, send it again
    pub fn mark_unsent(&mut self, id: RenonceId) {
        if let Some(record) = self.get_mut(id) {
            if !record.received {
                record.sent = false;
            }
        }
    }

    /// The renonce chip has finished the task of record `id`
    pub fn mark_received(&mut self, id: RenonceId) {
        if let Some(record) = self.get_mut(id) {
            if record.sent {
                record.received = true;
            }
        }
    }

    /// Remove a record that has been verified
    pub fn take_matched(&mut self, id: RenonceId) -> Option<RenonceRecord> {
        let index = self.records.iter().position(|record| record.id == id)?;
        let mut record = self.records.remove(index)?;
        record.matched = true;
        Some(record)
    }

    /// Move finished stages forward and shed records that cannot be verified in time
    pub fn advance(&mut self) -> AdvanceReport {
        let mut report = AdvanceReport::default();
        let mut index = 0;
        while index < self.records.len() {
            let len = self.records.len();
            let record = &mut self.records[index];
            let stage_done = record.received || (!record.sent && record.stage_work().is_none());
            if record.matched || !stage_done {
                index += 1;
                continue;
            }

            record.stage += 1;
            record.sent = false;
            record.received = false;
            let drop = if record.is_finished() {
                report.finished += 1;
                true
            } else if (record.stage == 2 && len > RENONCE_STAGE2_LIMIT)
                || (record.stage == 3 && len > RENONCE_STAGE3_LIMIT)
            {
                report.shed += 1;
                true
            } else {
                report.advanced += 1;
                false
            };

            if drop {
                self.records.remove(index);
            } else {
                index += 1;
            }
        }
        report
    }

    /// Point all records to another renonce chip, tasks in flight are sent again
    pub fn reassign(&mut self, chip: ChipAddress) {
        for record in self.records.iter_mut() {
            record.chip = chip;
            if record.sent && !record.received {
                record.sent = false;
            }
        }
    }

    /// Drop all records, returns how many were pending
    pub fn clear(&mut self) -> usize {
        let count = self.records.len();
        self.records.clear();
        count
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_utils::{test_work, TEST_BLOCKS};

    fn addr(chip: u8) -> ChipAddress {
        ChipAddress::new(0, 0, chip)
    }

    fn snapshot(ntime_offset: u32) -> Arc<WorkSnapshot> {
        let work = test_work(0, 1);
        Arc::new(WorkSnapshot::new(work.clone(), work.ntime + ntime_offset, 0))
    }

    fn push(queue: &mut RenonceQueue) -> RenonceId {
        queue
            .push(0xaaa7_0100, addr(1), addr(0), Some(snapshot(0)), Some(snapshot(1)))
            .expect("queue full")
    }

    /// Simulate the renonce chip finishing the task of the next record without a match
    fn run_stage(queue: &mut RenonceQueue) -> Option<RenonceId> {
        let id = queue.next_unsent()?.id;
        queue.mark_sent(id);
        queue.mark_received(id);
        Some(id)
    }

    #[test]
    fn test_uncertain_signature() {
        assert!(is_uncertain(0xaaa7_0100));
        assert!(is_uncertain(0xaaaf_ffff));
        assert!(!is_uncertain(0xa287_0100));
        assert!(!is_uncertain(0xaab0_0000));
    }

    #[test]
    fn test_stage_work_alternates() {
        let mut queue = RenonceQueue::new();
        let id = push(&mut queue);
        let record = queue.get(id).expect("record").clone();
        let block = &TEST_BLOCKS[0];

        let snap = record
            .stage_snapshot(&DEFAULT_STAGE_BITS)
            .expect("mask")
            .expect("stage 0 work");
        assert_eq!(snap.ntime, record.current.as_ref().expect("current").ntime);
        assert_eq!(task::mask_bits(snap.mask), 16);
        assert!(task::mask_covers(snap.mask, block.nonce));

        let mut odd = record.clone();
        odd.stage = 3;
        let snap = odd
            .stage_snapshot(&DEFAULT_STAGE_BITS)
            .expect("mask")
            .expect("stage 3 work");
        assert_eq!(snap.ntime, record.previous.as_ref().expect("previous").ntime);
        assert_eq!(task::mask_bits(snap.mask), 20);
        assert!(task::mask_covers(snap.mask, block.nonce));

        odd.stage = RENONCE_STAGES;
        assert!(odd.stage_snapshot(&DEFAULT_STAGE_BITS).expect("mask").is_none());
    }

    #[test]
    fn test_capacity() {
        let mut queue = RenonceQueue::with_capacity(2);
        push(&mut queue);
        push(&mut queue);
        assert!(queue
            .push(0xaaa0_0001, addr(1), addr(0), None, None)
            .is_none());
        assert_eq!(queue.len(), 2);
    }

    /// Record that never matches leaves the queue after four stages
    #[test]
    fn test_unmatched_record_is_dropped() {
        let mut queue = RenonceQueue::new();
        let id = push(&mut queue);
        for stage in 1..RENONCE_STAGES {
            assert_eq!(run_stage(&mut queue), Some(id));
            let report = queue.advance();
            assert_eq!(report.advanced, 1);
            assert_eq!(queue.get(id).expect("record").stage, stage);
        }
        assert_eq!(run_stage(&mut queue), Some(id));
        let report = queue.advance();
        assert_eq!(report.finished, 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_waiting_records_do_not_advance() {
        let mut queue = RenonceQueue::new();
        let id = push(&mut queue);
        assert_eq!(queue.advance(), AdvanceReport::default());
        queue.mark_sent(id);
        assert_eq!(queue.advance(), AdvanceReport::default());
        assert!(queue.next_unsent().is_none());
        // receiving before sending is ignored
        let other = push(&mut queue);
        queue.mark_received(other);
        assert_eq!(queue.advance(), AdvanceReport::default());

        queue.mark_unsent(id);
        assert_eq!(queue.next_unsent().map(|record| record.id), Some(id));
    }

    #[test]
    fn test_missing_previous_work_is_skipped() {
        let mut queue = RenonceQueue::new();
        let id = queue
            .push(0xaaa7_0100, addr(1), addr(0), Some(snapshot(0)), None)
            .expect("push");
        run_stage(&mut queue);
        queue.advance();
        // stage 1 has no work and is skipped right away
        assert!(queue.next_unsent().is_none());
        queue.advance();
        assert_eq!(queue.get(id).expect("record").stage, 2);
        assert!(queue.next_unsent().is_some());
    }

    #[test]
    fn test_load_shedding() {
        let mut queue = RenonceQueue::new();
        let ids: Vec<_> = (0..RENONCE_STAGE2_LIMIT + 1).map(|_| push(&mut queue)).collect();
        for record in queue.records.iter_mut() {
            record.stage = 1;
            record.sent = true;
            record.received = true;
        }
        let report = queue.advance();
        // queue shrinks while shedding, once at the limit the rest may advance
        assert_eq!(report.shed, 1);
        assert_eq!(report.advanced, RENONCE_STAGE2_LIMIT);
        assert!(queue.get(ids[0]).is_none());
        assert_eq!(queue.len(), RENONCE_STAGE2_LIMIT);

        for record in queue.records.iter_mut() {
            record.sent = true;
            record.received = true;
        }
        let report = queue.advance();
        assert_eq!(report.shed, RENONCE_STAGE2_LIMIT - RENONCE_STAGE3_LIMIT);
        assert_eq!(queue.len(), RENONCE_STAGE3_LIMIT);
    }

    #[test]
    fn test_take_matched_and_reassign() {
        let mut queue = RenonceQueue::new();
        let first = push(&mut queue);
        let second = push(&mut queue);
        queue.mark_sent(first);
        queue.mark_sent(second);
        queue.mark_received(second);

        queue.reassign(addr(5));
        assert!(queue.records.iter().all(|record| record.chip == addr(5)));
        assert!(!queue.get(first).expect("first").sent, "in flight task must be resent");
        assert!(queue.get(second).expect("second").sent);

        let record = queue.take_matched(first).expect("matched");
        assert!(record.matched);
        assert!(queue.take_matched(first).is_none());
        assert_eq!(queue.clear(), 1);
    }
}
