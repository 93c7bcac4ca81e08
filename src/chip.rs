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

//! Chip lifecycle
//!
//! Every chip walks `Uninitialized -> ToggleSet -> ClockSet -> MaskSet -> TaskSent ->
//! TaskSwitched` and then loops between `MaskSet` and `TaskSwitched`, one step per scheduling
//! round. Hangs and error bursts park the chip in `Failing` from where it is either retried after
//! a backoff or disabled for good.

use crate::bf16::{self, ChipAddress, Opcode, Reply, NONCES_PER_READ, NONCE_SENTINEL};
use crate::nonce::{NonceRing, RECENT_NONCES, RECENT_RENONCE_NONCES};
use crate::renonce::RenonceId;
use crate::work::WorkSnapshot;

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Upper bound of the wait before a failing chip is retried
pub const MAX_FAILING_BACKOFF: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipState {
    Uninitialized,
    ToggleSet,
    ClockSet,
    MaskSet,
    TaskSent,
    TaskSwitched,
    Failing,
    Disabled,
}

impl ChipState {
    /// Chip has been configured and works on tasks
    pub fn is_hashing(self) -> bool {
        match self {
            ChipState::MaskSet | ChipState::TaskSent | ChipState::TaskSwitched => true,
            _ => false,
        }
    }

    /// Chip is being configured, command errors make it start over
    pub fn is_initializing(self) -> bool {
        match self {
            ChipState::Uninitialized
            | ChipState::ToggleSet
            | ChipState::ClockSet
            | ChipState::MaskSet => true,
            _ => false,
        }
    }

    /// Chip can take part in scheduling rounds
    pub fn is_working(self) -> bool {
        match self {
            ChipState::Failing | ChipState::Disabled => false,
            _ => true,
        }
    }
}

impl fmt::Display for ChipState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Timing and error policy of the chip lifecycle
#[derive(Debug, Clone)]
pub struct LifecycleParams {
    pub clock_word: [u8; 4],
    /// Mask programmed by the set mask command
    pub default_mask: u32,
    pub status_poll_interval: Duration,
    pub task_switch_timeout: Duration,
    pub good_nonce_timeout: Duration,
    /// Errors per second that force the chip into `Failing`
    pub error_rate_limit: usize,
    /// Backoff per recovery attempt
    pub failing_backoff: Duration,
    pub max_recovery_attempts: u32,
    /// Task iterations before the chip is initialized again, 0 means never
    pub restart_limit: u32,
}

impl Default for LifecycleParams {
    fn default() -> Self {
        Self {
            clock_word: [0; 4],
            default_mask: 0,
            status_poll_interval: Duration::from_millis(20),
            task_switch_timeout: Duration::from_secs(10),
            good_nonce_timeout: Duration::from_secs(120),
            error_rate_limit: 10,
            failing_backoff: Duration::from_secs(5),
            max_recovery_attempts: 5,
            restart_limit: 1000,
        }
    }
}

/// Number of events within a sliding time window
#[derive(Debug, Clone)]
pub struct ErrorRate {
    window: Duration,
    events: VecDeque<Instant>,
}

impl ErrorRate {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            events: VecDeque::new(),
        }
    }

    fn expire(&mut self, now: Instant) {
        while let Some(oldest) = self.events.front() {
            if now.duration_since(*oldest) < self.window {
                break;
            }
            self.events.pop_front();
        }
    }

    pub fn record(&mut self, now: Instant) {
        self.expire(now);
        self.events.push_back(now);
    }

    pub fn rate(&mut self, now: Instant) -> usize {
        self.expire(now);
        self.events.len()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}

/// What the chip needs in the next round
#[derive(Debug, Clone, PartialEq)]
pub enum ChipAction {
    Command(Opcode, Vec<u8>),
    /// Chip is ready for a new task, the scheduler has to provide the work
    NeedTask,
}

/// Effect of a command reply on the chip
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplyOutcome {
    pub checksum_error: bool,
    pub nonce_checksum_error: bool,
    /// Chip switched to the task written last
    pub switched: bool,
    /// Nonce block to be processed
    pub nonces: Option<[u32; NONCES_PER_READ]>,
    /// Renonce task the chip has finished with this read
    pub completed_renonce: Option<RenonceId>,
    /// Chip dropped the task written last without starting it
    pub task_lost: bool,
    /// Renonce task that has to be sent again
    pub lost_renonce: Option<RenonceId>,
}

#[derive(Debug, Clone)]
pub struct ChipRecord {
    pub address: ChipAddress,
    pub state: ChipState,
    /// Chip verifies uncertain nonces instead of mining pool work
    pub renonce: bool,
    pub task_parity: bool,
    pub iterations: u32,
    /// Tasks written again because the chip did not keep them
    pub task_resends: u64,
    pub recent: NonceRing,
    pub last_nonces: [u32; NONCES_PER_READ],
    pub error_count: u64,
    pub errors: ErrorRate,
    pub recovery_attempts: u32,
    pub last_good_nonce: Instant,
    pub last_status_poll: Option<Instant>,
    pub last_task_write: Instant,
    pub last_task_switch: Instant,
    pub last_error: Option<Instant>,
    pub pending: Option<Arc<WorkSnapshot>>,
    pub current: Option<Arc<WorkSnapshot>>,
    pub previous: Option<Arc<WorkSnapshot>>,
    pub pending_renonce: Option<RenonceId>,
    pub current_renonce: Option<RenonceId>,
    pub previous_renonce: Option<RenonceId>,
}

impl ChipRecord {
    pub fn new(address: ChipAddress, now: Instant) -> Self {
        Self {
            address,
            state: ChipState::Uninitialized,
            renonce: false,
            task_parity: false,
            iterations: 0,
            task_resends: 0,
            recent: NonceRing::new(RECENT_NONCES),
            last_nonces: [NONCE_SENTINEL; NONCES_PER_READ],
            error_count: 0,
            errors: ErrorRate::new(Duration::from_secs(1)),
            recovery_attempts: 0,
            last_good_nonce: now,
            last_status_poll: None,
            last_task_write: now,
            last_task_switch: now,
            last_error: None,
            pending: None,
            current: None,
            previous: None,
            pending_renonce: None,
            current_renonce: None,
            previous_renonce: None,
        }
    }

    /// Hand the renonce role to (or take it from) this chip. The chip is configured again.
    pub fn set_renonce(&mut self, renonce: bool, now: Instant) {
        self.renonce = renonce;
        self.recent.resize(if renonce {
            RECENT_RENONCE_NONCES
        } else {
            RECENT_NONCES
        });
        self.pending = None;
        self.current = None;
        self.previous = None;
        self.pending_renonce = None;
        self.current_renonce = None;
        self.previous_renonce = None;
        if self.state != ChipState::Disabled {
            self.restart(now);
        }
    }

    fn restart(&mut self, now: Instant) {
        self.state = ChipState::Uninitialized;
        self.iterations = 0;
        self.last_status_poll = None;
        self.last_good_nonce = now;
        self.last_task_write = now;
        self.last_task_switch = now;
    }

    fn fail(&mut self, now: Instant) {
        self.state = ChipState::Failing;
        self.recovery_attempts += 1;
        self.last_error = Some(now);
    }

    fn record_error(&mut self, now: Instant) {
        self.error_count += 1;
        self.errors.record(now);
        self.last_error = Some(now);
    }

    fn poll_due(&self, now: Instant, params: &LifecycleParams) -> bool {
        match self.last_status_poll {
            Some(last) => now.duration_since(last) >= params.status_poll_interval,
            None => true,
        }
    }

    /// Command the chip needs in this round, if any
    pub fn next_action(&self, now: Instant, params: &LifecycleParams) -> Option<ChipAction> {
        let action = match self.state {
            ChipState::Uninitialized => {
                ChipAction::Command(Opcode::Toggle, bf16::TOGGLE_PATTERN.to_vec())
            }
            ChipState::ToggleSet => {
                ChipAction::Command(Opcode::SetClock, params.clock_word.to_vec())
            }
            ChipState::ClockSet => ChipAction::Command(
                Opcode::SetMask,
                params.default_mask.to_be_bytes().to_vec(),
            ),
            ChipState::MaskSet => ChipAction::NeedTask,
            ChipState::TaskSent if self.poll_due(now, params) => {
                ChipAction::Command(Opcode::ReadNonce, vec![])
            }
            ChipState::TaskSwitched => ChipAction::Command(Opcode::ReadNonce, vec![]),
            _ => return None,
        };
        Some(action)
    }

    /// Advance the state machine with the reply to a command sent in this round
    pub fn on_reply(
        &mut self,
        opcode: Opcode,
        reply: &Reply,
        work: Option<Arc<WorkSnapshot>>,
        renonce_id: Option<RenonceId>,
        now: Instant,
        params: &LifecycleParams,
    ) -> ReplyOutcome {
        let mut outcome = ReplyOutcome::default();
        if !reply.checksum_ok {
            outcome.checksum_error = true;
            self.record_error(now);
            if self.state.is_initializing() {
                self.state = ChipState::Uninitialized;
            }
            return outcome;
        }

        match (self.state, opcode) {
            (ChipState::Uninitialized, Opcode::Toggle) => {
                self.state = ChipState::ToggleSet;
            }
            (ChipState::ToggleSet, Opcode::SetClock) => {
                self.state = ChipState::ClockSet;
            }
            (ChipState::ClockSet, Opcode::SetMask) => {
                // errors retried during configuration do not count against the hashing chip
                self.errors.clear();
                self.state = ChipState::MaskSet;
            }
            (ChipState::MaskSet, Opcode::TaskWrite) => {
                self.state = ChipState::TaskSent;
                self.pending = work;
                self.pending_renonce = renonce_id;
                self.last_task_write = now;
            }
            (ChipState::TaskSent, Opcode::ReadNonce) => {
                self.last_status_poll = Some(now);
                if reply.status.task_parity != self.task_parity {
                    self.switch_task(now);
                    outcome.switched = true;
                } else if !reply.status.task_pending {
                    self.pending = None;
                    self.task_resends += 1;
                    self.state = ChipState::MaskSet;
                    outcome.task_lost = true;
                    outcome.lost_renonce = self.pending_renonce.take();
                }
            }
            (ChipState::TaskSwitched, Opcode::ReadNonce) => {
                self.last_status_poll = Some(now);
                outcome.completed_renonce = self.current_renonce;
                self.iterations += 1;
                if params.restart_limit > 0 && self.iterations >= params.restart_limit {
                    self.restart(now);
                } else {
                    self.state = ChipState::MaskSet;
                }
            }
            _ => (),
        }
        self.task_parity = reply.status.task_parity;

        if let Some(nonces) = reply.nonces {
            if reply.nonce_checksum_ok {
                outcome.nonces = Some(nonces);
            } else {
                outcome.nonce_checksum_error = true;
                self.record_error(now);
            }
        }
        outcome
    }

    fn switch_task(&mut self, now: Instant) {
        self.previous = self.current.take();
        self.current = self.pending.take();
        self.previous_renonce = self.current_renonce.take();
        self.current_renonce = self.pending_renonce.take();
        self.state = ChipState::TaskSwitched;
        self.last_task_switch = now;
    }

    /// Chip produced a valid nonce
    pub fn on_good_nonce(&mut self, now: Instant) {
        self.last_good_nonce = now;
        self.recovery_attempts = 0;
    }

    /// Chip is ready for a task but there is no work for it. Idle time does not count towards
    /// the good nonce timeout.
    pub fn wait_for_work(&mut self, now: Instant) {
        self.last_good_nonce = now;
    }

    /// Configure the chip again from scratch (after a chain reset or power up)
    pub fn reinitialize(&mut self, now: Instant) {
        if self.state == ChipState::Disabled {
            return;
        }
        self.pending = None;
        self.pending_renonce = None;
        self.task_parity = false;
        self.restart(now);
    }

    /// Time based transitions, returns the new state when it changed
    pub fn tick(&mut self, now: Instant, params: &LifecycleParams) -> Option<ChipState> {
        let old = self.state;
        match self.state {
            ChipState::Disabled => (),
            ChipState::Failing => {
                if self.recovery_attempts >= params.max_recovery_attempts {
                    self.state = ChipState::Disabled;
                } else {
                    let backoff = params
                        .failing_backoff
                        .checked_mul(self.recovery_attempts)
                        .map_or(MAX_FAILING_BACKOFF, |backoff| backoff.min(MAX_FAILING_BACKOFF));
                    let since_error = self
                        .last_error
                        .map(|last| now.duration_since(last))
                        .unwrap_or(backoff);
                    if since_error >= backoff {
                        self.errors.clear();
                        self.restart(now);
                    }
                }
            }
            state => {
                if state.is_hashing() && self.errors.rate(now) > params.error_rate_limit {
                    self.fail(now);
                } else if state == ChipState::TaskSent
                    && now.duration_since(self.last_task_write) > params.task_switch_timeout
                {
                    self.fail(now);
                } else if state.is_hashing()
                    && !self.renonce
                    && now.duration_since(self.last_good_nonce) > params.good_nonce_timeout
                {
                    self.fail(now);
                }
            }
        }
        if self.state != old {
            Some(self.state)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bf16::ChipStatus;
    use crate::test_utils::test_work;

    fn reply(parity: bool, checksum_ok: bool, nonces: bool) -> Reply {
        Reply {
            status: ChipStatus {
                task_parity: parity,
                task_pending: true,
            },
            checksum: 0,
            checksum_ok,
            nonce_checksum_ok: true,
            nonces: if nonces {
                Some([NONCE_SENTINEL; NONCES_PER_READ])
            } else {
                None
            },
        }
    }

    /// Minimal chip: toggles parity when a written task gets picked up by a status poll
    struct IdealChip {
        parity: bool,
        pending: bool,
    }

    impl IdealChip {
        fn answer(&mut self, opcode: Opcode) -> Reply {
            match opcode {
                Opcode::Toggle => {
                    self.parity = false;
                    self.pending = false;
                }
                Opcode::TaskWrite => self.pending = true,
                Opcode::ReadNonce if self.pending => {
                    self.pending = false;
                    self.parity = !self.parity;
                }
                _ => (),
            }
            let mut answer = reply(self.parity, true, opcode.reads_nonces());
            answer.status.task_pending = self.pending;
            answer
        }
    }

    /// Run one round, returns the opcode that has been sent
    fn round(
        record: &mut ChipRecord,
        chip: &mut IdealChip,
        now: Instant,
        params: &LifecycleParams,
    ) -> Option<Opcode> {
        record.tick(now, params);
        let (opcode, work) = match record.next_action(now, params)? {
            ChipAction::Command(opcode, _) => (opcode, None),
            ChipAction::NeedTask => {
                let work = test_work(0, 1);
                let ntime = work.ntime;
                (Opcode::TaskWrite, Some(Arc::new(WorkSnapshot::new(work, ntime, 0))))
            }
        };
        let answer = chip.answer(opcode);
        record.on_reply(opcode, &answer, work, None, now, params);
        Some(opcode)
    }

    #[test]
    fn test_liveness() {
        let params = LifecycleParams::default();
        let mut now = Instant::now();
        let mut record = ChipRecord::new(ChipAddress::new(0, 0, 1), now);
        let mut chip = IdealChip {
            parity: false,
            pending: false,
        };

        let expected = [
            (Opcode::Toggle, ChipState::ToggleSet),
            (Opcode::SetClock, ChipState::ClockSet),
            (Opcode::SetMask, ChipState::MaskSet),
            (Opcode::TaskWrite, ChipState::TaskSent),
            (Opcode::ReadNonce, ChipState::TaskSwitched),
        ];
        for (opcode, state) in expected.iter() {
            now += params.status_poll_interval;
            assert_eq!(round(&mut record, &mut chip, now, &params), Some(*opcode));
            assert_eq!(record.state, *state);
        }
        assert!(record.current.is_some());

        for _ in 0..100 {
            now += params.status_poll_interval;
            round(&mut record, &mut chip, now, &params);
            assert!(
                record.state.is_hashing(),
                "chip left hashing loop: {}",
                record.state
            );
        }
        assert!(record.previous.is_some());
        assert_eq!(record.recovery_attempts, 0);
    }

    #[test]
    fn test_status_poll_rate_limit() {
        let params = LifecycleParams::default();
        let now = Instant::now();
        let mut record = ChipRecord::new(ChipAddress::new(0, 0, 1), now);
        record.state = ChipState::TaskSent;
        assert!(record.next_action(now, &params).is_some());
        record.on_reply(Opcode::ReadNonce, &reply(false, true, true), None, None, now, &params);
        assert_eq!(record.state, ChipState::TaskSent);
        assert_eq!(record.next_action(now, &params), None);
        assert!(record
            .next_action(now + params.status_poll_interval, &params)
            .is_some());
    }

    #[test]
    fn test_lost_task_is_written_again() {
        let params = LifecycleParams::default();
        let now = Instant::now();
        let mut record = ChipRecord::new(ChipAddress::new(0, 0, 1), now);
        record.state = ChipState::MaskSet;
        let work = test_work(0, 1);
        let ntime = work.ntime;
        let snapshot = Arc::new(WorkSnapshot::new(work, ntime, 0));
        let good = reply(false, true, false);
        record.on_reply(Opcode::TaskWrite, &good, Some(snapshot), Some(7), now, &params);
        assert_eq!(record.state, ChipState::TaskSent);

        let outcome =
            record.on_reply(Opcode::ReadNonce, &reply(false, true, true), None, None, now, &params);
        assert!(!outcome.task_lost, "task still waits in the chip");
        assert_eq!(record.state, ChipState::TaskSent);

        let mut lost = reply(false, true, true);
        lost.status.task_pending = false;
        let outcome = record.on_reply(Opcode::ReadNonce, &lost, None, None, now, &params);
        assert!(outcome.task_lost);
        assert_eq!(outcome.lost_renonce, Some(7));
        assert_eq!(record.state, ChipState::MaskSet);
        assert!(record.pending.is_none());
        assert_eq!(record.task_resends, 1);
        assert_eq!(record.next_action(now, &params), Some(ChipAction::NeedTask));
    }

    #[test]
    fn test_restart_limit() {
        let params = LifecycleParams {
            restart_limit: 3,
            ..Default::default()
        };
        let mut now = Instant::now();
        let mut record = ChipRecord::new(ChipAddress::new(0, 0, 1), now);
        let mut chip = IdealChip {
            parity: false,
            pending: false,
        };
        let mut toggles = 0;
        for _ in 0..30 {
            now += params.status_poll_interval;
            if round(&mut record, &mut chip, now, &params) == Some(Opcode::Toggle) {
                toggles += 1;
            }
        }
        assert!(toggles > 1, "chip was never initialized again");
    }

    #[test]
    fn test_checksum_error_during_init() {
        let params = LifecycleParams::default();
        let now = Instant::now();
        let mut record = ChipRecord::new(ChipAddress::new(0, 0, 1), now);
        record.state = ChipState::ClockSet;
        let outcome =
            record.on_reply(Opcode::SetMask, &reply(false, false, false), None, None, now, &params);
        assert!(outcome.checksum_error);
        assert_eq!(record.state, ChipState::Uninitialized);
        assert_eq!(record.error_count, 1);
    }

    #[test]
    fn test_checksum_error_on_task_write() {
        let params = LifecycleParams::default();
        let now = Instant::now();
        let mut record = ChipRecord::new(ChipAddress::new(0, 0, 1), now);
        record.state = ChipState::MaskSet;
        let work = test_work(0, 1);
        let ntime = work.ntime;
        let snapshot = Arc::new(WorkSnapshot::new(work, ntime, 0));
        let outcome = record.on_reply(
            Opcode::TaskWrite,
            &reply(false, false, false),
            Some(snapshot),
            None,
            now,
            &params,
        );
        assert!(outcome.checksum_error);
        assert_eq!(record.state, ChipState::Uninitialized);
        assert!(record.pending.is_none());
    }

    #[test]
    fn test_init_errors_keep_retrying() {
        let params = LifecycleParams {
            error_rate_limit: 2,
            ..Default::default()
        };
        let now = Instant::now();
        let mut record = ChipRecord::new(ChipAddress::new(0, 0, 1), now);
        let bad = reply(false, false, false);
        for _ in 0..=params.error_rate_limit * 5 {
            record.on_reply(Opcode::Toggle, &bad, None, None, now, &params);
        }
        assert_eq!(record.tick(now, &params), None);
        assert_eq!(record.state, ChipState::Uninitialized);
        assert_eq!(record.recovery_attempts, 0);

        let good = reply(false, true, false);
        for opcode in [Opcode::Toggle, Opcode::SetClock, Opcode::SetMask].iter() {
            record.on_reply(*opcode, &good, None, None, now, &params);
        }
        assert_eq!(record.state, ChipState::MaskSet);
        assert_eq!(record.tick(now, &params), None);
    }

    #[test]
    fn test_failing_backoff_is_bounded() {
        let params = LifecycleParams {
            failing_backoff: Duration::from_secs(u64::max_value()),
            ..Default::default()
        };
        let mut now = Instant::now();
        let mut record = ChipRecord::new(ChipAddress::new(0, 0, 1), now);
        record.state = ChipState::TaskSent;
        record.last_task_write = now;
        now += params.task_switch_timeout * 2;
        assert_eq!(record.tick(now, &params), Some(ChipState::Failing));
        record.recovery_attempts = 2;
        assert_eq!(record.tick(now, &params), None);
        now += MAX_FAILING_BACKOFF;
        assert_eq!(record.tick(now, &params), Some(ChipState::Uninitialized));
    }

    #[test]
    fn test_nonce_checksum_error() {
        let params = LifecycleParams::default();
        let now = Instant::now();
        let mut record = ChipRecord::new(ChipAddress::new(0, 0, 1), now);
        record.state = ChipState::TaskSent;
        let mut bad = reply(false, true, true);
        bad.nonce_checksum_ok = false;
        let outcome = record.on_reply(Opcode::ReadNonce, &bad, None, None, now, &params);
        assert!(outcome.nonce_checksum_error);
        assert!(outcome.nonces.is_none());
        assert_eq!(record.state, ChipState::TaskSent);
        assert_eq!(record.error_count, 1);
    }

    #[test]
    fn test_hang_backoff_and_disable() {
        let params = LifecycleParams {
            max_recovery_attempts: 3,
            ..Default::default()
        };
        let mut now = Instant::now();
        let mut record = ChipRecord::new(ChipAddress::new(0, 0, 1), now);

        for attempt in 1..=3 {
            record.state = ChipState::TaskSent;
            record.last_task_write = now;
            now += params.task_switch_timeout / 2;
            assert_eq!(record.tick(now, &params), None);
            now += params.task_switch_timeout;
            assert_eq!(record.tick(now, &params), Some(ChipState::Failing));
            assert_eq!(record.recovery_attempts, attempt);

            if attempt < 3 {
                // backoff grows with every attempt
                now += params.failing_backoff * attempt - Duration::from_millis(1);
                assert_eq!(record.tick(now, &params), None);
                now += Duration::from_millis(1);
                assert_eq!(record.tick(now, &params), Some(ChipState::Uninitialized));
            }
        }
        assert_eq!(record.tick(now, &params), Some(ChipState::Disabled));
        now += params.failing_backoff * 100;
        assert_eq!(record.tick(now, &params), None);
        assert_eq!(record.next_action(now, &params), None);
    }

    #[test]
    fn test_error_rate_forces_failing() {
        let params = LifecycleParams {
            error_rate_limit: 2,
            ..Default::default()
        };
        let now = Instant::now();
        let mut record = ChipRecord::new(ChipAddress::new(0, 0, 1), now);
        record.state = ChipState::TaskSent;
        let bad = reply(false, false, true);
        for _ in 0..3 {
            record.on_reply(Opcode::ReadNonce, &bad, None, None, now, &params);
        }
        assert_eq!(record.state, ChipState::TaskSent);
        assert_eq!(record.tick(now, &params), Some(ChipState::Failing));
    }

    #[test]
    fn test_good_nonce_timeout() {
        let params = LifecycleParams::default();
        let mut now = Instant::now();
        let mut record = ChipRecord::new(ChipAddress::new(0, 0, 1), now);
        record.state = ChipState::MaskSet;
        now += params.good_nonce_timeout / 2;
        record.on_good_nonce(now);
        now += params.good_nonce_timeout;
        assert_eq!(record.tick(now, &params), None);

        record.set_renonce(true, now);
        record.state = ChipState::MaskSet;
        now += params.good_nonce_timeout * 2;
        assert_eq!(record.tick(now, &params), None, "renonce chip has no nonce timeout");
        record.set_renonce(false, now);
        record.state = ChipState::MaskSet;
        now += params.good_nonce_timeout * 2;
        assert_eq!(record.tick(now, &params), Some(ChipState::Failing));
    }

    #[test]
    fn test_error_rate_window() {
        let mut rate = ErrorRate::new(Duration::from_secs(1));
        let now = Instant::now();
        rate.record(now);
        rate.record(now + Duration::from_millis(500));
        assert_eq!(rate.rate(now + Duration::from_millis(900)), 2);
        assert_eq!(rate.rate(now + Duration::from_millis(1200)), 1);
        assert_eq!(rate.rate(now + Duration::from_secs(2)), 0);
    }
}
