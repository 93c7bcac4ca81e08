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

//! Hashboard: the chips behind one SPI channel and the pipelines feeding them
//!
//! A scheduling round ticks all chip state machines, collects the commands every chip needs,
//! groups them per concentrator between channel create/destroy paths and sends everything in as
//! few SPI bursts as the batch buffer allows. Nonce reads are queued for the nonce worker, which
//! validates them against the work the chip had and hands uncertain results to the renonce chip.

use crate::bf16::{ChannelPath, ChipAddress, Opcode, BROADCAST_CHIP_ID};
use crate::chip::{ChipAction, ChipRecord, ChipState, LifecycleParams};
use crate::command::{BufferState, ChipCommand, CommandBuffer, CommandKind, CommandResult};
use crate::config::{BoardConfig, Config};
use crate::counters;
use crate::error::{self, ErrorKind};
use crate::logging::LOGGER;
use crate::nonce::{self, NonceBatch, RenonceTag};
use crate::queue::Queue;
use crate::renonce::{self, AdvanceReport, RenonceQueue, RENONCE_STAGES};
use crate::task;
use crate::transport::SpiTransport;
use crate::work::{NonceSink, PoolWork, WorkQueue, WorkSnapshot};

use slog::{debug, info, trace, warn};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Nonce reads waiting for the nonce worker
pub const NONCE_QUEUE_LEN: usize = 1024;

/// Outcome of one scheduling round
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RoundReport {
    /// Chip commands sent
    pub commands: usize,
    pub batches: usize,
    pub failed_batches: usize,
}

struct ChipTable {
    records: Vec<ChipRecord>,
    renonce_chip: Option<ChipAddress>,
}

pub struct Board {
    pub id: usize,
    config: BoardConfig,
    params: LifecycleParams,
    renonce_enabled: bool,
    renonce_bits: [u8; RENONCE_STAGES as usize],
    transport: Mutex<Box<dyn SpiTransport>>,
    /// Lock order: chips, buffer, transport, work, renonces, counters
    chips: Mutex<ChipTable>,
    buffer: Mutex<CommandBuffer>,
    work: Mutex<WorkQueue>,
    nonces: Queue<NonceBatch>,
    renonces: Mutex<RenonceQueue>,
    counters: Mutex<counters::HashBoard>,
    sink: Arc<dyn NonceSink>,
    powered: AtomicBool,
    reset_pending: AtomicBool,
}

impl Board {
    pub fn new(
        board_config: &BoardConfig,
        config: &Config,
        transport: Box<dyn SpiTransport>,
        sink: Arc<dyn NonceSink>,
    ) -> error::Result<Self> {
        board_config.validate()?;
        let now = Instant::now();
        let mut chips = ChipTable {
            records: board_config
                .chip_addresses()
                .into_iter()
                .map(|addr| ChipRecord::new(addr, now))
                .collect(),
            renonce_chip: None,
        };
        if config.renonce.enabled {
            let addr = board_config.renonce_chip_address();
            let index = board_config.chip_index(addr).ok_or_else(|| {
                ErrorKind::Board(board_config.id, format!("no renonce chip {}", addr))
            })?;
            chips.records[index].set_renonce(true, now);
            chips.renonce_chip = Some(addr);
        }

        Ok(Self {
            id: board_config.id,
            config: board_config.clone(),
            params: config.lifecycle_params()?,
            renonce_enabled: config.renonce.enabled,
            renonce_bits: config.renonce.mask_bits,
            transport: Mutex::new(transport),
            chips: Mutex::new(chips),
            buffer: Mutex::new(CommandBuffer::new()),
            work: Mutex::new(WorkQueue::new(
                config.chip.work_queue_len,
                config.chip.ntime_roll,
            )),
            nonces: Queue::new(NONCE_QUEUE_LEN),
            renonces: Mutex::new(RenonceQueue::new()),
            counters: Mutex::new(counters::HashBoard::new(
                board_config.id,
                board_config.concentrators(),
                board_config.chips_per_concentrator,
            )),
            sink,
            powered: AtomicBool::new(true),
            reset_pending: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &BoardConfig {
        &self.config
    }

    fn chip_index(&self, addr: ChipAddress) -> Option<usize> {
        self.config.chip_index(addr)
    }

    /// Channel path to `concentrator` of this board
    pub fn resolve_channel_path(&self, concentrator: usize) -> error::Result<ChannelPath> {
        if concentrator >= self.config.concentrators() {
            Err(ErrorKind::Board(
                self.id,
                format!("no concentrator {}", concentrator),
            ))?
        }
        ChannelPath::resolve(concentrator, self.config.concentrators_per_chain)
    }

    /// Queue pool work, a board with its power chain off drops it
    pub fn enqueue_work(&self, work: Arc<PoolWork>) {
        let mut queue = self.work.lock().expect("work lock");
        if !self.is_powered() {
            debug!(LOGGER, "Board {}: powered off, work {} dropped", self.id, work.id);
            return;
        }
        queue.push(work);
    }

    pub fn needs_work(&self) -> bool {
        self.is_powered() && self.work.lock().expect("work lock").needs_work()
    }

    pub fn work_len(&self) -> usize {
        self.work.lock().expect("work lock").len()
    }

    pub fn renonce_len(&self) -> usize {
        self.renonces.lock().expect("renonce lock").len()
    }

    /// Drop queued work, nonce reads and renonce records. Chip states are kept.
    pub fn flush(&self) {
        self.work.lock().expect("work lock").clear();
        let nonces = self.nonces.clear();
        let renonces = self.renonces.lock().expect("renonce lock").clear();
        self.counters.lock().expect("counters lock").renonce.discarded += renonces as u64;
        debug!(
            LOGGER,
            "Board {}: flushed ({} nonce reads, {} renonces)", self.id, nonces, renonces
        );
    }

    pub fn is_powered(&self) -> bool {
        self.powered.load(Ordering::SeqCst)
    }

    /// Follow the power chain state. Chips are configured again after power returns.
    pub fn set_powered(&self, on: bool) {
        if self.powered.swap(on, Ordering::SeqCst) == on {
            return;
        }
        if on {
            info!(LOGGER, "Board {}: power chain on", self.id);
            self.request_reset();
        } else {
            warn!(LOGGER, "Board {}: power chain off, board stopped", self.id);
            self.flush();
        }
    }

    /// Broadcast reset to all concentrators and configure every chip again in the next round
    pub fn request_reset(&self) {
        self.reset_pending.store(true, Ordering::SeqCst);
    }

    pub fn renonce_chip(&self) -> Option<ChipAddress> {
        self.chips.lock().expect("chips lock").renonce_chip
    }

    pub fn chip(&self, addr: ChipAddress) -> Option<ChipRecord> {
        let index = self.chip_index(addr)?;
        Some(self.chips.lock().expect("chips lock").records[index].clone())
    }

    pub fn chip_states(&self) -> Vec<(ChipAddress, ChipState)> {
        self.chips
            .lock()
            .expect("chips lock")
            .records
            .iter()
            .map(|record| (record.address, record.state))
            .collect()
    }

    pub fn stats(&self) -> counters::HashBoard {
        self.counters.lock().expect("counters lock").snapshot()
    }

    pub fn log_stats(&self) {
        let stats = self.stats();
        let (working, disabled) = self.chip_states().iter().fold(
            (0usize, 0usize),
            |(working, disabled), (_, state)| match state {
                ChipState::Disabled => (working, disabled + 1),
                state if state.is_working() => (working + 1, disabled),
                _ => (working, disabled),
            },
        );
        info!(
            LOGGER,
            "Board {}: {:.2} GH/s, {} valid, {} errors, {} transport errors, {} chips working, \
             {} disabled",
            self.id,
            stats.hashrate() / 1e9,
            stats.valid,
            stats.errors,
            stats.transport_errors,
            working,
            disabled
        );
        info!(
            LOGGER,
            "Board {}: renonce {} queued, {} matched, {} bad, {} pending, {} nonce reads waiting",
            self.id,
            stats.renonce.queued,
            stats.renonce.matched,
            stats.renonce.bad(),
            self.renonce_len(),
            self.nonces.len()
        );
    }

    /// Hand the renonce role to `chip`, `None` switches renonce off for this board
    pub fn reassign_renonce_chip(&self, chip: Option<ChipAddress>) -> error::Result<()> {
        let mut chips = self.chips.lock().expect("chips lock");
        if let Some(addr) = chip {
            if !self.renonce_enabled {
                Err(ErrorKind::Board(self.id, "renonce is disabled".to_string()))?
            }
            let index = self.chip_index(addr).ok_or_else(|| {
                ErrorKind::Board(self.id, format!("chip {} does not exist", addr))
            })?;
            if chips.records[index].state == ChipState::Disabled {
                Err(ErrorKind::Board(
                    self.id,
                    format!("chip {} is disabled", addr),
                ))?
            }
        }
        self.move_renonce_role(&mut chips, chip, Instant::now());
        Ok(())
    }

    fn move_renonce_role(&self, chips: &mut ChipTable, chip: Option<ChipAddress>, now: Instant) {
        if chips.renonce_chip == chip {
            return;
        }
        if let Some(index) = chips.renonce_chip.and_then(|old| self.chip_index(old)) {
            chips.records[index].set_renonce(false, now);
        }
        if let Some(index) = chip.and_then(|new| self.chip_index(new)) {
            chips.records[index].set_renonce(true, now);
        }
        chips.renonce_chip = chip;

        let mut renonces = self.renonces.lock().expect("renonce lock");
        match chip {
            Some(addr) => {
                renonces.reassign(addr);
                info!(LOGGER, "Board {}: renonce chip is {}", self.id, addr);
            }
            None => {
                let dropped = renonces.clear();
                self.counters.lock().expect("counters lock").renonce.discarded +=
                    dropped as u64;
                warn!(
                    LOGGER,
                    "Board {}: renonce switched off, {} pending nonces dropped", self.id, dropped
                );
            }
        }
    }

    fn tick_chips(&self, chips: &mut ChipTable, now: Instant) {
        let mut renonce_restarted = false;
        for record in chips.records.iter_mut() {
            let old = record.state;
            let state = match record.tick(now, &self.params) {
                Some(state) => state,
                None => continue,
            };
            match state {
                ChipState::Failing => warn!(
                    LOGGER,
                    "Chip {}: failing in state {} (attempt {})",
                    record.address,
                    old,
                    record.recovery_attempts
                ),
                ChipState::Disabled => warn!(
                    LOGGER,
                    "Chip {}: disabled after {} recovery attempts",
                    record.address,
                    record.recovery_attempts
                ),
                _ => info!(LOGGER, "Chip {}: recovering", record.address),
            }
            if record.renonce {
                renonce_restarted = true;
            }
        }

        if let Some(addr) = chips.renonce_chip {
            if renonce_restarted {
                // tasks in flight on the renonce chip are lost
                self.renonces.lock().expect("renonce lock").reassign(addr);
            }
            let disabled = self
                .chip_index(addr)
                .map(|index| chips.records[index].state == ChipState::Disabled)
                .unwrap_or(true);
            if disabled {
                let next = chips
                    .records
                    .iter()
                    .find(|record| !record.renonce && record.state.is_working())
                    .map(|record| record.address);
                self.move_renonce_role(chips, next, now);
            }
        }
    }

    /// Task for a chip that asks for one
    fn task_command(&self, record: &ChipRecord) -> Option<ChipCommand> {
        if !record.renonce {
            let work = self
                .work
                .lock()
                .expect("work lock")
                .take(self.params.default_mask)?;
            let payload = work.task.to_vec();
            return Some(
                ChipCommand::new(record.address, Opcode::TaskWrite, payload).with_work(work),
            );
        }

        let renonces = self.renonces.lock().expect("renonce lock");
        let pending = renonces.next_unsent()?;
        match pending.stage_snapshot(&self.renonce_bits) {
            Ok(Some(snapshot)) => {
                let payload = snapshot.task.to_vec();
                Some(
                    ChipCommand::new(record.address, Opcode::TaskWrite, payload)
                        .with_work(Arc::new(snapshot))
                        .with_renonce(pending.src, pending.id),
                )
            }
            Ok(None) => None,
            Err(e) => {
                warn!(LOGGER, "Board {}: renonce {}: {}", self.id, pending.id, e);
                None
            }
        }
    }

    fn plan_concentrator(
        &self,
        chips: &mut ChipTable,
        concentrator: usize,
        reset: bool,
        now: Instant,
    ) -> Vec<ChipCommand> {
        let mut commands = Vec::new();
        if reset {
            commands.push(ChipCommand::new(
                ChipAddress::new(self.id, concentrator, BROADCAST_CHIP_ID),
                Opcode::Reset,
                vec![],
            ));
        }
        let first = concentrator * self.config.chips_per_concentrator;
        for record in chips.records[first..first + self.config.chips_per_concentrator].iter_mut() {
            match record.next_action(now, &self.params) {
                Some(ChipAction::Command(opcode, payload)) => {
                    commands.push(ChipCommand::new(record.address, opcode, payload))
                }
                Some(ChipAction::NeedTask) => match self.task_command(record) {
                    Some(command) => commands.push(command),
                    None => record.wait_for_work(now),
                },
                None => (),
            }
        }
        commands
    }

    fn queue_concentrator(
        &self,
        buffer: &mut CommandBuffer,
        concentrator: usize,
        path: &ChannelPath,
        commands: Vec<ChipCommand>,
    ) -> usize {
        let anchor = ChipAddress::new(self.id, concentrator, 0);
        if let Err(e) = buffer.push_create_channel(anchor, path) {
            warn!(LOGGER, "Board {}: concentrator {}: {}", self.id, concentrator, e);
            return 0;
        }
        let mut queued = 0;
        for command in commands {
            let chip = command.chip;
            match buffer.push(path.depth(), command) {
                Ok(()) => queued += 1,
                Err(e) => warn!(LOGGER, "Chip {}: command dropped: {}", chip, e),
            }
        }
        if let Err(e) = buffer.push_destroy_channel(anchor, path) {
            warn!(LOGGER, "Board {}: concentrator {}: {}", self.id, concentrator, e);
        }
        queued
    }

    /// One pass over all chips of the board
    pub fn run_round(&self, now: Instant) -> RoundReport {
        let mut report = RoundReport::default();
        if !self.is_powered() {
            return report;
        }

        let mut chips = self.chips.lock().expect("chips lock");
        self.tick_chips(&mut chips, now);
        let reset = self.reset_pending.swap(false, Ordering::SeqCst);
        if reset {
            info!(LOGGER, "Board {}: resetting chip chain", self.id);
            for record in chips.records.iter_mut() {
                record.reinitialize(now);
            }
        }

        let mut buffer = self.buffer.lock().expect("buffer lock");
        for concentrator in 0..self.config.concentrators() {
            let commands = self.plan_concentrator(&mut chips, concentrator, reset, now);
            if commands.is_empty() {
                continue;
            }
            let path = match self.resolve_channel_path(concentrator) {
                Ok(path) => path,
                Err(e) => {
                    warn!(LOGGER, "Board {}: {}", self.id, e);
                    continue;
                }
            };
            let required = 2 * path.to_bytes().len()
                + commands
                    .iter()
                    .map(|command| command.footprint(path.depth()))
                    .sum::<usize>();
            if !buffer.has_room(required) && !buffer.is_empty() {
                self.execute_batch(&mut chips, &mut buffer, now, &mut report);
            }
            if !buffer.has_room(required) {
                warn!(
                    LOGGER,
                    "Board {}: commands for concentrator {} do not fit into a batch",
                    self.id,
                    concentrator
                );
                continue;
            }
            report.commands += self.queue_concentrator(&mut buffer, concentrator, &path, commands);
        }
        if buffer.state() == BufferState::TxReady {
            self.execute_batch(&mut chips, &mut buffer, now, &mut report);
        }
        self.counters.lock().expect("counters lock").rounds += 1;
        trace!(LOGGER, "Board {}: round {:?}", self.id, report);
        report
    }

    fn execute_batch(
        &self,
        chips: &mut ChipTable,
        buffer: &mut CommandBuffer,
        now: Instant,
        report: &mut RoundReport,
    ) {
        report.batches += 1;
        let result = {
            let mut transport = self.transport.lock().expect("transport lock");
            buffer.execute(&mut **transport, self.config.channel)
        };
        if let Err(e) = result {
            report.failed_batches += 1;
            self.counters.lock().expect("counters lock").transport_errors += 1;
            warn!(LOGGER, "Board {}: batch dropped: {}", self.id, e);
            return;
        }

        while buffer.state() == BufferState::Executed {
            match buffer.pop() {
                Ok(result) => self.handle_result(chips, result, now),
                Err(e) => {
                    if e.kind() != ErrorKind::Empty {
                        warn!(LOGGER, "Board {}: {}", self.id, e);
                    }
                }
            }
        }
    }

    fn handle_result(&self, chips: &mut ChipTable, result: CommandResult, now: Instant) {
        let opcode = match result.kind {
            CommandKind::Chip(opcode) => opcode,
            _ => return,
        };
        let reply = match result.reply {
            Some(reply) => reply,
            None => return,
        };
        if result.chip.is_broadcast() {
            trace!(LOGGER, "Board {}: broadcast {:?} done", self.id, opcode);
            return;
        }
        let index = match self.chip_index(result.chip) {
            Some(index) => index,
            None => return,
        };

        let record = &mut chips.records[index];
        let outcome = record.on_reply(
            opcode,
            &reply,
            result.work,
            result.renonce_id,
            now,
            &self.params,
        );
        if outcome.checksum_error || outcome.nonce_checksum_error {
            if let Some(chip) = self.counters.lock().expect("counters lock").chip_mut(result.chip) {
                if outcome.checksum_error {
                    chip.checksum_errors += 1;
                } else {
                    chip.nonce_checksum_errors += 1;
                }
            }
            debug!(
                LOGGER,
                "Chip {}: checksum error in reply to {:?}", result.chip, opcode
            );
        }
        if opcode == Opcode::TaskWrite && reply.checksum_ok {
            if let Some(id) = result.renonce_id {
                self.renonces.lock().expect("renonce lock").mark_sent(id);
            }
        }
        if outcome.task_lost {
            debug!(
                LOGGER,
                "Chip {}: task lost, writing it again ({} so far)", result.chip, record.task_resends
            );
            if let Some(id) = outcome.lost_renonce {
                self.renonces.lock().expect("renonce lock").mark_unsent(id);
            }
        }
        if outcome.switched {
            trace!(
                LOGGER,
                "Chip {}: switched to {:?}", result.chip, record.current
            );
        }

        match outcome.nonces {
            Some(nonces) => {
                let renonce = if record.renonce {
                    Some(RenonceTag {
                        current: record.current_renonce,
                        previous: record.previous_renonce,
                        completed: outcome.completed_renonce,
                    })
                } else {
                    None
                };
                let batch = NonceBatch {
                    chip: result.chip,
                    nonces,
                    current: record.current.clone(),
                    previous: record.previous.clone(),
                    renonce,
                };
                if !self.nonces.push(batch) {
                    warn!(
                        LOGGER,
                        "Board {}: nonce queue full, read of chip {} dropped", self.id, result.chip
                    );
                }
            }
            None => {
                if let Some(id) = outcome.completed_renonce {
                    self.renonces.lock().expect("renonce lock").mark_received(id);
                }
            }
        }
    }

    /// Validate queued nonce reads, returns the number of solutions submitted
    pub fn process_nonces(&self, now: Instant) -> usize {
        if self.nonces.is_empty() {
            return 0;
        }
        let batches = self.nonces.drain();

        // fresh nonces are validated without holding the chip table
        let mut candidates = Vec::new();
        let renonce_chip = {
            let mut chips = self.chips.lock().expect("chips lock");
            for (i, batch) in batches.iter().enumerate() {
                let index = match self.chip_index(batch.chip) {
                    Some(index) => index,
                    None => continue,
                };
                let record = &mut chips.records[index];
                let fresh = nonce::dedupe_round(&batch.nonces, &record.last_nonces);
                record.last_nonces = batch.nonces;

                for nonce in fresh {
                    if record.recent.insert(nonce) {
                        candidates.push((i, nonce));
                    } else if let Some(chip) =
                        self.counters.lock().expect("counters lock").chip_mut(batch.chip)
                    {
                        chip.duplicates += 1;
                    }
                }
            }
            chips.renonce_chip
        };

        let mut solutions = Vec::new();
        for (i, nonce) in candidates {
            let batch = &batches[i];
            let work = match batch.renonce {
                Some(tag) => self.verify_renonce(batch, tag, nonce),
                None => self.check_nonce(batch, nonce, renonce_chip),
            };
            if let Some(work) = work {
                solutions.push((batch.chip, work, nonce));
            }
        }
        for id in batches
            .iter()
            .filter_map(|batch| batch.renonce.and_then(|tag| tag.completed))
        {
            self.renonces.lock().expect("renonce lock").mark_received(id);
        }

        if !solutions.is_empty() {
            let mut chips = self.chips.lock().expect("chips lock");
            for (chip, _, _) in solutions.iter() {
                if let Some(index) = self.chip_index(*chip) {
                    chips.records[index].on_good_nonce(now);
                }
            }
        }
        for (_, work, nonce) in solutions.iter() {
            self.sink.submit(&work.work, *nonce, work.ntime);
        }
        solutions.len()
    }

    /// Nonce of an ordinary chip
    fn check_nonce(
        &self,
        batch: &NonceBatch,
        nonce: u32,
        renonce_chip: Option<ChipAddress>,
    ) -> Option<Arc<WorkSnapshot>> {
        if let Some(work) = batch.find_work(nonce) {
            self.counters.lock().expect("counters lock").add_valid(batch.chip);
            trace!(
                LOGGER,
                "Chip {}: nonce {:#010x} solves {:?}", batch.chip, nonce, work
            );
            return Some(work.clone());
        }

        match renonce_chip {
            Some(chip) if self.renonce_enabled && renonce::is_uncertain(nonce) => {
                let id = self.renonces.lock().expect("renonce lock").push(
                    nonce,
                    batch.chip,
                    chip,
                    batch.current.clone(),
                    batch.previous.clone(),
                );
                let mut counters = self.counters.lock().expect("counters lock");
                match id {
                    Some(id) => {
                        counters.renonce.queued += 1;
                        debug!(
                            LOGGER,
                            "Chip {}: uncertain nonce {:#010x} queued as renonce {}",
                            batch.chip,
                            nonce,
                            id
                        );
                    }
                    None => counters.renonce.overflow += 1,
                }
            }
            _ => {
                self.counters.lock().expect("counters lock").add_error(batch.chip);
                debug!(
                    LOGGER,
                    "Chip {}: nonce {:#010x} matches no work", batch.chip, nonce
                );
            }
        }
        None
    }

    /// Nonce of the renonce chip, it belongs to one of the renonce tasks the chip had. A record
    /// is confirmed only by a nonce from the region its task was narrowed to.
    fn verify_renonce(
        &self,
        batch: &NonceBatch,
        tag: RenonceTag,
        nonce: u32,
    ) -> Option<Arc<WorkSnapshot>> {
        let candidates = [
            (batch.current.as_ref(), tag.current),
            (batch.previous.as_ref(), tag.previous),
        ];
        for &(work, id) in candidates.iter() {
            let work = match work {
                Some(work) if work.test_nonce(nonce) => work,
                _ => continue,
            };
            let record = id.and_then(|id| {
                let mut renonces = self.renonces.lock().expect("renonce lock");
                let confirms = renonces.get(id).map_or(false, |record| {
                    task::mask_covers(work.mask, nonce)
                        && task::mask_covers(work.mask, record.nonce)
                });
                if confirms {
                    renonces.take_matched(id)
                } else {
                    None
                }
            });
            let mut counters = self.counters.lock().expect("counters lock");
            match record {
                Some(record) => {
                    counters.add_valid(record.src);
                    counters.renonce.matched += 1;
                    debug!(
                        LOGGER,
                        "Chip {}: renonce {} matched nonce {:#010x} in stage {}",
                        record.src,
                        record.id,
                        nonce,
                        record.stage
                    );
                }
                // record gone or not covered by the nonce, the solution is still good
                None => counters.add_valid(batch.chip),
            }
            return Some(work.clone());
        }
        self.counters.lock().expect("counters lock").add_error(batch.chip);
        None
    }

    /// Move renonce records through their stages
    pub fn advance_renonces(&self) -> AdvanceReport {
        let has_chip = self.chips.lock().expect("chips lock").renonce_chip.is_some();
        let mut renonces = self.renonces.lock().expect("renonce lock");
        if !has_chip {
            let dropped = renonces.clear();
            drop(renonces);
            self.counters.lock().expect("counters lock").renonce.discarded += dropped as u64;
            return AdvanceReport::default();
        }
        let report = renonces.advance();
        drop(renonces);

        if report.dropped() > 0 {
            let mut counters = self.counters.lock().expect("counters lock");
            counters.renonce.unmatched += report.finished as u64;
            counters.renonce.shed += report.shed as u64;
            debug!(
                LOGGER,
                "Board {}: {} renonces unmatched, {} shed", self.id, report.finished, report.shed
            );
        }
        report
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bf16::{NONCES_PER_READ, NONCE_SENTINEL};
    use crate::test_utils::{test_work, uncertain_version, CollectingSink, FakeChain, TEST_BLOCKS};

    use std::time::Duration;

    const PER_CHAIN: usize = 2;
    const CHIPS: usize = 3;

    fn addr(concentrator: usize, chip: u8) -> ChipAddress {
        ChipAddress::new(0, concentrator, chip)
    }

    fn test_config(renonce: bool) -> Config {
        let mut config = Config::default();
        config.boards = vec![BoardConfig {
            concentrators_per_chain: PER_CHAIN,
            chips_per_concentrator: CHIPS,
            ..Default::default()
        }];
        config.renonce.enabled = renonce;
        config
    }

    fn test_board(config: &Config) -> (Board, FakeChain, Arc<CollectingSink>) {
        let chain = FakeChain::new(0, PER_CHAIN, CHIPS);
        let sink = CollectingSink::new();
        let board = Board::new(
            &config.boards[0],
            config,
            Box::new(chain.transport()),
            sink.clone(),
        )
        .expect("board");
        (board, chain, sink)
    }

    fn feed(board: &Board, count: u64) {
        for id in 0..count {
            board.enqueue_work(test_work(0, id));
        }
    }

    fn run(board: &Board, now: &mut Instant, rounds: usize) {
        for _ in 0..rounds {
            *now += Duration::from_millis(50);
            board.run_round(*now);
            board.process_nonces(*now);
            board.advance_renonces();
        }
    }

    #[test]
    fn test_chips_hash_and_submit() {
        let config = test_config(true);
        let (board, _chain, sink) = test_board(&config);
        feed(&board, 60);
        let mut now = Instant::now();
        run(&board, &mut now, 10);

        for (chip, state) in board.chip_states() {
            assert!(state.is_hashing(), "chip {} in state {}", chip, state);
        }
        let block = &TEST_BLOCKS[0];
        let solutions = sink.solutions();
        // every pool chip reports the block nonce once, repeats are filtered as duplicates
        assert_eq!(solutions.len(), 2 * PER_CHAIN * CHIPS - 1);
        for solution in solutions {
            assert_eq!(solution.nonce, block.nonce);
            assert_eq!(solution.ntime, block.time);
        }

        let stats = board.stats();
        assert_eq!(stats.valid, 2 * PER_CHAIN as u64 * CHIPS as u64 - 1);
        assert_eq!(stats.errors, 0);
        assert_eq!(stats.chip(addr(0, 0)).expect("chip").valid, 0);
        assert_eq!(stats.chip(addr(3, 2)).expect("chip").valid, 1);
        assert!(stats.chip(addr(1, 1)).expect("chip").duplicates > 0);
    }

    #[test]
    fn test_idle_chips_wait_for_work() {
        let mut config = test_config(false);
        config.timing.good_nonce_timeout_ms = 200;
        let (board, _chain, sink) = test_board(&config);
        let mut now = Instant::now();
        run(&board, &mut now, 20);

        assert!(board.needs_work());
        assert!(sink.solutions().is_empty());
        for (chip, state) in board.chip_states() {
            assert_eq!(state, ChipState::MaskSet, "chip {}", chip);
        }
    }

    #[test]
    fn test_uncertain_nonce_verified_by_renonce_chip() {
        let config = test_config(true);
        let (board, chain, sink) = test_board(&config);
        chain.set_corrupt(addr(0, 1), true);
        feed(&board, 60);
        let mut now = Instant::now();
        run(&board, &mut now, 20);

        let stats = board.stats();
        assert_eq!(stats.renonce.queued, 1);
        assert_eq!(stats.renonce.matched, 1);
        assert_eq!(stats.renonce.bad(), 0);
        assert_eq!(board.renonce_len(), 0);
        // the solution is credited to the chip that found it
        assert_eq!(stats.chip(addr(0, 1)).expect("chip").valid, 1);
        assert_eq!(stats.chip(addr(0, 0)).expect("chip").valid, 0);
        assert!(chain.chip(addr(0, 0)).tasks > 0);
        assert_eq!(sink.solutions().len(), 2 * PER_CHAIN * CHIPS - 1);
    }

    /// Renonce chip reports the solution of block 0 for a record of `suspect`
    fn verify_suspect(suspect: u32) -> (Board, Arc<CollectingSink>) {
        let config = test_config(true);
        let (board, _chain, sink) = test_board(&config);
        let work = test_work(0, 1);
        let pool = Arc::new(WorkSnapshot::new(work.clone(), work.ntime, 0));
        let id = board
            .renonces
            .lock()
            .expect("renonce lock")
            .push(suspect, addr(0, 1), addr(0, 0), Some(pool.clone()), None)
            .expect("push");

        let mask = task::generate_nonce_mask(suspect, config.renonce.mask_bits[0]).expect("mask");
        let mut nonces = [NONCE_SENTINEL; NONCES_PER_READ];
        nonces[0] = TEST_BLOCKS[0].nonce;
        assert!(board.nonces.push(NonceBatch {
            chip: addr(0, 0),
            nonces,
            current: Some(Arc::new(pool.with_mask(mask))),
            previous: None,
            renonce: Some(RenonceTag {
                current: Some(id),
                previous: None,
                completed: Some(id),
            }),
        }));
        assert_eq!(board.process_nonces(Instant::now()), 1);
        (board, sink)
    }

    #[test]
    fn test_renonce_confirms_only_its_region() {
        let nonce = TEST_BLOCKS[0].nonce;
        let (board, sink) = verify_suspect(uncertain_version(nonce));
        let stats = board.stats();
        assert_eq!(stats.renonce.matched, 1);
        assert_eq!(stats.chip(addr(0, 1)).expect("chip").valid, 1);
        assert_eq!(board.renonce_len(), 0);
        assert_eq!(sink.solutions().len(), 1);

        // the solution lies outside the nonce region of the suspect
        let (board, sink) = verify_suspect(uncertain_version(nonce ^ 0x10));
        let stats = board.stats();
        assert_eq!(stats.renonce.matched, 0);
        assert_eq!(stats.chip(addr(0, 1)).expect("chip").valid, 0);
        assert_eq!(stats.chip(addr(0, 0)).expect("chip").valid, 1);
        assert_eq!(board.renonce_len(), 1);
        assert_eq!(sink.solutions().len(), 1);
    }

    /// Sink checking the chip table is free while solutions are submitted
    struct LockCheckingSink {
        board: Mutex<Option<Arc<Board>>>,
        free: Mutex<Vec<bool>>,
    }

    impl NonceSink for LockCheckingSink {
        fn submit(&self, _work: &Arc<PoolWork>, _nonce: u32, _ntime: u32) {
            if let Some(board) = self.board.lock().expect("lock").as_ref() {
                let free = board.chips.try_lock().is_ok();
                self.free.lock().expect("lock").push(free);
            }
        }
    }

    #[test]
    fn test_solutions_submitted_outside_chip_lock() {
        let config = test_config(false);
        let chain = FakeChain::new(0, PER_CHAIN, CHIPS);
        let sink = Arc::new(LockCheckingSink {
            board: Mutex::new(None),
            free: Mutex::new(vec![]),
        });
        let board = Arc::new(
            Board::new(
                &config.boards[0],
                &config,
                Box::new(chain.transport()),
                sink.clone(),
            )
            .expect("board"),
        );
        *sink.board.lock().expect("lock") = Some(board.clone());
        feed(&board, 60);
        let mut now = Instant::now();
        run(&board, &mut now, 10);

        let free = sink.free.lock().expect("lock").clone();
        assert!(free.len() >= PER_CHAIN * CHIPS, "only {} solutions", free.len());
        assert!(free.iter().all(|free| *free), "chip table locked during submit");
    }

    #[test]
    fn test_uncertain_nonce_without_renonce() {
        let config = test_config(false);
        let (board, chain, _sink) = test_board(&config);
        chain.set_corrupt(addr(0, 1), true);
        feed(&board, 60);
        let mut now = Instant::now();
        run(&board, &mut now, 10);

        let stats = board.stats();
        assert_eq!(stats.renonce.queued, 0);
        assert_eq!(stats.chip(addr(0, 1)).expect("chip").errors, 1);
        // without a renonce chip every chip mines
        assert_eq!(stats.valid, 2 * PER_CHAIN as u64 * CHIPS as u64 - 1);
    }

    #[test]
    fn test_transport_failure_recovers() {
        let config = test_config(true);
        let (board, chain, sink) = test_board(&config);
        feed(&board, 60);
        chain.fail_transfers(1);

        let mut now = Instant::now();
        now += Duration::from_millis(50);
        let report = board.run_round(now);
        assert_eq!(report.batches, 1);
        assert_eq!(report.failed_batches, 1);
        for (_, state) in board.chip_states() {
            assert_eq!(state, ChipState::Uninitialized);
        }

        run(&board, &mut now, 10);
        assert_eq!(board.stats().transport_errors, 1);
        assert!(!sink.solutions().is_empty());
    }

    #[test]
    fn test_reset_reconfigures_chips() {
        let config = test_config(true);
        let (board, _chain, _sink) = test_board(&config);
        feed(&board, 60);
        let mut now = Instant::now();
        run(&board, &mut now, 6);

        board.request_reset();
        run(&board, &mut now, 1);
        for (chip, state) in board.chip_states() {
            assert_eq!(state, ChipState::ToggleSet, "chip {}", chip);
        }
    }

    #[test]
    fn test_power_off_flushes() {
        let config = test_config(true);
        let (board, chain, _sink) = test_board(&config);
        feed(&board, 10);
        assert_eq!(board.work_len(), 10);

        board.set_powered(false);
        assert!(!board.is_powered());
        assert!(!board.needs_work());
        assert_eq!(board.work_len(), 0);
        let transfers = chain.transfers();
        assert_eq!(board.run_round(Instant::now()), RoundReport::default());
        assert_eq!(chain.transfers(), transfers);

        board.set_powered(true);
        assert!(board.needs_work());
    }

    #[test]
    fn test_flush() {
        let config = test_config(true);
        let (board, _chain, _sink) = test_board(&config);
        feed(&board, 10);
        board.flush();
        assert_eq!(board.work_len(), 0);
        assert_eq!(board.renonce_len(), 0);
        assert!(board.needs_work());
    }

    #[test]
    fn test_channel_paths() {
        let config = test_config(true);
        let (board, _chain, _sink) = test_board(&config);
        for concentrator in 0..2 * PER_CHAIN {
            let path = board.resolve_channel_path(concentrator).expect("path");
            assert_eq!(path.concentrator(PER_CHAIN), Some(concentrator));
        }
        assert!(board.resolve_channel_path(2 * PER_CHAIN).is_err());
    }

    #[test]
    fn test_reassign_renonce_chip() {
        let config = test_config(true);
        let (board, _chain, _sink) = test_board(&config);
        assert_eq!(board.renonce_chip(), Some(addr(0, 0)));
        assert!(board.chip(addr(0, 0)).expect("chip").renonce);

        board
            .reassign_renonce_chip(Some(addr(1, 2)))
            .expect("reassign");
        assert_eq!(board.renonce_chip(), Some(addr(1, 2)));
        assert!(board.chip(addr(1, 2)).expect("chip").renonce);
        assert!(!board.chip(addr(0, 0)).expect("chip").renonce);

        assert!(board.reassign_renonce_chip(Some(addr(2 * PER_CHAIN, 0))).is_err());
        assert!(board
            .reassign_renonce_chip(Some(ChipAddress::new(1, 0, 0)))
            .is_err());
        assert_eq!(board.renonce_chip(), Some(addr(1, 2)));

        board.reassign_renonce_chip(None).expect("switch off");
        assert_eq!(board.renonce_chip(), None);
        assert!(!board.chip(addr(1, 2)).expect("chip").renonce);
    }

    #[test]
    fn test_reassign_with_renonce_disabled() {
        let config = test_config(false);
        let (board, _chain, _sink) = test_board(&config);
        assert_eq!(board.renonce_chip(), None);
        assert!(board.reassign_renonce_chip(Some(addr(0, 1))).is_err());
        assert!(board.reassign_renonce_chip(None).is_ok());
    }

    #[test]
    fn test_disabled_renonce_chip_is_replaced() {
        let mut config = test_config(true);
        config.timing.max_recovery_attempts = 1;
        let (board, chain, _sink) = test_board(&config);
        // an uncertain nonce gives the renonce chip a task it never finishes
        chain.set_corrupt(addr(0, 1), true);
        chain.set_hang(addr(0, 0), true);
        feed(&board, 60);
        let mut now = Instant::now();
        for _ in 0..20 {
            run(&board, &mut now, 1);
            if board.chip(addr(0, 0)).expect("chip").state == ChipState::TaskSent {
                break;
            }
        }
        assert_eq!(board.chip(addr(0, 0)).expect("chip").state, ChipState::TaskSent);

        chain.set_bad_checksums(addr(0, 0), usize::max_value());
        run(&board, &mut now, 30);

        assert_eq!(board.chip(addr(0, 0)).expect("chip").state, ChipState::Disabled);
        assert_eq!(board.renonce_chip(), Some(addr(0, 1)));
        assert!(board.stats().chip(addr(0, 0)).expect("chip").checksum_errors > 10);
        assert!(board.reassign_renonce_chip(Some(addr(0, 0))).is_err());
    }

    #[test]
    fn test_lost_task_is_written_again() {
        let config = test_config(true);
        let (board, chain, sink) = test_board(&config);
        let chip = addr(1, 1);
        chain.set_hang(chip, true);
        feed(&board, 200);
        let mut now = Instant::now();
        run(&board, &mut now, 8);
        assert_eq!(board.chip(chip).expect("chip").state, ChipState::TaskSent);
        assert_eq!(chain.chip(chip).tasks, 0);

        // chip forgets the written task
        chain.with_chip(chip, |fake| fake.pending = None);
        chain.set_hang(chip, false);
        run(&board, &mut now, 1);
        let record = board.chip(chip).expect("chip");
        assert_eq!(record.state, ChipState::MaskSet);
        assert_eq!(record.task_resends, 1);

        run(&board, &mut now, 4);
        assert_eq!(chain.chip(chip).tasks, 1);
        assert_eq!(board.stats().chip(chip).expect("chip").valid, 1);
        assert!(sink.solutions().len() > 1);
    }

    #[test]
    fn test_init_checksum_errors_retry() {
        let config = test_config(true);
        let (board, chain, _sink) = test_board(&config);
        chain.set_bad_checksums(addr(1, 2), usize::max_value());
        feed(&board, 60);
        let mut now = Instant::now();
        run(&board, &mut now, 40);

        let record = board.chip(addr(1, 2)).expect("chip");
        assert_eq!(record.state, ChipState::Uninitialized);
        assert_eq!(record.recovery_attempts, 0);
        assert!(board.stats().chip(addr(1, 2)).expect("chip").checksum_errors > 30);

        chain.set_bad_checksums(addr(1, 2), 0);
        run(&board, &mut now, 10);
        assert!(board.chip(addr(1, 2)).expect("chip").state.is_hashing());
    }
}
