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

//! Driver core for Bitfury BF16 chip chains
//!
//! Every hashboard sits behind one SPI channel. Commands for all of its chips are packed into
//! batches and sent in single bursts, replies are demultiplexed back to per-chip state machines
//! and nonce reads flow through validation (and renonce verification) into a [`work::NonceSink`].

pub mod bf16;
pub mod board;
pub mod chip;
pub mod command;
pub mod config;
pub mod counters;
pub mod error;
pub mod gpio;
pub mod halt;
pub mod logging;
pub mod monitor;
pub mod nonce;
pub mod queue;
pub mod renonce;
pub mod sha256;
pub mod task;
pub mod test_utils;
pub mod transport;
pub mod work;

use crate::bf16::{ChannelPath, ChipAddress};
use crate::board::Board;
use crate::config::Config;
use crate::error::ErrorKind;
use crate::logging::LOGGER;
use crate::monitor::{BoardControl, Monitor};
use crate::transport::{SpiTransport, SpidevTransport};
use crate::work::{NonceSink, PoolWork};

use slog::{debug, info, warn};

use std::sync::Arc;
use std::time::{Duration, Instant};

/// All hashboards of the device together with their workers
pub struct Driver {
    config: Config,
    boards: Vec<Arc<Board>>,
    /// Housekeeping collaborators waiting for their monitor workers
    controls: Vec<(usize, Box<dyn BoardControl>)>,
    halt_sender: Option<halt::Sender>,
}

impl Driver {
    /// Build boards from `config`, one transport per configured board in the same order
    pub fn new(
        config: Config,
        transports: Vec<Box<dyn SpiTransport>>,
        sink: Arc<dyn NonceSink>,
    ) -> error::Result<Self> {
        config.validate()?;
        if transports.len() != config.boards.len() {
            Err(ErrorKind::Config(format!(
                "{} transports for {} boards",
                transports.len(),
                config.boards.len()
            )))?
        }
        let boards = config
            .boards
            .iter()
            .zip(transports)
            .map(|(board_config, transport)| {
                Board::new(board_config, &config, transport, sink.clone()).map(Arc::new)
            })
            .collect::<error::Result<Vec<_>>>()?;
        Ok(Self {
            config,
            boards,
            controls: Vec::new(),
            halt_sender: None,
        })
    }

    /// Open the `spidev` devices named in `config`
    pub fn open(config: Config, sink: Arc<dyn NonceSink>) -> error::Result<Self> {
        let mut transports: Vec<Box<dyn SpiTransport>> = Vec::new();
        for board in config.boards.iter() {
            let transport = SpidevTransport::open(&board.spi_device, board.channel)?;
            transports.push(Box::new(transport));
        }
        Self::new(config, transports, sink)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn boards(&self) -> &[Arc<Board>] {
        &self.boards
    }

    pub fn board(&self, id: usize) -> Option<&Arc<Board>> {
        self.boards.iter().find(|board| board.id == id)
    }

    fn get_board(&self, id: usize) -> error::Result<&Arc<Board>> {
        match self.board(id) {
            Some(board) => Ok(board),
            None => Err(ErrorKind::Board(id, "no such board".to_string()))?,
        }
    }

    /// Let a monitor worker watch board `board` through `control`
    pub fn add_board_control(
        &mut self,
        board: usize,
        control: Box<dyn BoardControl>,
    ) -> error::Result<()> {
        self.get_board(board)?;
        if self.halt_sender.is_some() {
            Err(ErrorKind::Board(
                board,
                "cannot attach board control to a running driver".to_string(),
            ))?
        }
        self.controls.push((board, control));
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.halt_sender.is_some()
    }

    /// Reset all boards and spawn their workers
    pub fn start(&mut self) -> error::Result<()> {
        if self.is_running() {
            Err(ErrorKind::General("driver already running".to_string()))?
        }
        let (sender, receiver) = halt::make_pair();
        // workers of a partially failed start are collected by `stop`
        self.halt_sender = Some(sender);

        for board in self.boards.iter() {
            if let Some(pin) = board.config().reset_gpio {
                info!(LOGGER, "Board {}: resetting via GPIO {}", board.id, pin);
                gpio::reset_board(pin)?;
            }
            board.request_reset();
            self.spawn_board_workers(board, &receiver)?;
        }

        let controls: Vec<_> = self.controls.drain(..).collect();
        for (id, control) in controls {
            let board = self.get_board(id)?.clone();
            let mut monitor = Monitor::new(id, control, self.config.monitor.clone());
            let period = self.config.monitor.period();
            receiver.spawn(format!("monitor-{}", id), move |halt| {
                while !halt.sleep(period) {
                    board.set_powered(monitor.step());
                }
            })?;
        }
        info!(LOGGER, "Driver started with {} boards", self.boards.len());
        Ok(())
    }

    fn spawn_board_workers(
        &self,
        board: &Arc<Board>,
        receiver: &halt::Receiver,
    ) -> error::Result<()> {
        let poll = self.config.timing.worker_poll();
        let stats_period = self.config.timing.stats_period();

        let chip_board = board.clone();
        receiver.spawn(format!("chip-{}", board.id), move |halt| {
            while !halt.sleep(poll) {
                chip_board.run_round(Instant::now());
            }
        })?;

        let nonce_board = board.clone();
        receiver.spawn(format!("nonce-{}", board.id), move |halt| {
            while !halt.sleep(poll) {
                nonce_board.process_nonces(Instant::now());
            }
        })?;

        let renonce_board = board.clone();
        receiver.spawn(format!("renonce-{}", board.id), move |halt| {
            while !halt.sleep(poll) {
                renonce_board.advance_renonces();
            }
        })?;

        let stats_board = board.clone();
        receiver.spawn(format!("stats-{}", board.id), move |halt| {
            while !halt.sleep(stats_period) {
                stats_board.log_stats();
            }
        })?;
        debug!(LOGGER, "Board {}: workers spawned", board.id);
        Ok(())
    }

    /// Stop all workers, waiting at most `timeout` for them to finish
    pub fn stop(&mut self, timeout: Duration) -> error::Result<()> {
        let sender = match self.halt_sender.take() {
            Some(sender) => sender,
            None => return Ok(()),
        };
        sender.send_halt(timeout)?;
        for board in self.boards.iter() {
            board.log_stats();
        }
        info!(LOGGER, "Driver stopped");
        Ok(())
    }

    /// Hand pool work to the powered board with the shortest work queue
    pub fn enqueue_work(&self, work: Arc<PoolWork>) {
        let board = self
            .boards
            .iter()
            .filter(|board| board.is_powered())
            .min_by_key(|board| board.work_len());
        match board {
            Some(board) => board.enqueue_work(work),
            None => warn!(LOGGER, "No powered board, work {} dropped", work.id),
        }
    }

    pub fn needs_work(&self) -> bool {
        self.boards.iter().any(|board| board.needs_work())
    }

    /// Drop queued work, nonce reads and renonce records of all boards (new block, pool switch)
    pub fn flush(&self) {
        for board in self.boards.iter() {
            board.flush();
        }
    }

    pub fn resolve_channel_path(
        &self,
        board: usize,
        concentrator: usize,
    ) -> error::Result<ChannelPath> {
        self.get_board(board)?.resolve_channel_path(concentrator)
    }

    /// Move the renonce role of board `board` to `chip`, `None` switches renonce off there
    pub fn reassign_renonce_chip(
        &self,
        board: usize,
        chip: Option<ChipAddress>,
    ) -> error::Result<()> {
        self.get_board(board)?.reassign_renonce_chip(chip)
    }

    /// Statistics snapshots of all boards
    pub fn stats(&self) -> Vec<counters::HashBoard> {
        self.boards.iter().map(|board| board.stats()).collect()
    }
}
