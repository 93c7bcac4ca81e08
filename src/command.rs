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

//! Command batch buffer
//!
//! Commands for many chips (and the channel open/close paths between them) are packed into a
//! single SPI burst. Every command reserves room for its reply right behind its frame, so after
//! the transfer the replies can be cut out of the receive buffer in the order the commands were
//! pushed.

use crate::bf16::{self, ChannelPath, ChipAddress, Opcode, Reply};
use crate::error::{self, ErrorKind};
use crate::renonce::RenonceId;
use crate::transport::SpiTransport;
use crate::work::WorkSnapshot;

use std::collections::VecDeque;
use std::sync::Arc;

/// Size of a single SPI burst
pub const BUFFER_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    Empty,
    TxReady,
    Executed,
}

/// What a queued entry stands for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    CreateChannel,
    DestroyChannel,
    Chip(Opcode),
}

/// Bookkeeping of a command sitting in the send buffer
#[derive(Debug, Clone)]
struct Entry {
    kind: CommandKind,
    chip: ChipAddress,
    src: ChipAddress,
    work: Option<Arc<WorkSnapshot>>,
    renonce_id: Option<RenonceId>,
    depth: usize,
    reply_offset: usize,
    reply_len: usize,
    checksum: u8,
}

/// Outcome of one command after the batch has been executed
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub kind: CommandKind,
    pub chip: ChipAddress,
    /// Chip the command was issued on behalf of (differs from `chip` for renonce tasks)
    pub src: ChipAddress,
    pub work: Option<Arc<WorkSnapshot>>,
    pub renonce_id: Option<RenonceId>,
    pub depth: usize,
    /// Decoded reply, channel paths have none
    pub reply: Option<Reply>,
}

/// Parameters of a chip command to be queued
#[derive(Debug, Clone)]
pub struct ChipCommand {
    pub chip: ChipAddress,
    pub src: ChipAddress,
    pub opcode: Opcode,
    pub payload: Vec<u8>,
    pub work: Option<Arc<WorkSnapshot>>,
    pub renonce_id: Option<RenonceId>,
}

impl ChipCommand {
    pub fn new(chip: ChipAddress, opcode: Opcode, payload: Vec<u8>) -> Self {
        Self {
            chip,
            src: chip,
            opcode,
            payload,
            work: None,
            renonce_id: None,
        }
    }

    pub fn with_work(mut self, work: Arc<WorkSnapshot>) -> Self {
        self.work = Some(work);
        self
    }

    pub fn with_renonce(mut self, src: ChipAddress, renonce_id: RenonceId) -> Self {
        self.src = src;
        self.renonce_id = Some(renonce_id);
        self
    }

    /// Bytes this command takes in a batch when sent through `depth` hops
    pub fn footprint(&self, depth: usize) -> usize {
        let payload_len = self.payload.len().max(1);
        payload_len + bf16::FRAME_OVERHEAD + bf16::reply_len(depth, self.opcode)
    }
}

pub struct CommandBuffer {
    entries: VecDeque<Entry>,
    tx: Vec<u8>,
    rx: Vec<u8>,
    free_bytes: usize,
    state: BufferState,
}

impl CommandBuffer {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            tx: vec![0; BUFFER_SIZE],
            rx: vec![0; BUFFER_SIZE],
            free_bytes: BUFFER_SIZE,
            state: BufferState::Empty,
        }
    }

    pub fn state(&self) -> BufferState {
        self.state
    }

    pub fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    /// Number of bytes that will be transferred
    pub fn tx_offset(&self) -> usize {
        BUFFER_SIZE - self.free_bytes
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has_room(&self, bytes: usize) -> bool {
        self.state != BufferState::Executed && bytes <= self.free_bytes
    }

    fn check_pushable(&self, required: usize) -> error::Result<()> {
        if self.state == BufferState::Executed {
            Err(ErrorKind::BufferState(
                "cannot push into an executed batch".to_string(),
            ))?
        }
        if required > self.free_bytes {
            Err(ErrorKind::BufferFull(required, self.free_bytes))?
        }
        Ok(())
    }

    fn append(&mut self, bytes: &[u8], reserved: usize) -> (usize, usize) {
        let offset = self.tx_offset();
        self.tx[offset..offset + bytes.len()].copy_from_slice(bytes);
        let reply_offset = offset + bytes.len();
        for byte in self.tx[reply_offset..reply_offset + reserved].iter_mut() {
            *byte = 0;
        }
        self.free_bytes -= bytes.len() + reserved;
        self.state = BufferState::TxReady;
        (offset, reply_offset)
    }

    /// Queue a chip command. Nothing is written when the command does not fit.
    pub fn push(&mut self, depth: usize, command: ChipCommand) -> error::Result<()> {
        let frame = bf16::encode_command(command.chip, depth, command.opcode, &command.payload)?;
        self.check_pushable(frame.footprint())?;

        let (_, reply_offset) = self.append(&frame.bytes, frame.reply_len);
        self.entries.push_back(Entry {
            kind: CommandKind::Chip(command.opcode),
            chip: command.chip,
            src: command.src,
            work: command.work,
            renonce_id: command.renonce_id,
            depth,
            reply_offset,
            reply_len: frame.reply_len,
            checksum: frame.checksum,
        });
        Ok(())
    }

    fn push_path(
        &mut self,
        kind: CommandKind,
        chip: ChipAddress,
        path: &ChannelPath,
    ) -> error::Result<()> {
        let bytes = path.to_bytes();
        self.check_pushable(bytes.len())?;

        let (_, reply_offset) = self.append(&bytes, 0);
        self.entries.push_back(Entry {
            kind,
            chip,
            src: chip,
            work: None,
            renonce_id: None,
            depth: path.depth(),
            reply_offset,
            reply_len: 0,
            checksum: 0,
        });
        Ok(())
    }

    /// Queue the path opening a channel to the concentrator of `chip`
    pub fn push_create_channel(
        &mut self,
        chip: ChipAddress,
        path: &ChannelPath,
    ) -> error::Result<()> {
        self.push_path(CommandKind::CreateChannel, chip, path)
    }

    /// Queue the path closing the channel opened by `path`
    pub fn push_destroy_channel(
        &mut self,
        chip: ChipAddress,
        path: &ChannelPath,
    ) -> error::Result<()> {
        self.push_path(CommandKind::DestroyChannel, chip, &path.destroy())
    }

    /// Run the single SPI transfer of the whole batch. On failure the batch is dropped.
    pub fn execute(
        &mut self,
        transport: &mut dyn SpiTransport,
        channel: u8,
    ) -> error::Result<()> {
        if self.state != BufferState::TxReady {
            Err(ErrorKind::BufferState(format!(
                "cannot execute batch in state {:?}",
                self.state
            )))?
        }
        let len = self.tx_offset();
        let result = transport.transfer(channel, &self.tx[..len], &mut self.rx[..len]);
        if let Err(e) = result {
            self.clear();
            return Err(e);
        }
        self.state = BufferState::Executed;
        Ok(())
    }

    /// Take the result of the oldest command of an executed batch
    pub fn pop(&mut self) -> error::Result<CommandResult> {
        if self.state != BufferState::Executed {
            Err(ErrorKind::BufferState(format!(
                "cannot pop from batch in state {:?}",
                self.state
            )))?
        }
        let entry = match self.entries.pop_front() {
            Some(entry) => entry,
            None => {
                self.clear();
                Err(ErrorKind::Empty)?
            }
        };

        let reply = match entry.kind {
            CommandKind::Chip(opcode) => Some(bf16::decode_reply(
                &self.rx[entry.reply_offset..entry.reply_offset + entry.reply_len],
                entry.depth,
                opcode,
                entry.checksum,
            )?),
            _ => None,
        };
        if self.entries.is_empty() {
            self.clear();
        }

        Ok(CommandResult {
            kind: entry.kind,
            chip: entry.chip,
            src: entry.src,
            work: entry.work,
            renonce_id: entry.renonce_id,
            depth: entry.depth,
            reply,
        })
    }

    /// Drop all queued commands and return to the empty state
    pub fn clear(&mut self) {
        self.entries.clear();
        self.free_bytes = BUFFER_SIZE;
        self.state = BufferState::Empty;
    }
}
