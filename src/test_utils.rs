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

//! Test helpers: real block headers, a nonce sink collecting solutions and a simulated BF16 chip
//! chain speaking the wire protocol on the other side of the SPI transport.

use crate::bf16::{
    self, ChannelPath, ChipAddress, ChipStatus, Opcode, BROADCAST_CHIP_ID, HOP_DELAY_BITS,
    NONCES_PER_READ, NONCE_SENTINEL, SCRAMBLE_XOR,
};
use crate::error::{self, ErrorKind};
use crate::task::{self, Task, TASK_LEN};
use crate::transport::SpiTransport;
use crate::work::{NonceSink, PoolWork};

use byteorder::{BigEndian, ByteOrder};

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

/// Real blocks used for tests
pub struct TestBlock {
    /// Block hash as displayed by block explorers
    pub hash: &'static str,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
    pub header_bytes: [u8; 80],
}

impl fmt::Debug for TestBlock {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}", self.hash)
    }
}

pub static TEST_BLOCKS: [TestBlock; 3] = [
    // Block 171874 binary representation
    TestBlock {
        hash: "00000000000004b64108a8e4168cfaa890d62b8c061c6b74305b7f6cb2cf9fda",
        time: 1332160020,
        bits: 436941447,
        nonce: 2726756608,
        header_bytes: [
            0x01, 0x00, 0x00, 0x00, 0xb3, 0xae, 0xc1, 0x0c, 0xfb, 0x91, 0xd3, 0x9d, 0x00, 0x5f,
            0x1a, 0x1e, 0x2a, 0x12, 0x7a, 0x81, 0xe4, 0xaf, 0x24, 0x5f, 0xc0, 0xc4, 0xb6, 0xd0,
            0x88, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x7e, 0x6e, 0xbb, 0xf2, 0x03, 0x5c,
            0xab, 0x93, 0x76, 0x13, 0x8a, 0x28, 0xef, 0x23, 0x1f, 0x05, 0x5f, 0xc9, 0xd6, 0x75,
            0x3f, 0xdb, 0x0f, 0x83, 0x09, 0xf3, 0xe9, 0xa0, 0x2f, 0xa7, 0x22, 0xce, 0x14, 0x26,
            0x67, 0x4f, 0x87, 0x32, 0x0b, 0x1a, 0x00, 0x01, 0x87, 0xa2,
        ],
    },
    // Sample block from:
    // https://en.bitcoin.it/wiki/Block_hashing_algorithm
    TestBlock {
        hash: "00000000000000001e8d6829a8a21adc5d38d0a473b144b6765798e61f98bd1d",
        time: 1305998791,
        bits: 440711666,
        nonce: 2504433986,
        header_bytes: [
            0x01, 0x00, 0x00, 0x00, 0x81, 0xcd, 0x02, 0xab, 0x7e, 0x56, 0x9e, 0x8b, 0xcd, 0x93,
            0x17, 0xe2, 0xfe, 0x99, 0xf2, 0xde, 0x44, 0xd4, 0x9a, 0xb2, 0xb8, 0x85, 0x1b, 0xa4,
            0xa3, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xe3, 0x20, 0xb6, 0xc2, 0xff, 0xfc,
            0x8d, 0x75, 0x04, 0x23, 0xdb, 0x8b, 0x1e, 0xb9, 0x42, 0xae, 0x71, 0x0e, 0x95, 0x1e,
            0xd7, 0x97, 0xf7, 0xaf, 0xfc, 0x88, 0x92, 0xb0, 0xf1, 0xfc, 0x12, 0x2b, 0xc7, 0xf5,
            0xd7, 0x4d, 0xf2, 0xb9, 0x44, 0x1a, 0x42, 0xa1, 0x46, 0x95,
        ],
    },
    // Sample block v4:
    TestBlock {
        hash: "00000000000000000024974128beb85f6f39d009538f4d92c64d4b82da8a2660",
        time: 1555576766,
        bits: 388761373,
        nonce: 4115486663,
        header_bytes: [
            0x00, 0x00, 0x00, 0x20, 0x5d, 0x72, 0xc1, 0x7e, 0x52, 0x80, 0x4a, 0x88, 0xcb, 0xda,
            0xf6, 0x4f, 0x1c, 0xab, 0xf2, 0xdf, 0x94, 0x3c, 0x5b, 0x18, 0x17, 0x2b, 0x26, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x14, 0xef, 0x21, 0x43, 0xf9, 0xec,
            0x66, 0x16, 0x82, 0xe8, 0xbd, 0xb0, 0xf3, 0x27, 0x93, 0x7c, 0x06, 0x13, 0x98, 0x02,
            0xda, 0x1f, 0x7c, 0x0c, 0x77, 0x30, 0xd0, 0xd1, 0x04, 0x9e, 0xee, 0x70, 0xbe, 0x37,
            0xb8, 0x5c, 0x1d, 0x07, 0x2c, 0x17, 0xc7, 0x57, 0x4d, 0xf5,
        ],
    },
];

/// Pool work built from test block `block`
pub fn test_work(block: usize, id: u64) -> Arc<PoolWork> {
    Arc::new(PoolWork::from_header(id, &TEST_BLOCKS[block].header_bytes))
}

/// Solution as seen by the nonce sink
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Solution {
    pub work_id: u64,
    pub nonce: u32,
    pub ntime: u32,
}

/// Nonce sink remembering everything it receives
#[derive(Default)]
pub struct CollectingSink {
    solutions: Mutex<Vec<Solution>>,
}

impl CollectingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn solutions(&self) -> Vec<Solution> {
        self.solutions.lock().expect("sink lock").clone()
    }
}

impl NonceSink for CollectingSink {
    fn submit(&self, work: &Arc<PoolWork>, nonce: u32, ntime: u32) {
        self.solutions.lock().expect("sink lock").push(Solution {
            work_id: work.id,
            nonce,
            ntime,
        });
    }
}

/// Transport whose every transfer fails
pub struct FailingTransport;

impl SpiTransport for FailingTransport {
    fn transfer(&mut self, channel: u8, _tx: &[u8], _rx: &mut [u8]) -> error::Result<()> {
        Err(ErrorKind::Transport(channel, "injected failure".to_string()))?
    }
}

/// Nonce reported by a chip hit by the nonce capture race
pub fn uncertain_version(nonce: u32) -> u32 {
    0xaaa0_0000 | (nonce & 0x000f_ffff)
}

/// Simulated BF16 chip
#[derive(Debug, Clone)]
pub struct FakeChip {
    pub parity: bool,
    pub pending: Option<Task>,
    pub current: Option<Task>,
    /// Raw (whitened) nonce slots
    pub slots: [u32; NONCES_PER_READ],
    next_slot: usize,
    /// Never switches to a written task
    pub hang: bool,
    /// Reports every solution as an uncertain nonce
    pub corrupt: bool,
    /// Number of replies still to be sent with a damaged checksum
    pub bad_checksums: usize,
    pub commands: usize,
    pub tasks: usize,
}

impl FakeChip {
    fn new() -> Self {
        Self {
            parity: false,
            pending: None,
            current: None,
            slots: [NONCE_SENTINEL; NONCES_PER_READ],
            next_slot: 0,
            hang: false,
            corrupt: false,
            bad_checksums: 0,
            commands: 0,
            tasks: 0,
        }
    }

    fn status(&self) -> ChipStatus {
        ChipStatus {
            task_parity: self.parity,
            task_pending: self.pending.is_some(),
        }
    }

    fn apply(&mut self, opcode: Opcode, payload: &[u8]) {
        match opcode {
            Opcode::Toggle | Opcode::Reset => {
                self.parity = false;
                self.pending = None;
                self.current = None;
            }
            Opcode::TaskWrite => {
                assert_eq!(payload.len(), TASK_LEN, "task of wrong size");
                let mut task = [0u8; TASK_LEN];
                task.copy_from_slice(payload);
                self.pending = Some(task);
            }
            Opcode::ReadNonce => self.try_switch(),
            Opcode::SetClock | Opcode::SetMask => (),
        }
    }

    fn try_switch(&mut self) {
        if self.hang {
            return;
        }
        if let Some(task) = self.pending.take() {
            self.parity = !self.parity;
            self.tasks += 1;
            self.solve(&task);
            self.current = Some(task);
        }
    }

    /// The only solutions the simulator knows are those of the test blocks
    fn solve(&mut self, task: &Task) {
        let fields = task::parse_task(task);
        for block in TEST_BLOCKS.iter() {
            let nonce = block.nonce;
            let work = PoolWork::from_header(0, &block.header_bytes);
            if work.midstate != fields.midstate
                || work.merkle_tail != fields.merkle_tail
                || work.nbits != fields.nbits
                || !task::mask_covers(fields.mask, nonce)
                || !work.is_valid_nonce(fields.ntime, nonce)
            {
                continue;
            }
            let reported = if self.corrupt {
                uncertain_version(nonce)
            } else {
                nonce
            };
            self.slots[self.next_slot] = reported ^ SCRAMBLE_XOR;
            self.next_slot = (self.next_slot + 1) % NONCES_PER_READ;
        }
    }

    fn reply(&mut self, opcode: Opcode, frame_checksum: u8) -> Vec<u8> {
        let mut checksum = frame_checksum;
        if self.bad_checksums > 0 {
            self.bad_checksums -= 1;
            checksum ^= 0xff;
        }
        let mut reply = vec![self.status().to_byte(), checksum];
        if opcode.reads_nonces() {
            let mut block = [0u8; bf16::NONCE_BLOCK_LEN];
            for (i, slot) in self.slots.iter().enumerate() {
                BigEndian::write_u32(&mut block[i * 4..], *slot);
            }
            reply.extend_from_slice(&block);
            reply.push(bf16::checksum(&block));
        }
        reply
    }
}

struct ChainState {
    per_chain: usize,
    chips_per_concentrator: usize,
    chips: Vec<FakeChip>,
    failing_transfers: usize,
    transfers: usize,
}

impl ChainState {
    fn index(&self, concentrator: usize, chip: u8) -> Option<usize> {
        if concentrator >= 2 * self.per_chain || chip as usize >= self.chips_per_concentrator {
            return None;
        }
        Some(concentrator * self.chips_per_concentrator + chip as usize)
    }

    fn command(
        &mut self,
        concentrator: usize,
        chip: u8,
        opcode: Opcode,
        payload: &[u8],
        frame_checksum: u8,
    ) -> Option<Vec<u8>> {
        if chip == BROADCAST_CHIP_ID {
            let first = concentrator * self.chips_per_concentrator;
            for fake in self.chips[first..first + self.chips_per_concentrator].iter_mut() {
                fake.apply(opcode, payload);
            }
            return Some(vec![0, frame_checksum]);
        }
        let index = self.index(concentrator, chip)?;
        let fake = &mut self.chips[index];
        fake.commands += 1;
        fake.apply(opcode, payload);
        Some(fake.reply(opcode, frame_checksum))
    }

    /// Walk the burst the way the concentrators do: paths select the concentrator, frames are
    /// answered right behind themselves with the hop delay of the current path
    fn process(&mut self, tx: &[u8], rx: &mut [u8]) {
        let mut pos = 0;
        let mut route: Option<(usize, usize)> = None;
        while pos < tx.len() {
            match tx[pos] {
                0 => pos += 1,
                bf16::FRAME_PREFIX => {
                    let (concentrator, depth) =
                        route.expect("command frame outside of an open channel");
                    let chip = tx[pos + 1] >> 4;
                    let opcode = Opcode::from_code(tx[pos + 2])
                        .unwrap_or_else(|| panic!("unknown opcode {:#04x}", tx[pos + 2]));
                    let end = pos + 4 + tx[pos + 3] as usize + 1;
                    let sum = tx[end];
                    assert_eq!(
                        bf16::checksum(&tx[pos + 2..end]),
                        sum,
                        "bad frame checksum: {:#04x?}",
                        &tx[pos..=end]
                    );
                    let reply_offset = end + 1;
                    let reply_len = bf16::reply_len(depth, opcode);
                    if let Some(reply) =
                        self.command(concentrator, chip, opcode, &tx[pos + 4..end], sum)
                    {
                        write_delayed(
                            &mut rx[reply_offset..reply_offset + reply_len],
                            &reply,
                            depth * HOP_DELAY_BITS,
                        );
                    }
                    pos = reply_offset + reply_len;
                }
                _ => {
                    let path = ChannelPath::from_bytes(&tx[pos..]).expect("invalid channel path");
                    let concentrator = path
                        .concentrator(self.per_chain)
                        .expect("path to unknown concentrator");
                    route = Some((concentrator, path.depth()));
                    pos += path.to_bytes().len();
                }
            }
        }
    }
}

/// Place `reply` into the reply area delayed by `shift` bits
fn write_delayed(area: &mut [u8], reply: &[u8], shift: usize) {
    for i in 0..reply.len() * 8 {
        if reply[i / 8] & (0x80 >> (i % 8)) != 0 {
            let pos = i + shift;
            area[pos / 8] |= 0x80 >> (pos % 8);
        }
    }
}

/// Simulated board: two chains of concentrators with BF16 chips behind them
#[derive(Clone)]
pub struct FakeChain {
    state: Arc<Mutex<ChainState>>,
}

impl FakeChain {
    pub fn new(_board: usize, per_chain: usize, chips_per_concentrator: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(ChainState {
                per_chain,
                chips_per_concentrator,
                chips: vec![FakeChip::new(); 2 * per_chain * chips_per_concentrator],
                failing_transfers: 0,
                transfers: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<ChainState> {
        self.state.lock().expect("chain lock")
    }

    /// Transport connected to this chain
    pub fn transport(&self) -> FakeTransport {
        FakeTransport {
            state: self.state.clone(),
        }
    }

    /// Run `f` on the simulated chip at `addr`
    pub fn with_chip<F, R>(&self, addr: ChipAddress, f: F) -> R
    where
        F: FnOnce(&mut FakeChip) -> R,
    {
        let mut state = self.lock();
        let index = state
            .index(addr.concentrator, addr.chip)
            .expect("chip not on the chain");
        f(&mut state.chips[index])
    }

    pub fn chip(&self, addr: ChipAddress) -> FakeChip {
        self.with_chip(addr, |chip| chip.clone())
    }

    pub fn set_corrupt(&self, addr: ChipAddress, corrupt: bool) {
        self.with_chip(addr, |chip| chip.corrupt = corrupt);
    }

    pub fn set_hang(&self, addr: ChipAddress, hang: bool) {
        self.with_chip(addr, |chip| chip.hang = hang);
    }

    pub fn set_bad_checksums(&self, addr: ChipAddress, count: usize) {
        self.with_chip(addr, |chip| chip.bad_checksums = count);
    }

    /// Fail the next `count` transfers
    pub fn fail_transfers(&self, count: usize) {
        self.lock().failing_transfers = count;
    }

    pub fn transfers(&self) -> usize {
        self.lock().transfers
    }
}

pub struct FakeTransport {
    state: Arc<Mutex<ChainState>>,
}

impl SpiTransport for FakeTransport {
    fn transfer(&mut self, channel: u8, tx: &[u8], rx: &mut [u8]) -> error::Result<()> {
        let mut state = self.state.lock().expect("chain lock");
        state.transfers += 1;
        if state.failing_transfers > 0 {
            state.failing_transfers -= 1;
            Err(ErrorKind::Transport(channel, "injected failure".to_string()))?
        }
        assert_eq!(tx.len(), rx.len(), "transfer length mismatch");
        for byte in rx.iter_mut() {
            *byte = 0;
        }
        state.process(tx, rx);
        Ok(())
    }
}
